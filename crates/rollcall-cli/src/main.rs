use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from a face photo
    Register {
        /// Student ID (must be unique)
        #[arg(short, long)]
        id: String,
        /// Student name
        #[arg(short, long)]
        name: String,
        /// Photo containing the student's face
        image: PathBuf,
    },
    /// Mark attendance from a photo
    Mark {
        /// Photo to recognize
        image: PathBuf,
    },
    /// Show recent attendance records
    Reports {
        /// Maximum number of records
        #[arg(short, long, default_value_t = 100)]
        limit: u32,
    },
    /// List registered students
    Students,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register(&self, student_id: &str, name: &str, image: &[u8]) -> zbus::Result<String>;
    async fn mark_attendance(&self, image: &[u8]) -> zbus::Result<String>;
    async fn reports(&self, limit: u32) -> zbus::Result<String>;
    async fn students(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Read a photo and make sure it is in a format the daemon can decode.
fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if image::guess_format(&bytes).is_err() {
        bail!("{} is not a supported image file", path.display());
    }
    Ok(bytes)
}

fn print_reply(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match cli.command {
        Commands::Register { id, name, image } => {
            let bytes = read_image(&image)?;
            tracing::debug!(bytes = bytes.len(), "sending registration photo");
            proxy.register(&id, &name, &bytes).await?
        }
        Commands::Mark { image } => {
            let bytes = read_image(&image)?;
            proxy.mark_attendance(&bytes).await?
        }
        Commands::Reports { limit } => proxy.reports(limit).await?,
        Commands::Students => proxy.students().await?,
        Commands::Status => proxy.status().await?,
    };

    print_reply(&reply)
}
