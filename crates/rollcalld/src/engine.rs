use chrono::Local;
use rollcall_core::attendance::validate_identity;
use rollcall_core::{
    AttendanceDesk, AttendanceLedger, AttendanceRecord, DeskError, EmbeddingExtractor,
    ExtractError, MarkOutcome, StoreError, Student,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Numbered variants tried before an upload name counts as exhausted.
const MAX_UPLOAD_SUFFIX: u32 = 1000;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extractor error: {0}")]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Desk(#[from] DeskError),
    #[error("failed to store uploaded image {path}: {source}")]
    Upload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A successful registration.
#[derive(Debug, Clone)]
pub struct Registered {
    pub student_id: String,
    pub name: String,
    pub image_path: PathBuf,
}

/// Snapshot of engine state for the status call.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub enrolled_faces: usize,
    pub tolerance: f32,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        student_id: String,
        name: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Registered, EngineError>>,
    },
    Mark {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MarkOutcome, EngineError>>,
    },
    Reports {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<AttendanceRecord>, EngineError>>,
    },
    Students {
        reply: oneshot::Sender<Result<Vec<Student>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Register a student from a photo: first detected face is enrolled.
    pub async fn register(
        &self,
        student_id: String,
        name: String,
        image: Vec<u8>,
    ) -> Result<Registered, EngineError> {
        self.call(|reply| EngineRequest::Register {
            student_id,
            name,
            image,
            reply,
        })
        .await?
    }

    /// Recognize the face(s) in a photo and record attendance.
    pub async fn mark(&self, image: Vec<u8>) -> Result<MarkOutcome, EngineError> {
        self.call(|reply| EngineRequest::Mark { image, reply }).await?
    }

    pub async fn reports(&self, limit: usize) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.call(|reply| EngineRequest::Reports { limit, reply })
            .await?
    }

    pub async fn students(&self) -> Result<Vec<Student>, EngineError> {
        self.call(|reply| EngineRequest::Students { reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    /// Flush the gallery and stop the engine thread.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Shutdown { reply }).await?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread exclusively owns the extractor and the desk, so requests are
/// handled one at a time.
pub fn spawn_engine<E, L>(
    mut extractor: E,
    desk: AttendanceDesk<L>,
    upload_dir: PathBuf,
) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + Send + 'static,
    L: AttendanceLedger + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(faces = desk.gallery().len(), "engine thread started");
            let mut desk = Some(desk);
            while let Some(req) = rx.blocking_recv() {
                let Some(d) = desk.as_mut() else {
                    break;
                };
                match req {
                    EngineRequest::Register {
                        student_id,
                        name,
                        image,
                        reply,
                    } => {
                        let result =
                            run_register(&mut extractor, d, &upload_dir, &student_id, &name, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Mark { image, reply } => {
                        let result = run_mark(&mut extractor, d, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reports { limit, reply } => {
                        let _ = reply.send(d.reports(limit).map_err(EngineError::from));
                    }
                    EngineRequest::Students { reply } => {
                        let _ = reply.send(d.students().map_err(EngineError::from));
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            enrolled_faces: d.gallery().len(),
                            tolerance: d.tolerance(),
                        });
                    }
                    EngineRequest::Shutdown { reply } => {
                        let result = desk
                            .take()
                            .map(|d| d.close().map_err(EngineError::from))
                            .unwrap_or(Ok(()));
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
            if let Some(d) = desk {
                if let Err(err) = d.close() {
                    tracing::warn!(error = %err, "gallery flush on exit failed");
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Base name and extension for a stored registration photo: `<id>_<name>`,
/// with anything outside `[A-Za-z0-9.-]` replaced by `_`.
fn upload_file_stem(student_id: &str, name: &str, image: &[u8]) -> (String, &'static str) {
    let ext = image::guess_format(image)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("img");
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    (format!("{}_{}", clean(student_id), clean(name)), ext)
}

/// Write `image` into `upload_dir` without replacing any existing photo.
///
/// The bytes go to a temp file first; it is then linked under
/// `<stem>.<ext>`, or `<stem>-<n>.<ext>` when that name is taken.
fn store_upload(
    upload_dir: &Path,
    student_id: &str,
    name: &str,
    image: &[u8],
) -> Result<PathBuf, EngineError> {
    let upload_err = |path: &Path, source: std::io::Error| EngineError::Upload {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(upload_dir).map_err(|e| upload_err(upload_dir, e))?;
    let mut tmp = NamedTempFile::new_in(upload_dir).map_err(|e| upload_err(upload_dir, e))?;
    tmp.write_all(image)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| upload_err(tmp.path(), e))?;

    let (stem, ext) = upload_file_stem(student_id, name, image);
    let mut last = upload_dir.join(format!("{stem}.{ext}"));
    for n in 0..MAX_UPLOAD_SUFFIX {
        let path = if n == 0 {
            upload_dir.join(format!("{stem}.{ext}"))
        } else {
            upload_dir.join(format!("{stem}-{n}.{ext}"))
        };
        match tmp.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                tmp = err.file;
                last = path;
            }
            Err(err) => return Err(upload_err(&path, err.error)),
        }
    }
    Err(upload_err(
        &last,
        std::io::Error::from(std::io::ErrorKind::AlreadyExists),
    ))
}

fn run_register<E, L>(
    extractor: &mut E,
    desk: &mut AttendanceDesk<L>,
    upload_dir: &Path,
    student_id: &str,
    name: &str,
    image: &[u8],
) -> Result<Registered, EngineError>
where
    E: EmbeddingExtractor,
    L: AttendanceLedger,
{
    let (student_id, name) = validate_identity(student_id, name)?;
    // Nothing touches the upload directory until the request is known to be valid.
    if desk.is_registered(student_id)? {
        return Err(DeskError::AlreadyRegistered(student_id.to_string()).into());
    }
    let faces = extractor.extract(image)?;
    tracing::debug!(student_id, faces = faces.len(), "register: embeddings extracted");
    if faces.is_empty() {
        return Err(DeskError::Store(StoreError::NoFaceDetected).into());
    }

    let image_path = store_upload(upload_dir, student_id, name, image)?;
    let path_str = image_path.to_string_lossy().into_owned();
    match desk.register(student_id, name, &faces, Some(&path_str)) {
        Ok((student_id, name)) => Ok(Registered {
            student_id,
            name,
            image_path,
        }),
        Err(err) => {
            if let Err(rm) = std::fs::remove_file(&image_path) {
                tracing::warn!(error = %rm, path = %image_path.display(), "failed to remove upload");
            }
            Err(err.into())
        }
    }
}

fn run_mark<E, L>(
    extractor: &mut E,
    desk: &AttendanceDesk<L>,
    image: &[u8],
) -> Result<MarkOutcome, EngineError>
where
    E: EmbeddingExtractor,
    L: AttendanceLedger,
{
    let faces = extractor.extract(image)?;
    tracing::debug!(faces = faces.len(), "mark: embeddings extracted");
    Ok(desk.mark(&faces, Local::now().naive_local())?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rollcall_core::{Embedding, GalleryStore, MatchOutcome, SqliteLedger};
    use tempfile::TempDir;

    /// Reads "images" of the form `1,0,0;0,1,0`: one embedding per `;`.
    pub(crate) struct TextExtractor;

    impl EmbeddingExtractor for TextExtractor {
        fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ExtractError> {
            let text = String::from_utf8_lossy(image);
            Ok(text
                .split(';')
                .filter(|s| !s.trim().is_empty())
                .map(|face| {
                    Embedding::new(
                        face.split(',')
                            .filter_map(|v| v.trim().parse().ok())
                            .collect(),
                    )
                })
                .collect())
        }
    }

    pub(crate) fn spawn_test_engine(dir: &TempDir) -> EngineHandle {
        let gallery = GalleryStore::open(dir.path().join("faces.json"));
        let ledger = SqliteLedger::open(&dir.path().join("attendance.db")).unwrap();
        let desk = AttendanceDesk::new(gallery, ledger, 0.6);
        spawn_engine(TextExtractor, desk, dir.path().join("uploads")).unwrap()
    }

    fn uploads(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(dir.path().join("uploads")) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    #[test]
    fn test_upload_file_stem() {
        assert_eq!(
            upload_file_stem("S1", "Alice Smith", b"1,0"),
            ("S1_Alice_Smith".to_string(), "img")
        );
        assert_eq!(
            upload_file_stem("../etc", "x/y", b"1,0"),
            (".._etc_x_y".to_string(), "img")
        );
        let png = b"\x89PNG\r\n\x1a\n\0\0\0\0";
        assert_eq!(upload_file_stem("S2", "Bob", png), ("S2_Bob".to_string(), "png"));
    }

    #[test]
    fn test_store_upload_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let upload_dir = dir.path().join("uploads");
        let first = store_upload(&upload_dir, "A_B", "C", b"first").unwrap();
        let second = store_upload(&upload_dir, "A", "B_C", b"second").unwrap();

        assert_eq!(first.file_name().unwrap(), "A_B_C.img");
        assert_eq!(second.file_name().unwrap(), "A_B_C-1.img");
        assert_eq!(std::fs::read(&first).unwrap(), b"first");
        assert_eq!(std::fs::read(&second).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_register_then_mark() {
        let dir = TempDir::new().unwrap();
        let engine = spawn_test_engine(&dir);

        let reg = engine
            .register("S1".into(), "Alice".into(), b"1,0,0".to_vec())
            .await
            .unwrap();
        assert_eq!(reg.student_id, "S1");
        assert!(reg.image_path.exists());

        let first = engine.mark(b"0,1,0;1,0,0".to_vec()).await.unwrap();
        assert!(matches!(first, MarkOutcome::Marked { ref student_id, .. } if student_id == "S1"));

        let again = engine.mark(b"1,0,0".to_vec()).await.unwrap();
        assert!(matches!(again, MarkOutcome::AlreadyMarked { .. }));

        assert_eq!(engine.reports(100).await.unwrap().len(), 1);
        assert_eq!(engine.students().await.unwrap().len(), 1);
        assert_eq!(engine.status().await.unwrap().enrolled_faces, 1);
    }

    #[tokio::test]
    async fn test_register_without_face_removes_upload() {
        let dir = TempDir::new().unwrap();
        let engine = spawn_test_engine(&dir);

        let err = engine
            .register("S1".into(), "Alice".into(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Desk(DeskError::Store(StoreError::NoFaceDetected))
        ));
        assert!(uploads(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_register_keeps_existing_photo() {
        let dir = TempDir::new().unwrap();
        let engine = spawn_test_engine(&dir);
        let reg = engine
            .register("S1".into(), "Alice".into(), b"1,0,0".to_vec())
            .await
            .unwrap();

        let err = engine
            .register("S1".into(), "Alice".into(), b"0,1,0".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Desk(DeskError::AlreadyRegistered(ref id)) if id == "S1"
        ));

        assert_eq!(std::fs::read(&reg.image_path).unwrap(), b"1,0,0");
        assert_eq!(uploads(&dir), vec!["S1_Alice.img".to_string()]);
        let students = engine.students().await.unwrap();
        let stored = students[0].image_path.as_deref().unwrap();
        assert!(std::path::Path::new(stored).exists());
    }

    #[tokio::test]
    async fn test_colliding_upload_names_both_kept() {
        let dir = TempDir::new().unwrap();
        let engine = spawn_test_engine(&dir);
        let first = engine
            .register("A_B".into(), "C".into(), b"1,0,0".to_vec())
            .await
            .unwrap();
        let second = engine
            .register("A".into(), "B_C".into(), b"0,1,0".to_vec())
            .await
            .unwrap();

        assert_ne!(first.image_path, second.image_path);
        assert_eq!(std::fs::read(&first.image_path).unwrap(), b"1,0,0");
        assert_eq!(std::fs::read(&second.image_path).unwrap(), b"0,1,0");
    }

    #[tokio::test]
    async fn test_mark_unknown_face() {
        let dir = TempDir::new().unwrap();
        let engine = spawn_test_engine(&dir);
        engine
            .register("S1".into(), "Alice".into(), b"1,0,0".to_vec())
            .await
            .unwrap();
        let outcome = engine.mark(b"0,0,1".to_vec()).await.unwrap();
        assert_eq!(outcome, MarkOutcome::NotRecognized(MatchOutcome::NoMatch));
    }

    #[tokio::test]
    async fn test_shutdown_persists_and_closes_channel() {
        let dir = TempDir::new().unwrap();
        let engine = spawn_test_engine(&dir);
        engine
            .register("S1".into(), "Alice".into(), b"0.5,0.5".to_vec())
            .await
            .unwrap();
        engine.shutdown().await.unwrap();

        assert!(matches!(
            engine.status().await,
            Err(EngineError::ChannelClosed)
        ));
        let reopened = GalleryStore::open(dir.path().join("faces.json"));
        assert!(reopened.contains("S1"));
    }
}
