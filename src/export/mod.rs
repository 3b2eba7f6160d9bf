//! The export orchestrator: five sequential phases from an account's
//! encrypted source tree to a self-contained decrypted mirror.
//!
//! Each phase is a producer feeding a bounded channel, a fixed worker
//! pool draining it, and a reporter ticking progress once per second.
//! Phases run strictly in order because the voice and head-image phases
//! read databases the first phase produces. Per-task failures are
//! reported on the progress stream and never stop a phase; only
//! pre-flight failures end the session early.

pub(crate) mod phase;
pub mod progress;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{Connection, OpenFlags};
use walkdir::WalkDir;

use crate::database;
use crate::error::ExportError;
use crate::image;
use crate::media::Transcoder;
use crate::scout::DbKey;
use self::phase::{PhaseState, PhaseWindow, Reporter, run_workers};
use self::progress::{ProgressEvent, ProgressSender};

const DB_WINDOW: PhaseWindow = PhaseWindow { low: 1, high: 20 };
const DAT_WINDOW: PhaseWindow = PhaseWindow { low: 21, high: 40 };
const FILE_WINDOW: PhaseWindow = PhaseWindow { low: 41, high: 60 };
const VOICE_WINDOW: PhaseWindow = PhaseWindow { low: 61, high: 80 };
const HEAD_WINDOW: PhaseWindow = PhaseWindow { low: 81, high: 100 };

const DB_WORKERS: usize = 19;
const DAT_WORKERS: usize = 29;
const FILE_WORKERS: usize = 29;
const VOICE_WORKERS: usize = 20;
const HEAD_WORKERS: usize = 20;

/// Database tasks queue shallow; each one is minutes of PBKDF2 and I/O.
const DB_QUEUE: usize = 20;
const TASK_QUEUE: usize = 100;

/// What to export and with which key.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub account: String,
    /// Account data root of the live installation.
    pub source: PathBuf,
    pub key: DbKey,
}

/// One full export run. Owns its channels and worker pools; the progress
/// sender closes exactly once, when the session is dropped at the end of
/// [`ExportSession::run`].
pub struct ExportSession {
    request: ExportRequest,
    dest: PathBuf,
    transcoder: Option<Arc<Transcoder>>,
    progress: ProgressSender,
}

/// Runs the whole pipeline; convenience wrapper over [`ExportSession`].
pub async fn export_all(
    request: ExportRequest,
    dest: PathBuf,
    transcoder: Option<Arc<Transcoder>>,
    progress: ProgressSender,
) -> Result<(), ExportError> {
    ExportSession::new(request, dest, transcoder, progress).run().await
}

struct FileTask {
    src: PathBuf,
    dst: PathBuf,
}

struct VoiceTask {
    msg_svr_id: i64,
    buf: Vec<u8>,
}

struct HeadImgTask {
    user: String,
    buf: Vec<u8>,
}

impl ExportSession {
    pub fn new(
        request: ExportRequest,
        dest: PathBuf,
        transcoder: Option<Arc<Transcoder>>,
        progress: ProgressSender,
    ) -> Self {
        Self { request, dest, transcoder, progress }
    }

    /// Drives all five phases to completion.
    ///
    /// Pre-flight failures are emitted on the stream and returned; phase
    /// internals only ever emit. The progress stream closes on every
    /// return path.
    pub async fn run(self) -> Result<(), ExportError> {
        if let Err(err) = self.preflight() {
            let _ = self.progress.send(ProgressEvent::error(err.to_string()));
            return Err(err);
        }

        self.run_database_phase().await;
        self.run_dat_phase().await;
        self.run_copy_phase().await;
        self.run_voice_phase().await;
        self.run_head_image_phase().await;

        Ok(())
    }

    /// Source must be a directory, destination must take a canary write.
    fn preflight(&self) -> Result<(), ExportError> {
        if !self.request.source.is_dir() {
            return Err(ExportError::BadSource(self.request.source.clone()));
        }

        fs::create_dir_all(&self.dest)?;
        let canary = self.dest.join(".write-probe");
        if fs::write(&canary, b"probe").and_then(|()| fs::remove_file(&canary)).is_err() {
            return Err(ExportError::DestinationNotWritable(self.dest.clone()));
        }
        Ok(())
    }

    /// Phase 1: every `Msg/**/*.db`, decrypted; `xInfo.db` copied as-is.
    async fn run_database_phase(&self) {
        let state = PhaseState::new("export databases", DB_WINDOW, self.progress.clone());
        let key = self.request.key.clone();
        let op: FileOp = Arc::new(move |src, dst| {
            if src.file_name().is_some_and(|name| name == "xInfo.db") {
                fs::copy(src, dst)
                    .map(drop)
                    .map_err(|err| format!("copy {}: {err}", src.display()))
            } else {
                database::decrypt_database(src, key.as_bytes(), dst)
                    .map_err(|err| format!("{}: {err}", src.display()))
            }
        });

        self.run_file_phase(state, DB_WORKERS, DB_QUEUE, vec![self.request.source.join("Msg")], Some(".db"), op)
            .await;
    }

    /// Phase 2: attachment and image `.dat` files, de-obfuscated.
    async fn run_dat_phase(&self) {
        let state = PhaseState::new("export image dats", DAT_WINDOW, self.progress.clone());
        let storage = self.request.source.join("FileStorage");
        let op: FileOp = Arc::new(|src, dst| {
            image::decrypt_dat(src, dst).map_err(|err| format!("{}: {err}", src.display()))
        });

        self.run_file_phase(
            state,
            DAT_WORKERS,
            TASK_QUEUE,
            vec![storage.join("MsgAttach"), storage.join("Image")],
            Some(".dat"),
            op,
        )
        .await;
    }

    /// Phase 3: videos, shared files, and cache, copied byte for byte.
    async fn run_copy_phase(&self) {
        let state = PhaseState::new("export videos and files", FILE_WINDOW, self.progress.clone());
        let storage = self.request.source.join("FileStorage");
        let op: FileOp = Arc::new(|src, dst| {
            fs::copy(src, dst)
                .map(drop)
                .map_err(|err| format!("copy {}: {err}", src.display()))
        });

        self.run_file_phase(
            state,
            FILE_WORKERS,
            TASK_QUEUE,
            vec![storage.join("Video"), storage.join("File"), storage.join("Cache")],
            None,
            op,
        )
        .await;
    }

    /// The shared tree-mirroring skeleton of phases 1–3.
    async fn run_file_phase(
        &self,
        state: Arc<PhaseState>,
        workers: usize,
        queue: usize,
        roots: Vec<PathBuf>,
        suffix: Option<&'static str>,
        op: FileOp,
    ) {
        state.announce_start();
        state.set_total(count_files(&roots, suffix));

        let (tx, rx) = flume::bounded(queue);
        let producer = {
            let state = Arc::clone(&state);
            let source = self.request.source.clone();
            let dest = self.dest.clone();
            tokio::task::spawn_blocking(move || {
                produce_file_tasks(&roots, suffix, &source, &dest, &tx, &state);
            })
        };
        let reporter = Reporter::spawn(Arc::clone(&state));

        let handler = {
            let state = Arc::clone(&state);
            Arc::new(move |task: FileTask| {
                // Pre-existing outputs make re-runs cheap no-ops.
                if !task.dst.exists()
                    && let Err(message) = op(&task.src, &task.dst)
                {
                    state.task_error(message);
                }
                state.task_handled();
            })
        };
        run_workers(workers, rx, handler).await;

        let _ = producer.await;
        reporter.stop().await;
        state.announce_end();
    }

    /// Phase 4: every `Media` row of the decrypted `MediaMSG*.db`
    /// databases, transcoded to `{MsgSvrID}.mp3`.
    ///
    /// `total` counts databases, not rows, and the producer advances
    /// `handled` as it finishes each one. Without an injected transcoder
    /// the phase emits only its boundary messages.
    async fn run_voice_phase(&self) {
        let state = PhaseState::new("export voice notes", VOICE_WINDOW, self.progress.clone());
        state.announce_start();

        let multi = self.dest.join("Msg").join("Multi");
        let voice_dir = self.dest.join("FileStorage").join("Voice");

        let mut total = 0u64;
        while multi.join(format!("MediaMSG{total}.db")).is_file() {
            total += 1;
        }
        state.set_total(total);

        let transcoder = match (&self.transcoder, total) {
            (Some(transcoder), 1..) => Arc::clone(transcoder),
            _ => {
                state.announce_end();
                return;
            }
        };

        if let Err(err) = fs::create_dir_all(&voice_dir) {
            state.task_error(format!("create {}: {err}", voice_dir.display()));
            state.announce_end();
            return;
        }

        let (tx, rx) = flume::bounded(TASK_QUEUE);
        let producer = {
            let state = Arc::clone(&state);
            tokio::task::spawn_blocking(move || {
                for index in 0.. {
                    let db_path = multi.join(format!("MediaMSG{index}.db"));
                    if !db_path.is_file() {
                        break;
                    }
                    if let Err(err) = produce_voice_rows(&db_path, &tx) {
                        state.task_error(format!("{}: {err}", db_path.display()));
                    }
                    state.task_handled();
                }
            })
        };
        let reporter = Reporter::spawn(Arc::clone(&state));

        let handler = {
            let state = Arc::clone(&state);
            Arc::new(move |task: VoiceTask| {
                let mp3 = voice_dir.join(format!("{}.mp3", task.msg_svr_id));
                if mp3.exists() {
                    return;
                }
                if let Err(err) = transcoder.silk_to_mp3(&task.buf, &mp3) {
                    state.task_error(format!("transcode {}: {err}", mp3.display()));
                }
            })
        };
        run_workers(VOICE_WORKERS, rx, handler).await;

        let _ = producer.await;
        reporter.stop().await;
        state.announce_end();
    }

    /// Phase 5: every `ContactHeadImg1` row of the decrypted `Misc.db`,
    /// written out as `{userName}.headimg`.
    async fn run_head_image_phase(&self) {
        let state = PhaseState::new("export head images", HEAD_WINDOW, self.progress.clone());
        state.announce_start();

        let misc = self.dest.join("Msg").join("Misc.db");
        let head_dir = self.dest.join("FileStorage").join("HeadImage");

        if !misc.is_file() {
            state.announce_end();
            return;
        }
        if let Err(err) = fs::create_dir_all(&head_dir) {
            state.task_error(format!("create {}: {err}", head_dir.display()));
            state.announce_end();
            return;
        }

        let (tx, rx) = flume::bounded(TASK_QUEUE);
        let producer = {
            let state = Arc::clone(&state);
            tokio::task::spawn_blocking(move || {
                if let Err(err) = produce_head_images(&misc, &tx, &state) {
                    state.task_error(format!("{}: {err}", misc.display()));
                }
            })
        };
        let reporter = Reporter::spawn(Arc::clone(&state));

        let handler = {
            let state = Arc::clone(&state);
            Arc::new(move |task: HeadImgTask| {
                let img = head_dir.join(format!("{}.headimg", task.user));
                if !img.exists()
                    && !task.user.is_empty()
                    && !task.buf.is_empty()
                    && let Err(err) = fs::write(&img, &task.buf)
                {
                    state.task_error(format!("write {}: {err}", img.display()));
                }
                state.task_handled();
            })
        };
        run_workers(HEAD_WORKERS, rx, handler).await;

        let _ = producer.await;
        reporter.stop().await;
        state.announce_end();
    }
}

type FileOp = Arc<dyn Fn(&Path, &Path) -> Result<(), String> + Send + Sync>;

/// Counts regular files under `roots` with the given name suffix.
fn count_files(roots: &[PathBuf], suffix: Option<&str>) -> u64 {
    roots
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().flatten())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| matches_suffix(entry.path(), suffix))
        .count() as u64
}

fn matches_suffix(path: &Path, suffix: Option<&str>) -> bool {
    match suffix {
        Some(suffix) => path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(suffix)),
        None => true,
    }
}

/// Walks the roots and queues one task per matching file, creating
/// destination parents as it goes. Blocks on channel backpressure.
fn produce_file_tasks(
    roots: &[PathBuf],
    suffix: Option<&str>,
    source: &Path,
    dest: &Path,
    tx: &flume::Sender<FileTask>,
    state: &PhaseState,
) {
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    state.task_error(format!("walk: {err}"));
                    continue;
                }
            };
            if !entry.file_type().is_file() || !matches_suffix(entry.path(), suffix) {
                continue;
            }

            let Ok(rel) = entry.path().strip_prefix(source) else {
                continue;
            };
            let dst = dest.join(rel);
            if let Some(parent) = dst.parent()
                && !parent.exists()
                && let Err(err) = fs::create_dir_all(parent)
            {
                state.task_error(format!("create {}: {err}", parent.display()));
                continue;
            }

            let task = FileTask { src: entry.path().to_path_buf(), dst };
            if tx.send(task).is_err() {
                return;
            }
        }
    }
}

/// Streams the `Media` rows of one voice database into the task queue.
///
/// The connection and statement are scoped to this call; they close on
/// success and on error alike.
fn produce_voice_rows(db_path: &Path, tx: &flume::Sender<VoiceTask>) -> Result<(), rusqlite::Error> {
    let db = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = db.prepare("select Reserved0, Buf from Media;")?;
    let rows = stmt.query_map([], |row| {
        Ok(VoiceTask { msg_svr_id: row.get(0)?, buf: row.get(1)? })
    })?;

    for row in rows {
        if tx.send(row?).is_err() {
            break;
        }
    }
    Ok(())
}

/// Streams the `ContactHeadImg1` rows of `Misc.db` into the task queue,
/// publishing the row count as the phase total first.
fn produce_head_images(
    misc: &Path,
    tx: &flume::Sender<HeadImgTask>,
    state: &PhaseState,
) -> Result<(), rusqlite::Error> {
    let db = Connection::open_with_flags(misc, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let total: i64 = db.query_row("select count(*) from ContactHeadImg1;", [], |row| row.get(0))?;
    state.set_total(total.max(0) as u64);

    let mut stmt = db.prepare("select usrName, smallHeadBuf from ContactHeadImg1;")?;
    let rows = stmt.query_map([], |row| {
        let user: Option<String> = row.get(0)?;
        let buf: Option<Vec<u8>> = row.get(1)?;
        Ok(HeadImgTask { user: user.unwrap_or_default(), buf: buf.unwrap_or_default() })
    })?;

    for row in rows {
        if tx.send(row?).is_err() {
            break;
        }
    }
    Ok(())
}
