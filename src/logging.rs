//! Logging bootstrap: structured events to `app.log` and stderr.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use wxbackup::config::LOG_FILE;

/// Installs the global subscriber.
///
/// The returned guard must stay alive for the life of the process; the
/// file writer is non-blocking and flushes on drop.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    let file = tracing_appender::rolling::daily(log_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file_writer.and(std::io::stderr))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}
