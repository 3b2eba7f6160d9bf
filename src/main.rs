// wxbackup - forensic backup tool for WeChat desktop data.
//
// Key recovery: device-marker scan over the live process's module image
// Database format: PBKDF2-HMAC-SHA1 + AES-256-CBC, 4096-byte pages
// Export: five phases over bounded worker pools, one progress stream

mod allocator;
mod cli;
mod logging;

use std::path::Path;
use std::process;

use crate::cli::App;
use wxbackup::config::APP_NAME;

#[tokio::main]
async fn main() {
    let app = App::init();

    let _log_guard = match logging::init(Path::new(".")) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("logging unavailable: {err}");
            None
        }
    };
    tracing::info!("====================== {APP_NAME} ======================");

    if let Err(err) = app.execute().await {
        eprintln!("Error: {err:?}");
        process::exit(1);
    }
}
