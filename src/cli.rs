//! CLI commands and argument parsing.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use wxbackup::export::progress;
use wxbackup::export::{self, ExportRequest};
use wxbackup::registry::Registry;
use wxbackup::scout::DbKey;
use wxbackup::server;

/// wxbackup - decrypt and browse WeChat desktop data.
#[derive(Parser)]
#[command(name = "wxbackup", version)]
#[command(about = "Recover the database key from a running WeChat, export a decrypted mirror of an account, and serve it over HTTP.")]
pub struct App {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List running instances and recover their database keys.
    Scan,

    /// Export one account into the export tree.
    Export {
        /// Account to export; defaults to the only running instance.
        #[arg(short, long)]
        account: Option<String>,

        /// Source account directory, for offline use with --key.
        #[arg(long, requires = "key")]
        source: Option<PathBuf>,

        /// Database key as 64 hex characters, for offline use.
        #[arg(long, requires = "source")]
        key: Option<String>,

        /// Export root directory.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },

    /// Serve the export tree over HTTP with range support.
    Serve {
        /// Export root directory.
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Listening port.
        #[arg(short, long, default_value_t = 7890)]
        port: u16,
    },

    /// List exported accounts; the active one is starred.
    Accounts {
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },

    /// Switch the active account.
    Switch {
        account: String,

        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },

    /// Build a self-contained, shareable copy of one account.
    Share {
        #[arg(short, long)]
        account: String,

        /// Directory the share is created under.
        #[arg(short, long)]
        dest: PathBuf,

        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
}

impl App {
    pub fn init() -> Self {
        Self::parse()
    }

    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Scan => scan(),
            Commands::Export { account, source, key, root } => {
                export(account, source, key, root).await
            }
            Commands::Serve { root, port } => {
                server::serve(root, port).await.context("file server failed")
            }
            Commands::Accounts { root } => list_accounts(&root),
            Commands::Switch { account, root } => {
                let registry = Registry::open(&root)?;
                registry.switch_account(&account)?;
                println!("{} active account is now {account}", style("✓").green());
                Ok(())
            }
            Commands::Share { account, dest, root } => {
                let registry = Registry::open(&root)?;
                let target = registry.export_portable(&account, &dest)?;
                println!("{} share created at {}", style("✓").green(), target.display());
                Ok(())
            }
        }
    }
}

#[cfg(windows)]
fn scan() -> Result<()> {
    use bytesize::ByteSize;
    use comfy_table::Table;
    use wxbackup::scout::windows::WindowsEnumerator;
    use wxbackup::scout::{ProcessEnumerator, scan_instances};

    let enumerator = WindowsEnumerator;
    let instances = scan_instances(&enumerator)?;
    if instances.is_empty() {
        println!("no logged-in instance found");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(["PID", "Account", "Version", "Arch", "Module", "Key"]);
    for instance in &instances {
        let key = enumerator
            .open(instance.pid)
            .and_then(|access| wxbackup::scout::recover_key(access.as_ref(), instance))
            .map(|key| key.to_hex())
            .unwrap_or_else(|err| format!("({err})"));

        table.add_row([
            instance.pid.to_string(),
            instance.account.clone(),
            instance.version.clone(),
            if instance.is_64bit { "x64".into() } else { "x86".into() },
            ByteSize::b(instance.module_size as u64).to_string(),
            key,
        ]);
    }
    println!("{table}");
    Ok(())
}

#[cfg(not(windows))]
fn scan() -> Result<()> {
    bail!("live process scanning requires Windows; use `export --source --key` with a known key")
}

async fn export(
    account: Option<String>,
    source: Option<PathBuf>,
    key: Option<String>,
    root: PathBuf,
) -> Result<()> {
    let request = resolve_request(account, source, key)?;
    let registry = Registry::open(&root)?;
    let dest = registry.account_dir(&request.account);
    let account = request.account.clone();

    let (tx, rx) = progress::channel();
    let printer = tokio::spawn(print_progress(rx));

    export::export_all(request, dest, None, tx)
        .await
        .with_context(|| format!("export of {account} failed"))?;
    let _ = printer.await;

    registry.record_export(&account)?;
    println!("{} exported {account}", style("✓").green());
    Ok(())
}

/// Builds the export request, either offline from `--source`/`--key` or
/// by scanning the live process table.
fn resolve_request(
    account: Option<String>,
    source: Option<PathBuf>,
    key: Option<String>,
) -> Result<ExportRequest> {
    if let (Some(source), Some(key)) = (source, key) {
        let Some(key) = DbKey::from_hex(&key) else {
            bail!("--key must be 64 hex characters");
        };
        let account = account
            .or_else(|| source.file_name().map(|n| n.to_string_lossy().into_owned()))
            .context("cannot derive an account name from --source; pass --account")?;
        return Ok(ExportRequest { account, source, key });
    }

    live_request(account)
}

#[cfg(windows)]
fn live_request(account: Option<String>) -> Result<ExportRequest> {
    use wxbackup::scout::windows::WindowsEnumerator;
    use wxbackup::scout::{ProcessEnumerator, scan_instances};

    let enumerator = WindowsEnumerator;
    let instances = scan_instances(&enumerator)?;

    let instance = match &account {
        Some(name) => instances
            .into_iter()
            .find(|candidate| candidate.account == *name)
            .with_context(|| format!("no running instance for account {name}"))?,
        None => {
            let mut instances = instances;
            if instances.len() != 1 {
                bail!("{} running instances; pass --account", instances.len());
            }
            instances.remove(0)
        }
    };

    let access = enumerator.open(instance.pid)?;
    let key = wxbackup::scout::recover_key(access.as_ref(), &instance)
        .with_context(|| format!("key recovery failed for {}", instance.account))?;

    Ok(ExportRequest { account: instance.account.clone(), source: instance.source_dir.clone(), key })
}

#[cfg(not(windows))]
fn live_request(_account: Option<String>) -> Result<ExportRequest> {
    bail!("live export requires Windows; use `export --source --key` with a known key")
}

fn list_accounts(root: &std::path::Path) -> Result<()> {
    let registry = Registry::open(root)?;
    let accounts = registry.accounts();
    if accounts.is_empty() {
        println!("no exported accounts under {}", root.display());
        return Ok(());
    }

    let active = registry.active_account();
    for account in accounts {
        if active.as_deref() == Some(account.as_str()) {
            println!("{} {account}", style("*").green());
        } else {
            println!("  {account}");
        }
    }
    Ok(())
}

/// Drains the progress stream: ticks drive the bar, failures print as
/// their JSON wire form above it.
async fn print_progress(rx: progress::ProgressReceiver) {
    let bar = ProgressBar::new(100);
    if let Ok(bar_style) =
        ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/100")
    {
        bar.set_style(bar_style.progress_chars("●○ "));
    }

    while let Ok(event) = rx.recv_async().await {
        match event.progress {
            Some(pct) => {
                bar.set_position(u64::from(pct));
                bar.set_message(event.result.clone());
            }
            None => bar.println(event.to_string()),
        }
        tracing::info!(%event, "progress");
    }
    bar.finish_with_message("done");
}
