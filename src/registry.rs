//! The account registry: which accounts have been exported, which one is
//! active, and where the export tree lives.
//!
//! This is the only process-wide mutable state. A mutex guards it, every
//! mutation is flushed to `config.json` at the export root, and accounts
//! keep their first-insertion order. Accounts are discovered both by
//! scanning `User/*` on startup and by successful exports.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::{REGISTRY_FILE, SHARED_EXE_NAME, USER_DIR};
use crate::error::RegistryError;

/// Persisted shape of the registry file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PersistedConfig {
    #[serde(rename = "exportpath")]
    export_path: String,
    #[serde(rename = "userconfig")]
    user_config: UserConfig,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct UserConfig {
    #[serde(rename = "defaultuser")]
    default_user: String,
    users: Vec<String>,
}

struct RegistryState {
    default_user: String,
    users: Vec<String>,
}

/// Registry of exported accounts under one export root.
pub struct Registry {
    root: PathBuf,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Opens the registry at `root`, merging the persisted file with a
    /// fresh scan of the `User/` directory.
    pub fn open(root: &Path) -> Result<Self, RegistryError> {
        let store = root.join(REGISTRY_FILE);
        let persisted = match fs::read_to_string(&store) {
            Ok(raw) => serde_json::from_str::<PersistedConfig>(&raw)
                .map_err(|err| RegistryError::InvalidConfig(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PersistedConfig::default(),
            Err(err) => return Err(err.into()),
        };

        let registry = Self {
            root: root.to_path_buf(),
            state: Mutex::new(RegistryState {
                default_user: persisted.user_config.default_user,
                users: persisted.user_config.users,
            }),
        };
        registry.scan_accounts()?;
        Ok(registry)
    }

    pub fn export_root(&self) -> &Path {
        &self.root
    }

    /// Destination directory of one account's export.
    pub fn account_dir(&self, account: &str) -> PathBuf {
        self.root.join(USER_DIR).join(account)
    }

    pub fn accounts(&self) -> Vec<String> {
        self.state.lock().unwrap().users.clone()
    }

    pub fn active_account(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        (!state.default_user.is_empty()).then(|| state.default_user.clone())
    }

    /// Re-reads `{root}/User/*`, replacing the account list with what is
    /// actually on disk. The active account is kept when still present,
    /// otherwise falls back to the first discovered one.
    pub fn scan_accounts(&self) -> Result<(), RegistryError> {
        let user_root = self.root.join(USER_DIR);
        let mut discovered = Vec::new();
        if user_root.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(&user_root)?.flatten().collect();
            entries.sort_by_key(|entry| entry.file_name());
            for entry in entries {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    discovered.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }

        let dirty;
        {
            let mut state = self.state.lock().unwrap();
            if !discovered.contains(&state.default_user) {
                state.default_user.clear();
            }
            if state.default_user.is_empty()
                && let Some(first) = discovered.first()
            {
                state.default_user = first.clone();
            }
            state.users = discovered;
            dirty = !state.users.is_empty();
        }

        if dirty { self.persist() } else { Ok(()) }
    }

    /// Records a completed export: the account becomes active and is
    /// appended to the list if new.
    pub fn record_export(&self, account: &str) -> Result<(), RegistryError> {
        {
            let mut state = self.state.lock().unwrap();
            state.default_user = account.to_string();
            if !state.users.iter().any(|user| user == account) {
                state.users.push(account.to_string());
            }
        }
        self.persist()
    }

    /// Switches the active account; unknown names are refused.
    pub fn switch_account(&self, account: &str) -> Result<(), RegistryError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.users.iter().any(|user| user == account) {
                return Err(RegistryError::UnknownAccount(account.to_string()));
            }
            state.default_user = account.to_string();
        }
        self.persist()
    }

    /// Flushes the state to `config.json`: create-if-absent first, then
    /// plain overwrite.
    fn persist(&self) -> Result<(), RegistryError> {
        let config = {
            let state = self.state.lock().unwrap();
            PersistedConfig {
                export_path: self.root.to_string_lossy().into_owned(),
                user_config: UserConfig {
                    default_user: state.default_user.clone(),
                    users: state.users.clone(),
                },
            }
        };

        let json = serde_json::to_string_pretty(&config)
            .map_err(|err| RegistryError::InvalidConfig(err.to_string()))?;

        let store = self.root.join(REGISTRY_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&store) {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(json.as_bytes())?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                fs::write(&store, json.as_bytes())?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The "export by user" variant: a self-contained, shareable copy of
    /// one account.
    ///
    /// Creates `{dest}/wxbackup_{account}` (refusing to reuse an existing
    /// directory), mirrors the account tree beneath it, writes a registry
    /// file naming that account as the only user, and drops a copy of the
    /// running executable beside it so the directory opens on its own.
    pub fn export_portable(&self, account: &str, dest: &Path) -> Result<PathBuf, RegistryError> {
        let source = self.account_dir(account);
        if !source.is_dir() {
            return Err(RegistryError::UnknownAccount(account.to_string()));
        }

        let target = dest.join(format!("wxbackup_{account}"));
        if target.exists() {
            return Err(RegistryError::PathExists(target));
        }
        fs::create_dir_all(&target)?;

        copy_tree(&source, &target.join(USER_DIR).join(account))?;

        let config = PersistedConfig {
            export_path: ".\\".to_string(),
            user_config: UserConfig {
                default_user: account.to_string(),
                users: vec![account.to_string()],
            },
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|err| RegistryError::InvalidConfig(err.to_string()))?;
        fs::write(target.join(REGISTRY_FILE), json)?;

        let exe = std::env::current_exe()?;
        fs::copy(&exe, target.join(SHARED_EXE_NAME))?;

        Ok(target)
    }
}

/// Recursively mirrors `src` into `dst`.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src).into_iter().flatten() {
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &out)?;
        }
    }
    Ok(())
}
