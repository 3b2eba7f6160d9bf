//! Live-process discovery and in-memory database key recovery.
//!
//! The scan walks the OS process table for the target application,
//! anchors each instance on its open `Msg/Media.db` handle, and records
//! where the main product module is mapped. Key recovery then reads that
//! module image and hunts for the 32-byte master key: a device-type
//! marker pins a stable data region, a backwards pointer-stride walk
//! below it yields candidate pointers gated on the key-length sentinel,
//! and a single page-0 HMAC check per candidate settles each one.
//!
//! Everything here is platform-agnostic against the [`ProcessAccess`]
//! capability; the Windows backend lives in [`windows`].

#[cfg(windows)]
pub mod windows;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::KEY_SIZE;
use crate::database;
use crate::error::ScoutError;

/// Executable name of the target application.
pub const TARGET_PROCESS: &str = "WeChat.exe";

/// The module whose image holds the key pointer.
pub const TARGET_MODULE: &str = "WeChatWin.dll";

/// Total length of an encoded device marker: a tag, zero padding to 16
/// bytes, then the tag length as a little-endian u32.
const MARKER_LEN: usize = 20;

/// Device tags, tried in this order.
const DEVICE_TAGS: &[&str] = &["android", "pad-android", "iphone", "ipad", "OHOS"];

/// One discovered live instance of the target application.
#[derive(Debug, Clone)]
pub struct AppInstance {
    pub pid: u32,
    /// Account data root: the anchor path minus its last two segments.
    pub source_dir: PathBuf,
    /// Account label, the last segment of `source_dir`.
    pub account: String,
    /// Four-part dotted product version.
    pub version: String,
    pub is_64bit: bool,
    /// Base address of the main module inside the foreign process.
    pub module_base: u64,
    /// Mapped size of the main module in bytes.
    pub module_size: usize,
}

/// The recovered 32-byte database master key.
#[derive(Clone, PartialEq, Eq)]
pub struct DbKey([u8; KEY_SIZE]);

impl DbKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses the hex form the key travels in between components.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keys are secrets; show only the edges.
        write!(f, "DbKey({:02x}..{:02x})", self.0[0], self.0[KEY_SIZE - 1])
    }
}

/// One loaded module of a foreign process.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub path: PathBuf,
    pub base: u64,
    pub size: usize,
}

/// Capability handle onto one foreign process.
///
/// Implementations release the underlying OS handle on drop.
pub trait ProcessAccess {
    /// Reads `len` bytes at `addr` in the foreign address space.
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, ScoutError>;

    fn list_modules(&self) -> Result<Vec<ModuleInfo>, ScoutError>;

    /// Paths of regular files the process holds open.
    fn list_open_files(&self) -> Result<Vec<PathBuf>, ScoutError>;

    /// Dotted file-version string of an on-disk module.
    fn module_version(&self, path: &Path) -> Result<String, ScoutError>;

    fn is_64bit(&self) -> Result<bool, ScoutError>;
}

/// Process-table access, the entry point the scan runs against.
pub trait ProcessEnumerator {
    /// All (pid, executable name) pairs currently running.
    fn processes(&self) -> Result<Vec<(u32, String)>, ScoutError>;

    fn open(&self, pid: u32) -> Result<Box<dyn ProcessAccess>, ScoutError>;
}

/// Scans the process table for logged-in instances of the target.
///
/// Processes without an open `Msg/Media.db` anchor are skipped (they are
/// not logged in), as are processes whose main module cannot be located.
pub fn scan_instances(enumerator: &dyn ProcessEnumerator) -> Result<Vec<AppInstance>, ScoutError> {
    let mut found = Vec::new();

    for (pid, name) in enumerator.processes()? {
        if name != TARGET_PROCESS {
            continue;
        }

        let access = match enumerator.open(pid) {
            Ok(access) => access,
            Err(err) => {
                tracing::debug!(pid, %err, "cannot open candidate process");
                continue;
            }
        };

        let open_files = match access.list_open_files() {
            Ok(files) => files,
            Err(err) => {
                tracing::debug!(pid, %err, "open-file enumeration failed");
                continue;
            }
        };
        let Some((source_dir, account)) = find_anchor(&open_files) else {
            tracing::debug!(pid, "target process has no media anchor, not logged in");
            continue;
        };

        let modules = match access.list_modules() {
            Ok(modules) => modules,
            Err(err) => {
                tracing::debug!(pid, %err, "module enumeration failed");
                continue;
            }
        };
        let Some(module) = modules.iter().find(|m| m.name.eq_ignore_ascii_case(TARGET_MODULE))
        else {
            tracing::debug!(pid, "main module not mapped yet");
            continue;
        };

        let version = access.module_version(&module.path).unwrap_or_default();
        // Native width assumed when the WOW64 query fails.
        let is_64bit = access.is_64bit().unwrap_or(true);

        found.push(AppInstance {
            pid,
            source_dir,
            account,
            version,
            is_64bit,
            module_base: module.base,
            module_size: module.size,
        });
    }

    Ok(found)
}

/// Picks the account root out of a process's open-file list.
///
/// The anchor is an open file ending in `Msg/Media.db`; the account root
/// is that path minus the last two segments, and the account label is the
/// segment left at the end.
fn find_anchor(open_files: &[PathBuf]) -> Option<(PathBuf, String)> {
    for path in open_files {
        if path.file_name().is_some_and(|f| f == "Media.db")
            && path
                .parent()
                .and_then(Path::file_name)
                .is_some_and(|d| d == "Msg")
        {
            let root = path.parent()?.parent()?;
            let account = root.file_name()?.to_string_lossy().into_owned();
            return Some((root.to_path_buf(), account));
        }
    }
    None
}

/// Recovers the database master key from a live instance's memory.
///
/// Each candidate is settled by the page-0 HMAC check against the
/// instance's own `Media.db`; the first one that authenticates wins.
/// Per-candidate failures (unmapped pointers, unreadable memory) are
/// skipped; only exhaustion of every marker region surfaces as an error.
pub fn recover_key(
    access: &dyn ProcessAccess,
    instance: &AppInstance,
) -> Result<DbKey, ScoutError> {
    let media_db = instance.source_dir.join("Msg").join("Media.db");
    if !media_db.is_file() {
        tracing::warn!(path = %media_db.display(), "media database missing, cannot validate candidates");
        return Err(ScoutError::KeyNotFound);
    }

    let image = access.read(instance.module_base, instance.module_size)?;

    let mut offset = 0;
    while let Some(index) = find_device_marker(&image[offset..]) {
        tracing::debug!(at = offset + index, "device marker hit");

        // Every candidate below the marker is in scope, walked from the
        // marker backwards.
        for ptr in key_pointer_candidates(&image[..offset + index], instance.is_64bit) {
            if ptr == 0 {
                continue;
            }
            let Ok(candidate) = access.read(ptr, KEY_SIZE) else {
                continue;
            };
            if candidate.len() != KEY_SIZE {
                continue;
            }
            if database::verify_key(&media_db, &candidate).unwrap_or(false) {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(&candidate);
                return Ok(DbKey(key));
            }
        }

        offset += index + MARKER_LEN;
    }

    Err(ScoutError::KeyNotFound)
}

/// Encodes one device tag as its in-memory marker form.
fn marker_for(tag: &str) -> [u8; MARKER_LEN] {
    debug_assert!(tag.len() <= MARKER_LEN - 4);
    let mut marker = [0u8; MARKER_LEN];
    marker[..tag.len()].copy_from_slice(tag.as_bytes());
    marker[MARKER_LEN - 4..].copy_from_slice(&(tag.len() as u32).to_le_bytes());
    marker
}

/// Finds the first device marker, honoring tag priority order.
fn find_device_marker(buf: &[u8]) -> Option<usize> {
    for tag in DEVICE_TAGS {
        let marker = marker_for(tag);
        if let Some(index) = buf.windows(MARKER_LEN).position(|w| w == marker.as_slice()) {
            return Some(index);
        }
    }
    None
}

/// Walks `buf` backwards in pointer-width strides, collecting the stride
/// before every occurrence of the little-endian key-length sentinel.
fn key_pointer_candidates(buf: &[u8], is_64bit: bool) -> Vec<u64> {
    let step = if is_64bit { 8 } else { 4 };
    let mut sentinel = [0u8; 8];
    sentinel[0] = KEY_SIZE as u8;
    let sentinel = &sentinel[..step];

    let mut candidates = Vec::new();
    let Some(mut offset) = buf.len().checked_sub(step) else {
        return candidates;
    };
    while offset >= step {
        if &buf[offset..offset + step] == sentinel {
            let mut ptr = [0u8; 8];
            ptr[..step].copy_from_slice(&buf[offset - step..offset]);
            candidates.push(u64::from_le_bytes(ptr));
        }
        offset -= step;
    }
    candidates
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{PAGE_SIZE, RESERVE_SIZE, SALT_SIZE};
    use crate::database::testutil::encrypt_fixture;

    const KEY: [u8; KEY_SIZE] = [0x5A; KEY_SIZE];
    const KEY_ADDR: u64 = 0x7FF6_1000;
    const MODULE_BASE: u64 = 0x7FF6_0000;

    struct FakeAccess {
        image: Vec<u8>,
        memory: HashMap<u64, Vec<u8>>,
        files: Vec<PathBuf>,
        modules: Vec<ModuleInfo>,
    }

    impl ProcessAccess for FakeAccess {
        fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, ScoutError> {
            if addr == MODULE_BASE && len == self.image.len() {
                return Ok(self.image.clone());
            }
            self.memory
                .get(&addr)
                .map(|bytes| bytes[..len.min(bytes.len())].to_vec())
                .ok_or_else(|| ScoutError::Platform(format!("unmapped address {addr:#x}")))
        }

        fn list_modules(&self) -> Result<Vec<ModuleInfo>, ScoutError> {
            Ok(self.modules.clone())
        }

        fn list_open_files(&self) -> Result<Vec<PathBuf>, ScoutError> {
            Ok(self.files.clone())
        }

        fn module_version(&self, _path: &Path) -> Result<String, ScoutError> {
            Ok("3.9.8.25".into())
        }

        fn is_64bit(&self) -> Result<bool, ScoutError> {
            Ok(true)
        }
    }

    struct FakeEnumerator {
        access: std::cell::RefCell<Option<FakeAccess>>,
    }

    impl ProcessEnumerator for FakeEnumerator {
        fn processes(&self) -> Result<Vec<(u32, String)>, ScoutError> {
            Ok(vec![
                (1, "init".into()),
                (4321, TARGET_PROCESS.into()),
                (5555, "explorer.exe".into()),
            ])
        }

        fn open(&self, pid: u32) -> Result<Box<dyn ProcessAccess>, ScoutError> {
            assert_eq!(pid, 4321, "only the target should be opened");
            Ok(Box::new(self.access.borrow_mut().take().expect("opened once")))
        }
    }

    /// Lays out a module image: noise, then `pointer` + length sentinel
    /// at an aligned stride, then a device marker.
    fn module_image(pointer: u64, extra_pointer: Option<u64>) -> Vec<u8> {
        let mut image = vec![0xCCu8; 512];

        // Good candidate low in the prefix.
        image[64..72].copy_from_slice(&pointer.to_le_bytes());
        image[72] = KEY_SIZE as u8; // sentinel 0x20 00 .. 00
        image[73..80].fill(0);

        // Optional second candidate nearer the marker; the backwards walk
        // visits this one first.
        if let Some(extra) = extra_pointer {
            image[128..136].copy_from_slice(&extra.to_le_bytes());
            image[136] = KEY_SIZE as u8;
            image[137..144].fill(0);
        }

        image[256..256 + MARKER_LEN].copy_from_slice(&marker_for("iphone"));
        image
    }

    fn media_fixture(dir: &TempDir) -> PathBuf {
        let msg = dir.path().join("wxid_abc123").join("Msg");
        fs::create_dir_all(&msg).unwrap();
        let salt: [u8; SALT_SIZE] = core::array::from_fn(|i| i as u8);
        let body = vec![0x11u8; PAGE_SIZE - SALT_SIZE - RESERVE_SIZE];
        fs::write(msg.join("Media.db"), encrypt_fixture(&KEY, &salt, &[body])).unwrap();
        dir.path().join("wxid_abc123")
    }

    fn instance(source_dir: PathBuf, image_len: usize) -> AppInstance {
        AppInstance {
            pid: 4321,
            source_dir,
            account: "wxid_abc123".into(),
            version: "3.9.8.25".into(),
            is_64bit: true,
            module_base: MODULE_BASE,
            module_size: image_len,
        }
    }

    #[test]
    fn recovers_key_behind_device_marker() {
        let dir = TempDir::new().unwrap();
        let source = media_fixture(&dir);

        let image = module_image(KEY_ADDR, None);
        let access = FakeAccess {
            memory: HashMap::from([(KEY_ADDR, KEY.to_vec())]),
            files: vec![],
            modules: vec![],
            image: image.clone(),
        };

        let key = recover_key(&access, &instance(source, image.len())).unwrap();
        assert_eq!(key.as_bytes(), &KEY);
        assert_eq!(key.to_hex(), hex::encode(KEY));
    }

    #[test]
    fn skips_candidates_that_fail_validation() {
        let dir = TempDir::new().unwrap();
        let source = media_fixture(&dir);

        // The nearer candidate dereferences to garbage; the scan must
        // fall through to the valid one.
        let bogus_addr = 0x7FF6_2000u64;
        let image = module_image(KEY_ADDR, Some(bogus_addr));
        let access = FakeAccess {
            memory: HashMap::from([
                (KEY_ADDR, KEY.to_vec()),
                (bogus_addr, vec![0xEE; KEY_SIZE]),
            ]),
            files: vec![],
            modules: vec![],
            image: image.clone(),
        };

        let key = recover_key(&access, &instance(source, image.len())).unwrap();
        assert_eq!(key.as_bytes(), &KEY);
    }

    #[test]
    fn exhaustion_reports_key_not_found() {
        let dir = TempDir::new().unwrap();
        let source = media_fixture(&dir);

        // Marker present but every candidate pointer is unmapped.
        let image = module_image(0xDEAD_0000, None);
        let access = FakeAccess {
            memory: HashMap::new(),
            files: vec![],
            modules: vec![],
            image: image.clone(),
        };

        assert!(matches!(
            recover_key(&access, &instance(source, image.len())),
            Err(ScoutError::KeyNotFound)
        ));
    }

    #[test]
    fn image_without_marker_reports_key_not_found() {
        let dir = TempDir::new().unwrap();
        let source = media_fixture(&dir);

        let image = vec![0u8; 256];
        let access = FakeAccess {
            memory: HashMap::new(),
            files: vec![],
            modules: vec![],
            image,
        };

        assert!(matches!(
            recover_key(&access, &instance(source, 256)),
            Err(ScoutError::KeyNotFound)
        ));
    }

    #[test]
    fn scan_anchors_on_open_media_db() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("WeChat Files").join("wxid_abc123");
        fs::create_dir_all(root.join("Msg")).unwrap();

        let access = FakeAccess {
            image: vec![],
            memory: HashMap::new(),
            files: vec![
                dir.path().join("unrelated.log"),
                root.join("Msg").join("Media.db"),
            ],
            modules: vec![ModuleInfo {
                name: TARGET_MODULE.into(),
                path: PathBuf::from("WeChatWin.dll"),
                base: MODULE_BASE,
                size: 512,
            }],
        };
        let enumerator = FakeEnumerator { access: std::cell::RefCell::new(Some(access)) };

        let instances = scan_instances(&enumerator).unwrap();
        assert_eq!(instances.len(), 1);
        let found = &instances[0];
        assert_eq!(found.pid, 4321);
        assert_eq!(found.account, "wxid_abc123");
        assert_eq!(found.source_dir, root);
        assert_eq!(found.version, "3.9.8.25");
        assert!(found.is_64bit);
        assert_eq!(found.module_base, MODULE_BASE);
        assert_eq!(found.module_size, 512);
    }

    #[test]
    fn scan_skips_instances_without_anchor() {
        let access = FakeAccess {
            image: vec![],
            memory: HashMap::new(),
            files: vec![PathBuf::from("/tmp/other.txt")],
            modules: vec![],
        };
        let enumerator = FakeEnumerator { access: std::cell::RefCell::new(Some(access)) };

        assert!(scan_instances(&enumerator).unwrap().is_empty());
    }

    #[test]
    fn pointer_walk_collects_candidates_backwards() {
        let mut buf = vec![0u8; 64];
        buf[8..16].copy_from_slice(&0x1111u64.to_le_bytes());
        buf[16] = KEY_SIZE as u8;
        buf[40..48].copy_from_slice(&0x2222u64.to_le_bytes());
        buf[48] = KEY_SIZE as u8;

        // Walk starts at the tail, so the higher-offset hit comes first.
        assert_eq!(key_pointer_candidates(&buf, true), vec![0x2222, 0x1111]);
    }

    #[test]
    fn pointer_walk_uses_narrow_strides_on_32bit() {
        let mut buf = vec![0u8; 32];
        buf[12..16].copy_from_slice(&0x3333u32.to_le_bytes());
        buf[16] = KEY_SIZE as u8;

        assert_eq!(key_pointer_candidates(&buf, false), vec![0x3333]);
        assert!(key_pointer_candidates(&[0u8; 4], true).is_empty());
    }

    #[test]
    fn marker_encoding_matches_layout() {
        let marker = marker_for("android");
        assert_eq!(&marker[..7], b"android");
        assert!(marker[7..16].iter().all(|&b| b == 0));
        assert_eq!(&marker[16..], &7u32.to_le_bytes());
    }
}
