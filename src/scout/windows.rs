//! Windows implementation of the process capabilities.
//!
//! Uses Toolhelp32 snapshots for the process and module tables,
//! `ReadProcessMemory` for the foreign address space, the version-info
//! APIs for module versions, and NT handle enumeration for the open-file
//! anchor. All raw handles are wrapped in owning types that close on
//! drop, so every exit path releases them.

use std::ffi::{OsString, c_void};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, GetLastError, HANDLE,
    INVALID_HANDLE_VALUE, MAX_PATH,
};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_TYPE_DISK, GetFileType, GetFileVersionInfoSizeW, GetFileVersionInfoW,
    GetFinalPathNameByHandleW, VS_FIXEDFILEINFO, VerQueryValueW,
};
use windows_sys::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, IsWow64Process, OpenProcess, PROCESS_DUP_HANDLE,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

use super::{ModuleInfo, ProcessAccess, ProcessEnumerator};
use crate::error::ScoutError;

// NT handle enumeration; these have no Win32 equivalents.
const SYSTEM_EXTENDED_HANDLE_INFORMATION: u32 = 64;
const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;

/// Granted-access mask of synchronous pipe handles; querying their names
/// can block indefinitely, so they are skipped outright.
const BLOCKING_PIPE_ACCESS: u32 = 0x0012_019F;

#[repr(C)]
struct SystemHandleTableEntryInfoEx {
    object: *mut c_void,
    unique_process_id: usize,
    handle_value: usize,
    granted_access: u32,
    creator_back_trace_index: u16,
    object_type_index: u16,
    handle_attributes: u32,
    reserved: u32,
}

#[link(name = "ntdll")]
unsafe extern "system" {
    fn NtQuerySystemInformation(
        class: u32,
        info: *mut c_void,
        length: u32,
        return_length: *mut u32,
    ) -> i32;
}

fn last_error(what: &str) -> ScoutError {
    ScoutError::Platform(format!("{what} failed: {:#x}", unsafe { GetLastError() }))
}

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    OsString::from_wide(&buf[..end]).to_string_lossy().into_owned()
}

/// Owning wrapper that closes the handle on every exit path.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.0 != INVALID_HANDLE_VALUE && !self.0.is_null() {
            unsafe { CloseHandle(self.0) };
        }
    }
}

/// Capability handle onto one foreign Windows process.
pub struct WindowsProcess {
    pid: u32,
    handle: OwnedHandle,
}

impl WindowsProcess {
    /// Opens `pid` for memory reads and handle duplication.
    pub fn open(pid: u32) -> Result<Self, ScoutError> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION | PROCESS_VM_READ | PROCESS_DUP_HANDLE,
                0,
                pid,
            )
        };
        if handle.is_null() {
            return Err(ScoutError::PermissionDenied(pid));
        }
        Ok(Self { pid, handle: OwnedHandle(handle) })
    }

    /// Snapshot of the system handle table, retried until it fits.
    fn handle_table() -> Result<Vec<u8>, ScoutError> {
        let mut buf = vec![0u8; 1 << 20];
        loop {
            let mut needed = 0u32;
            let status = unsafe {
                NtQuerySystemInformation(
                    SYSTEM_EXTENDED_HANDLE_INFORMATION,
                    buf.as_mut_ptr().cast(),
                    buf.len() as u32,
                    &mut needed,
                )
            };
            if status == STATUS_INFO_LENGTH_MISMATCH {
                buf.resize(buf.len() * 2, 0);
                continue;
            }
            if status != 0 {
                return Err(ScoutError::Platform(format!(
                    "NtQuerySystemInformation failed: {status:#x}"
                )));
            }
            return Ok(buf);
        }
    }

    /// Resolves one duplicated disk-file handle to its DOS path.
    fn final_path(dup: HANDLE) -> Option<PathBuf> {
        if unsafe { GetFileType(dup) } != FILE_TYPE_DISK {
            return None;
        }
        let mut buf = [0u16; 4 * MAX_PATH as usize];
        let len = unsafe { GetFinalPathNameByHandleW(dup, buf.as_mut_ptr(), buf.len() as u32, 0) };
        if len == 0 || len as usize > buf.len() {
            return None;
        }
        let path = from_wide(&buf);
        // GetFinalPathNameByHandleW returns the \\?\ form.
        Some(PathBuf::from(path.trim_start_matches(r"\\?\")))
    }
}

impl ProcessAccess for WindowsProcess {
    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, ScoutError> {
        let mut buf = vec![0u8; len];
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.0,
                addr as *const c_void,
                buf.as_mut_ptr().cast(),
                len,
                &mut read,
            )
        };
        if ok == 0 {
            return Err(last_error("ReadProcessMemory"));
        }
        buf.truncate(read);
        Ok(buf)
    }

    fn list_modules(&self) -> Result<Vec<ModuleInfo>, ScoutError> {
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid)
        };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateToolhelp32Snapshot(modules)"));
        }
        let snapshot = OwnedHandle(snapshot);

        let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<MODULEENTRY32W>() as u32;

        let mut modules = Vec::new();
        let mut ok = unsafe { Module32FirstW(snapshot.0, &mut entry) };
        while ok != 0 {
            modules.push(ModuleInfo {
                name: from_wide(&entry.szModule),
                path: PathBuf::from(from_wide(&entry.szExePath)),
                base: entry.modBaseAddr as u64,
                size: entry.modBaseSize as usize,
            });
            ok = unsafe { Module32NextW(snapshot.0, &mut entry) };
        }
        Ok(modules)
    }

    fn list_open_files(&self) -> Result<Vec<PathBuf>, ScoutError> {
        let table = Self::handle_table()?;

        // Layout: { number_of_handles: usize, reserved: usize, entries[] }.
        let count = usize::from_ne_bytes(table[..size_of::<usize>()].try_into().unwrap());
        let entries_at = 2 * size_of::<usize>();
        let entry_size = size_of::<SystemHandleTableEntryInfoEx>();

        let mut files = Vec::new();
        for i in 0..count {
            let at = entries_at + i * entry_size;
            if at + entry_size > table.len() {
                break;
            }
            // The byte buffer carries no alignment guarantee.
            let entry: SystemHandleTableEntryInfoEx =
                unsafe { ptr::read_unaligned(table[at..].as_ptr().cast()) };
            if entry.unique_process_id != self.pid as usize
                || entry.granted_access == BLOCKING_PIPE_ACCESS
            {
                continue;
            }

            let mut dup: HANDLE = ptr::null_mut();
            let ok = unsafe {
                DuplicateHandle(
                    self.handle.0,
                    entry.handle_value as HANDLE,
                    GetCurrentProcess(),
                    &mut dup,
                    0,
                    0,
                    DUPLICATE_SAME_ACCESS,
                )
            };
            if ok == 0 {
                continue;
            }
            let dup = OwnedHandle(dup);
            if let Some(path) = Self::final_path(dup.0) {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn module_version(&self, path: &Path) -> Result<String, ScoutError> {
        let path_w = wide(path);
        let mut zero = 0u32;
        let size = unsafe { GetFileVersionInfoSizeW(path_w.as_ptr(), &mut zero) };
        if size == 0 {
            return Err(last_error("GetFileVersionInfoSizeW"));
        }

        let mut data = vec![0u8; size as usize];
        if unsafe { GetFileVersionInfoW(path_w.as_ptr(), 0, size, data.as_mut_ptr().cast()) } == 0 {
            return Err(last_error("GetFileVersionInfoW"));
        }

        let root: Vec<u16> = "\\".encode_utf16().chain(std::iter::once(0)).collect();
        let mut fixed: *mut VS_FIXEDFILEINFO = ptr::null_mut();
        let mut fixed_len = 0u32;
        let ok = unsafe {
            VerQueryValueW(
                data.as_ptr().cast(),
                root.as_ptr(),
                (&mut fixed as *mut *mut VS_FIXEDFILEINFO).cast(),
                &mut fixed_len,
            )
        };
        if ok == 0 || fixed.is_null() {
            return Err(last_error("VerQueryValueW"));
        }

        let info = unsafe { &*fixed };
        Ok(format!(
            "{}.{}.{}.{}",
            (info.dwFileVersionMS >> 16) & 0xFF,
            info.dwFileVersionMS & 0xFF,
            (info.dwFileVersionLS >> 16) & 0xFF,
            info.dwFileVersionLS & 0xFF,
        ))
    }

    fn is_64bit(&self) -> Result<bool, ScoutError> {
        let mut wow64 = 0;
        if unsafe { IsWow64Process(self.handle.0, &mut wow64) } == 0 {
            return Err(last_error("IsWow64Process"));
        }
        // A process under WOW64 is 32-bit; everything else here is native.
        Ok(wow64 == 0)
    }
}

/// Process-table access backed by Toolhelp32 snapshots.
pub struct WindowsEnumerator;

impl ProcessEnumerator for WindowsEnumerator {
    fn processes(&self) -> Result<Vec<(u32, String)>, ScoutError> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(last_error("CreateToolhelp32Snapshot(processes)"));
        }
        let snapshot = OwnedHandle(snapshot);

        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = size_of::<PROCESSENTRY32W>() as u32;

        let mut processes = Vec::new();
        let mut ok = unsafe { Process32FirstW(snapshot.0, &mut entry) };
        while ok != 0 {
            processes.push((entry.th32ProcessID, from_wide(&entry.szExeFile)));
            ok = unsafe { Process32NextW(snapshot.0, &mut entry) };
        }
        Ok(processes)
    }

    fn open(&self, pid: u32) -> Result<Box<dyn ProcessAccess>, ScoutError> {
        Ok(Box::new(WindowsProcess::open(pid)?))
    }
}
