//! ConPTY backend for Windows
//!
//! Wraps the Windows pseudo console (Windows 10 1809+). The console API is
//! resolved from kernel32 at runtime so that older systems report
//! [`PtyError::ConsoleUnavailable`] instead of failing to load.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::sync::OnceLock;
use std::thread::JoinHandle;

use tracing::{debug, warn};
use windows::core::{s, w, HRESULT, PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, SetHandleInformation, ERROR_INSUFFICIENT_BUFFER, HANDLE, HANDLE_FLAGS,
    HANDLE_FLAG_INHERIT, WAIT_OBJECT_0,
};
use windows::Win32::System::Console::{COORD, HPCON};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::IO::CancelSynchronousIo;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, EXTENDED_STARTUPINFO_PRESENT, INFINITE, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROCESS_INFORMATION, STARTUPINFOEXW,
};

use super::command::CommandLine;
use super::pty::{
    ChildProcess, ConsoleSize, ExitWait, PipeEnd, PipePair, PseudoConsole, PtyError, PtySystem, Result,
};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;
const STILL_ACTIVE: u32 = 259;

type CreatePseudoConsoleFn = unsafe extern "system" fn(COORD, HANDLE, HANDLE, u32, *mut HPCON) -> HRESULT;
type ResizePseudoConsoleFn = unsafe extern "system" fn(HPCON, COORD) -> HRESULT;
type ClosePseudoConsoleFn = unsafe extern "system" fn(HPCON);

struct ConPtyApi {
    create: CreatePseudoConsoleFn,
    resize: ResizePseudoConsoleFn,
    close: ClosePseudoConsoleFn,
}

fn api() -> Option<&'static ConPtyApi> {
    static API: OnceLock<Option<ConPtyApi>> = OnceLock::new();
    API.get_or_init(|| unsafe { load_api() }).as_ref()
}

unsafe fn load_api() -> Option<ConPtyApi> {
    let kernel32 = GetModuleHandleW(w!("kernel32.dll")).ok()?;
    let create = GetProcAddress(kernel32, s!("CreatePseudoConsole"))?;
    let resize = GetProcAddress(kernel32, s!("ResizePseudoConsole"))?;
    let close = GetProcAddress(kernel32, s!("ClosePseudoConsole"))?;

    Some(ConPtyApi {
        create: std::mem::transmute::<_, CreatePseudoConsoleFn>(create),
        resize: std::mem::transmute::<_, ResizePseudoConsoleFn>(resize),
        close: std::mem::transmute::<_, ClosePseudoConsoleFn>(close),
    })
}

fn coord(size: ConsoleSize) -> COORD {
    COORD {
        X: size.columns as i16,
        Y: size.rows as i16,
    }
}

fn raw(file: &File) -> HANDLE {
    HANDLE(file.as_raw_handle())
}

fn wide(s: &std::ffi::OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Abort a synchronous read that `thread` is blocked in. False when the
/// thread had no I/O pending.
pub(crate) fn cancel_blocking_io<T>(thread: &JoinHandle<T>) -> bool {
    let handle = HANDLE(thread.as_raw_handle());
    match unsafe { CancelSynchronousIo(handle) } {
        Ok(()) => {
            debug!("cancelled blocking read");
            true
        }
        Err(_) => false,
    }
}

/// ConPTY-based [`PtySystem`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ConPtySystem;

impl PtySystem for ConPtySystem {
    type Reader = File;
    type Writer = File;
    type Console = ConPtyConsole;
    type Process = ConPtyProcess;

    fn create_pipe_pair(&self, keep: PipeEnd) -> Result<PipePair<File, File>> {
        let mut read = HANDLE::default();
        let mut write = HANDLE::default();

        unsafe {
            CreatePipe(&mut read, &mut write, None, 0)
                .map_err(|e| PtyError::PipeCreation { code: e.code().0 })?;
        }

        // Owned from here on, so an early return below closes both ends
        let pair = unsafe {
            PipePair {
                read: File::from(OwnedHandle::from_raw_handle(read.0)),
                write: File::from(OwnedHandle::from_raw_handle(write.0)),
            }
        };

        // The parent's end must never leak into a child
        let kept = match keep {
            PipeEnd::Read => raw(&pair.read),
            PipeEnd::Write => raw(&pair.write),
        };
        unsafe {
            SetHandleInformation(kept, HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0))
                .map_err(|e| PtyError::PipeCreation { code: e.code().0 })?;
        }

        Ok(pair)
    }

    fn create_console(&self, size: ConsoleSize, input: &File, output: &File) -> Result<ConPtyConsole> {
        let api = api().ok_or(PtyError::ConsoleUnavailable)?;

        let mut hpc = HPCON::default();
        let hr = unsafe { (api.create)(coord(size), raw(input), raw(output), 0, &mut hpc) };
        if hr.is_err() {
            return Err(PtyError::ConsoleCreation { code: hr.0 });
        }
        if hpc.0 == 0 {
            return Err(PtyError::ConsoleCreation { code: -1 });
        }

        debug!("pseudo console created: {}x{}", size.columns, size.rows);
        Ok(ConPtyConsole { hpc, api })
    }

    fn spawn(
        &self,
        command: &CommandLine,
        working_directory: &Path,
        console: &ConPtyConsole,
    ) -> Result<ConPtyProcess> {
        let attributes = AttributeList::with_pseudo_console(console.hpc)?;

        let mut startup_info = STARTUPINFOEXW {
            lpAttributeList: attributes.as_ptr(),
            ..Default::default()
        };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

        let mut cmd_wide: Vec<u16> = command
            .to_windows_command_line()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let cwd_wide = wide(working_directory.as_os_str());
        let mut process_info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(cmd_wide.as_mut_ptr()),
                None,
                None,
                false,
                EXTENDED_STARTUPINFO_PRESENT,
                None,
                PCWSTR(cwd_wide.as_ptr()),
                &startup_info.StartupInfo,
                &mut process_info,
            )
            .map_err(|e| PtyError::ProcessSpawn { code: e.code().0 })?;

            // The primary thread handle is never used
            let _ = CloseHandle(process_info.hThread);
        }

        debug!(pid = process_info.dwProcessId, "spawned {}", command);
        Ok(ConPtyProcess {
            handle: unsafe { OwnedHandle::from_raw_handle(process_info.hProcess.0) },
            pid: process_info.dwProcessId,
        })
    }
}

/// Process/thread attribute list holding the pseudo console slot.
///
/// Buffer and list are released on drop, whichever step failed.
struct AttributeList {
    // usize elements keep the buffer pointer-aligned
    buffer: Vec<usize>,
    initialized: bool,
}

impl AttributeList {
    fn with_pseudo_console(hpc: HPCON) -> Result<Self> {
        let spawn_error = |e: windows::core::Error| PtyError::ProcessSpawn { code: e.code().0 };

        let mut size: usize = 0;
        let query = unsafe {
            InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size)
        };
        let mut size = required_size(query, size)?;

        let word = std::mem::size_of::<usize>();
        let words = (size + word - 1) / word;
        let mut list = AttributeList {
            buffer: vec![0usize; words],
            initialized: false,
        };

        unsafe {
            InitializeProcThreadAttributeList(list.as_ptr(), 1, 0, &mut size).map_err(spawn_error)?;
            list.initialized = true;

            UpdateProcThreadAttribute(
                list.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const c_void),
                std::mem::size_of::<HPCON>(),
                None,
                None,
            )
            .map_err(spawn_error)?;
        }

        Ok(list)
    }

    fn as_ptr(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_ptr() as *mut c_void)
    }
}

/// Result of the sizing call: only "buffer too small" with a size is usable.
fn required_size(query: windows::core::Result<()>, size: usize) -> Result<usize> {
    match query {
        Err(e) if e.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() && size > 0 => Ok(size),
        Err(e) => Err(PtyError::ProcessSpawn { code: e.code().0 }),
        Ok(()) => Err(PtyError::ProcessSpawn { code: -1 }),
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
        }
    }
}

/// Owned `HPCON`.
pub struct ConPtyConsole {
    hpc: HPCON,
    api: &'static ConPtyApi,
}

// Safety: HPCON is an opaque kernel handle usable from any thread
unsafe impl Send for ConPtyConsole {}
unsafe impl Sync for ConPtyConsole {}

impl PseudoConsole for ConPtyConsole {
    fn resize(&self, size: ConsoleSize) -> Result<()> {
        let hr = unsafe { (self.api.resize)(self.hpc, coord(size)) };
        if hr.is_err() {
            return Err(PtyError::Resize { code: hr.0 });
        }
        Ok(())
    }
}

impl Drop for ConPtyConsole {
    fn drop(&mut self) {
        // Closes the console host's pipe ends, which ends the session reader
        unsafe { (self.api.close)(self.hpc) };
    }
}

/// Process handle of the attached child.
pub struct ConPtyProcess {
    handle: OwnedHandle,
    pid: u32,
}

impl ConPtyProcess {
    fn handle(&self) -> HANDLE {
        HANDLE(self.handle.as_raw_handle())
    }
}

impl ChildProcess for ConPtyProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        unsafe {
            if WaitForSingleObject(self.handle(), 0) != WAIT_OBJECT_0 {
                return Ok(None);
            }
            let mut exit_code: u32 = 0;
            GetExitCodeProcess(self.handle(), &mut exit_code)
                .map_err(|e| io::Error::from_raw_os_error(e.code().0))?;
            if exit_code == STILL_ACTIVE {
                return Ok(None);
            }
            Ok(Some(exit_code as i32))
        }
    }

    /// ConPTY keeps the output pipe open after the child exits, so the exit
    /// is waited for on a duplicate of the process handle.
    fn exit_wait(&mut self) -> Option<ExitWait> {
        let handle = match self.handle.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot duplicate handle of process {}: {}", self.pid, e);
                return None;
            }
        };
        Some(Box::new(move || unsafe {
            WaitForSingleObject(HANDLE(handle.as_raw_handle()), INFINITE);
        }))
    }
}

impl Drop for ConPtyProcess {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.try_exit_code() {
            return;
        }
        unsafe {
            if let Err(e) = TerminateProcess(self.handle(), 1) {
                warn!("TerminateProcess({}) failed: {}", self.pid, e);
            }
        }
        // `handle` closes when the OwnedHandle drops
    }
}
