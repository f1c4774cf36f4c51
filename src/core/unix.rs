//! Unix pseudo terminal backend
//!
//! `openpty` hands back a master/slave pair rather than consuming a pipe
//! pair the way ConPTY does, so two relay threads stand in for the console
//! host: one copies the input pipe into the master, the other copies the
//! master into the output pipe. Once the last slave descriptor closes (the
//! child is gone) reads on the master fail, the output relay exits and drops
//! its end of the output pipe, and the session reader sees end-of-stream.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use super::command::CommandLine;
use super::pty::{ChildProcess, ConsoleSize, PipeEnd, PipePair, PseudoConsole, PtyError, PtySystem, Result};
use super::session::lock;

const RELAY_BUFFER_SIZE: usize = 4096;

/// `openpty`-based [`PtySystem`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPtySystem;

fn set_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe()?;
    set_cloexec(&read)?;
    set_cloexec(&write)?;
    Ok((read, write))
}

fn winsize(size: ConsoleSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn os_code(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(-1)
}

impl PtySystem for UnixPtySystem {
    type Reader = File;
    type Writer = File;
    type Console = UnixConsole;
    type Process = UnixProcess;

    fn create_pipe_pair(&self, keep: PipeEnd) -> Result<PipePair<File, File>> {
        // The far end is relayed by the console inside this process, so
        // neither end is ever handed to a child
        let (read, write) = cloexec_pipe().map_err(|e| PtyError::PipeCreation { code: e as i32 })?;
        trace!(?keep, "pipe created");

        Ok(PipePair {
            read: File::from(read),
            write: File::from(write),
        })
    }

    fn create_console(&self, size: ConsoleSize, input: &File, output: &File) -> Result<UnixConsole> {
        let pty = openpty(Some(&winsize(size)), None).map_err(|e| match e {
            Errno::ENOENT | Errno::ENODEV | Errno::ENXIO => PtyError::ConsoleUnavailable,
            e => PtyError::ConsoleCreation { code: e as i32 },
        })?;

        let creation = |e: io::Error| PtyError::ConsoleCreation { code: os_code(&e) };
        for fd in [&pty.master, &pty.slave] {
            set_cloexec(fd).map_err(|e| PtyError::ConsoleCreation { code: e as i32 })?;
        }

        let master = File::from(pty.master);
        let input = input.try_clone().map_err(creation)?;
        let output = output.try_clone().map_err(creation)?;

        spawn_relay("pty-input-relay", input, master.try_clone().map_err(creation)?)
            .map_err(creation)?;
        spawn_relay("pty-output-relay", master.try_clone().map_err(creation)?, output)
            .map_err(creation)?;

        debug!("pseudo console created: {}x{}", size.columns, size.rows);
        Ok(UnixConsole {
            master,
            slave: Mutex::new(Some(pty.slave)),
        })
    }

    fn spawn(
        &self,
        command: &CommandLine,
        working_directory: &Path,
        console: &UnixConsole,
    ) -> Result<UnixProcess> {
        let spawn_error = |e: io::Error| PtyError::ProcessSpawn { code: os_code(&e) };

        let mut slave = lock(&console.slave);
        let Some(tty) = slave.as_ref() else {
            // A process is already attached to this console
            return Err(PtyError::ProcessSpawn { code: libc::EBUSY });
        };

        let mut cmd = Command::new(command.program());
        cmd.args(command.arguments())
            .current_dir(working_directory)
            .stdin(Stdio::from(tty.try_clone().map_err(spawn_error)?))
            .stdout(Stdio::from(tty.try_clone().map_err(spawn_error)?))
            .stderr(Stdio::from(tty.try_clone().map_err(spawn_error)?));

        // SAFETY: the hook runs between fork and exec and only makes
        // async-signal-safe calls. stdio is already the slave at this point.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_error)?;
        drop(cmd);
        // Only the child may hold the slave from here on, otherwise its
        // hang-up never reaches the master
        slave.take();

        debug!(pid = child.id(), "spawned {}", command);
        Ok(UnixProcess {
            child,
            exit_code: None,
        })
    }
}

fn spawn_relay(name: &str, mut from: File, mut to: File) -> io::Result<()> {
    let thread_name = name.to_string();
    thread::Builder::new().name(thread_name).spawn(move || {
        let mut buffer = [0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match from.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // EIO from the master once the slave side hangs up
                Err(e) => {
                    trace!("relay read ended: {}", e);
                    break;
                }
            };
            if let Err(e) = to.write_all(&buffer[..n]) {
                trace!("relay write ended: {}", e);
                break;
            }
        }
    })?;
    Ok(())
}

/// Pty master plus the slave until a process takes it over.
pub struct UnixConsole {
    master: File,
    slave: Mutex<Option<OwnedFd>>,
}

impl PseudoConsole for UnixConsole {
    fn resize(&self, size: ConsoleSize) -> Result<()> {
        let ws = winsize(size);
        // SAFETY: TIOCSWINSZ reads a winsize through a valid pointer
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(PtyError::Resize {
                code: Errno::last() as i32,
            });
        }
        Ok(())
    }
}

/// Child process leading its own session on the pty.
pub struct UnixProcess {
    child: Child,
    exit_code: Option<i32>,
}

impl ChildProcess for UnixProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if let Some(status) = self.child.try_wait()? {
            let code = status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
            self.exit_code = Some(code);
        }
        Ok(self.exit_code)
    }
}

impl Drop for UnixProcess {
    fn drop(&mut self) {
        if self.exit_code.is_some() {
            return;
        }

        // The child leads its own session; take its whole group down
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = killpg(pid, Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
            let _ = self.child.kill();
        }
        match self.child.wait() {
            Ok(status) => debug!("process {} terminated: {}", pid, status),
            Err(e) => warn!("failed to reap process {}: {}", pid, e),
        }
    }
}
