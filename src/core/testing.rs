//! In-process `PtySystem` double
//!
//! Pipes are channels, the "child" is a thread that echoes its input back
//! and stops on a line starting with `exit`. Every handle the double hands
//! out carries a token so tests can assert that nothing leaked.
//!
//! [`FakeSystem::holding_output`] behaves like ConPTY: the console keeps the
//! output pipe open after the child exits, until the console is dropped.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::command::CommandLine;
use super::pty::{
    ChildProcess, ConsoleSize, ExitWait, PipeEnd, PipePair, PseudoConsole, PtyError, PtySystem, Result,
};
use super::session::lock;

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailPoint {
    InputPipe,
    OutputPipe,
    Console,
    ConsoleMissing,
    Spawn,
}

/// Shared view into a [`FakeSystem`] that outlives the session owning it.
#[derive(Clone, Default)]
pub(crate) struct Inspector {
    live: Arc<AtomicUsize>,
    resizes: Arc<Mutex<Vec<ConsoleSize>>>,
    resize_fails: Arc<AtomicBool>,
}

impl Inspector {
    pub(crate) fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn resizes(&self) -> Vec<ConsoleSize> {
        lock(&self.resizes).clone()
    }

    pub(crate) fn fail_resizes(&self, fail: bool) {
        self.resize_fails.store(fail, Ordering::SeqCst);
    }

    fn token(&self) -> Token {
        self.live.fetch_add(1, Ordering::SeqCst);
        Token(self.live.clone())
    }
}

struct Token(Arc<AtomicUsize>);

impl Drop for Token {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeSystem {
    inspector: Inspector,
    fail_at: Option<FailPoint>,
    banner: Vec<u8>,
    hold_output: bool,
    /// Extra output writer that is never closed while the system lives
    stuck_output: Option<Mutex<Option<FakeWriter>>>,
}

impl FakeSystem {
    pub(crate) const PID: u32 = 4242;

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_at(point: FailPoint) -> Self {
        Self {
            fail_at: Some(point),
            ..Self::default()
        }
    }

    /// The child writes `banner` as soon as it starts.
    pub(crate) fn with_banner(banner: &[u8]) -> Self {
        Self {
            banner: banner.to_vec(),
            ..Self::default()
        }
    }

    /// The console keeps the output pipe open after the child exits.
    pub(crate) fn holding_output() -> Self {
        Self {
            hold_output: true,
            ..Self::default()
        }
    }

    /// The output pipe never reaches end-of-stream, not even on dispose.
    pub(crate) fn with_stuck_output() -> Self {
        Self {
            stuck_output: Some(Mutex::new(None)),
            ..Self::default()
        }
    }

    pub(crate) fn inspector(&self) -> Inspector {
        self.inspector.clone()
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.fail_at == Some(point)
    }
}

pub(crate) struct FakeReader {
    chunks: Arc<Mutex<Receiver<Vec<u8>>>>,
    pending: Vec<u8>,
    _token: Token,
}

impl FakeReader {
    fn duplicate(&self, inspector: &Inspector) -> Self {
        Self {
            chunks: self.chunks.clone(),
            pending: Vec::new(),
            _token: inspector.token(),
        }
    }
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match lock(&self.chunks).recv() {
                Ok(chunk) => self.pending = chunk,
                // Every writer is gone
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

pub(crate) struct FakeWriter {
    chunks: Sender<Vec<u8>>,
    _token: Token,
}

impl FakeWriter {
    fn duplicate(&self, inspector: &Inspector) -> Self {
        Self {
            chunks: self.chunks.clone(),
            _token: inspector.token(),
        }
    }
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.chunks
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) struct FakeConsole {
    /// The console's own copies of the pipe ends, handed to the child on spawn
    ends: Mutex<Option<(FakeReader, FakeWriter)>>,
    /// Output writer held until the console is dropped
    _held_output: Option<FakeWriter>,
    inspector: Inspector,
    _token: Token,
}

impl PseudoConsole for FakeConsole {
    fn resize(&self, size: ConsoleSize) -> Result<()> {
        if self.inspector.resize_fails.load(Ordering::SeqCst) {
            return Err(PtyError::Resize { code: 0x80070057u32 as i32 });
        }
        lock(&self.inspector.resizes).push(size);
        Ok(())
    }
}

pub(crate) struct FakeProcess {
    exit_code: Arc<Mutex<Option<i32>>>,
    /// Disconnects when the child thread ends
    child_alive: Option<Receiver<()>>,
    _token: Token,
}

impl ChildProcess for FakeProcess {
    fn pid(&self) -> u32 {
        FakeSystem::PID
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(*lock(&self.exit_code))
    }

    fn exit_wait(&mut self) -> Option<ExitWait> {
        let alive = self.child_alive.take()?;
        Some(Box::new(move || {
            let _ = alive.recv();
        }))
    }
}

impl PtySystem for FakeSystem {
    type Reader = FakeReader;
    type Writer = FakeWriter;
    type Console = FakeConsole;
    type Process = FakeProcess;

    fn create_pipe_pair(&self, keep: PipeEnd) -> Result<PipePair<FakeReader, FakeWriter>> {
        let point = match keep {
            PipeEnd::Write => FailPoint::InputPipe,
            PipeEnd::Read => FailPoint::OutputPipe,
        };
        if self.fails(point) {
            return Err(PtyError::PipeCreation { code: 8 });
        }

        let (tx, rx) = mpsc::channel();
        let pair = PipePair {
            read: FakeReader {
                chunks: Arc::new(Mutex::new(rx)),
                pending: Vec::new(),
                _token: self.inspector.token(),
            },
            write: FakeWriter {
                chunks: tx,
                _token: self.inspector.token(),
            },
        };
        if let (PipeEnd::Read, Some(stuck)) = (keep, &self.stuck_output) {
            *lock(stuck) = Some(pair.write.duplicate(&self.inspector));
        }
        Ok(pair)
    }

    fn create_console(&self, _size: ConsoleSize, input: &FakeReader, output: &FakeWriter) -> Result<FakeConsole> {
        if self.fails(FailPoint::ConsoleMissing) {
            return Err(PtyError::ConsoleUnavailable);
        }
        if self.fails(FailPoint::Console) {
            return Err(PtyError::ConsoleCreation { code: 0x80070057u32 as i32 });
        }

        Ok(FakeConsole {
            ends: Mutex::new(Some((input.duplicate(&self.inspector), output.duplicate(&self.inspector)))),
            _held_output: self.hold_output.then(|| output.duplicate(&self.inspector)),
            inspector: self.inspector.clone(),
            _token: self.inspector.token(),
        })
    }

    fn spawn(&self, _command: &CommandLine, _working_directory: &Path, console: &FakeConsole) -> Result<FakeProcess> {
        if self.fails(FailPoint::Spawn) {
            return Err(PtyError::ProcessSpawn { code: 2 });
        }
        let (input, output) = lock(&console.ends)
            .take()
            .ok_or(PtyError::ProcessSpawn { code: 16 })?;

        let exit_code = Arc::new(Mutex::new(None));
        let child_exit = exit_code.clone();
        let banner = self.banner.clone();
        let (alive, child_alive) = mpsc::channel::<()>();
        thread::Builder::new()
            .name("fake-child".to_string())
            .spawn(move || {
                let _alive = alive;
                run_child(input, output, &banner, &child_exit);
            })
            .map_err(|e| PtyError::ProcessSpawn {
                code: e.raw_os_error().unwrap_or(-1),
            })?;

        Ok(FakeProcess {
            exit_code,
            child_alive: self.hold_output.then_some(child_alive),
            _token: self.inspector.token(),
        })
    }
}

/// Echo input back until it closes or an `exit [code]` chunk arrives.
fn run_child(mut input: FakeReader, mut output: FakeWriter, banner: &[u8], exit_code: &Mutex<Option<i32>>) {
    if !banner.is_empty() && output.write_all(banner).is_err() {
        return;
    }

    let mut buffer = [0u8; 256];
    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buffer[..n];
        if let Some(rest) = chunk.strip_prefix(b"exit") {
            let code = String::from_utf8_lossy(rest).trim().parse().unwrap_or(0);
            *lock(exit_code) = Some(code);
            break;
        }
        if output.write_all(chunk).is_err() {
            break;
        }
    }
}
