//! Session management
//!
//! A [`Session`] owns one pseudo console, the child attached to it, the
//! parent ends of the input and output pipes, and the background thread
//! that reads output. It is inert until [`Session::initialize`] and is torn
//! down by [`Session::dispose`] (or drop).
//!
//! # Shutdown
//!
//! The output reader blocks in `read` and has no cancellation point. It is
//! stopped by closing what it reads from: dispose closes the input pipe,
//! terminates the child, and destroys the console, after which the read
//! returns end-of-stream or an error and the loop exits. Dispose then waits
//! for that, bounded by [`SessionOptions::shutdown_timeout`].
//!
//! A console host that keeps the output pipe open after the child exits
//! (ConPTY) would leave the reader blocked until dispose. For those, an exit
//! watcher thread waits on the child and destroys the console once it is
//! gone, so the reader drains to end-of-stream by itself.

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::command::CommandLine;
use super::events::{EventHub, SubscriptionId};
use super::pty::{
    ChildProcess, ConsoleSize, ExitWait, NativePtySystem, PipeEnd, PseudoConsole, PtyError, PtySystem,
    Result,
};

/// How often, and how many times, the reader asks for the exit code after
/// end-of-stream before giving up.
const EXIT_CODE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const EXIT_CODE_POLLS: u32 = 20;

/// Extra wait after a blocked read was cancelled
#[cfg(windows)]
const CANCEL_GRACE: Duration = Duration::from_millis(200);

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk read from the output pipe. Chunk boundaries carry no meaning.
    Output(Vec<u8>),
    /// Output reached end-of-stream; the exit code if it could be read.
    Exited(Option<i32>),
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Running,
    Disposed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Size of each blocking read from the output pipe
    pub read_buffer_size: usize,
    /// Events held for the first subscriber if output arrives before one
    pub backlog_events: usize,
    /// How long dispose waits for the reader to observe the closed pipe
    pub shutdown_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            backlog_events: 1024,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// A background thread owned by the session (output reader, exit watcher).
struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the thread exits
    done: Receiver<()>,
}

impl Worker {
    fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> io::Result<Self> {
        let (done_tx, done) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _done = done_tx;
            body();
        })?;
        Ok(Self { handle, done })
    }

    fn name(&self) -> String {
        self.handle.thread().name().unwrap_or("worker").to_string()
    }

    fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    fn finished_within(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    #[cfg(windows)]
    fn cancel_blocking_io(&self) -> bool {
        super::conpty::cancel_blocking_io(&self.handle) && self.finished_within(CANCEL_GRACE)
    }

    #[cfg(not(windows))]
    fn cancel_blocking_io(&self) -> bool {
        false
    }

    fn stop(self, timeout: Duration) {
        if self.is_current() {
            // Disposed from an event handler; the loop is already unwinding
            return;
        }
        let name = self.name();
        if !self.finished_within(timeout) && !self.cancel_blocking_io() {
            // Whatever the thread owns (the output pipe end, for the reader)
            // stays open until its blocking call returns
            warn!(
                "{} still blocked after {:?}; detaching with its handles open",
                name, timeout
            );
            return;
        }
        if self.handle.join().is_err() {
            warn!("{} panicked", name);
        }
    }
}

struct Lifecycle {
    state: SessionState,
    reader: Option<Worker>,
    watcher: Option<Worker>,
}

/// Sender behind one [`Session::events`] receiver; `None` once closed.
type ChannelSlot = Arc<Mutex<Option<Sender<SessionEvent>>>>;

struct Acquired<S: PtySystem> {
    console: S::Console,
    process: S::Process,
    writer: S::Writer,
    reader: S::Reader,
}

/// A child process running behind a pseudo console
pub struct Session<S: PtySystem = NativePtySystem> {
    system: S,
    command: CommandLine,
    options: SessionOptions,
    /// Last size successfully applied to the console
    size: Mutex<ConsoleSize>,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    console: Arc<Mutex<Option<S::Console>>>,
    /// Single writer lock: one write+flush at a time
    writer: Mutex<Option<S::Writer>>,
    process: Arc<Mutex<Option<S::Process>>>,
    events: Arc<EventHub<SessionEvent>>,
    channels: Mutex<Vec<ChannelSlot>>,
}

impl Session<NativePtySystem> {
    /// Create a session for `command` on the native pseudo console.
    pub fn new(command: CommandLine, size: ConsoleSize) -> Self {
        Self::with_system(NativePtySystem::default(), command, size, SessionOptions::default())
    }
}

impl<S: PtySystem> Session<S> {
    pub fn with_system(system: S, command: CommandLine, size: ConsoleSize, options: SessionOptions) -> Self {
        let events = Arc::new(EventHub::new(options.backlog_events));
        Self {
            system,
            command,
            options,
            size: Mutex::new(size),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Uninitialized,
                reader: None,
                watcher: None,
            }),
            console: Arc::new(Mutex::new(None)),
            writer: Mutex::new(None),
            process: Arc::new(Mutex::new(None)),
            events,
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Start the child; false (with the error logged) if any step failed.
    ///
    /// A failed attempt releases everything it acquired and leaves the
    /// session uninitialized.
    pub fn initialize(&self, working_directory: &Path) -> bool {
        match self.try_initialize(working_directory) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start {}: {}", self.command, e);
                false
            }
        }
    }

    /// Pipes, then console, then process, then the reader thread (and the
    /// exit watcher where the backend needs one).
    pub fn try_initialize(&self, working_directory: &Path) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state != SessionState::Uninitialized {
            return Err(PtyError::InvalidState(lifecycle.state));
        }
        lifecycle.state = SessionState::Initializing;

        let size = *lock(&self.size);
        info!(
            "Starting {} in {} ({}x{})",
            self.command,
            working_directory.display(),
            size.columns,
            size.rows
        );

        let Acquired {
            console,
            mut process,
            writer,
            reader,
        } = match self.acquire(size, working_directory) {
            Ok(acquired) => acquired,
            Err(e) => {
                lifecycle.state = SessionState::Uninitialized;
                return Err(e);
            }
        };
        let pid = process.pid();
        let exit_wait = process.exit_wait();

        *lock(&self.writer) = Some(writer);
        *lock(&self.process) = Some(process);
        self.running.store(true, Ordering::SeqCst);

        let task = match self.spawn_reader(reader) {
            Ok(task) => task,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let writer = lock(&self.writer).take();
                drop(writer);
                let process = lock(&self.process).take();
                drop(process);
                drop(console);
                lifecycle.state = SessionState::Uninitialized;
                return Err(e);
            }
        };

        // Some console hosts hold output back until the first resize
        if let Err(e) = console.resize(size) {
            warn!("Initial resize failed: {}", e);
        }

        *lock(&self.console) = Some(console);
        lifecycle.reader = Some(task);
        lifecycle.watcher = exit_wait.and_then(|wait| match self.spawn_exit_watcher(wait) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Exit watcher not started; child exit is seen on dispose: {}", e);
                None
            }
        });
        lifecycle.state = SessionState::Running;
        info!(pid, "Session running");
        Ok(())
    }

    /// Acquire every OS resource. On error, whatever was created is dropped
    /// in reverse order before returning.
    fn acquire(&self, size: ConsoleSize, working_directory: &Path) -> Result<Acquired<S>> {
        let input = self.system.create_pipe_pair(PipeEnd::Write)?;
        let output = self.system.create_pipe_pair(PipeEnd::Read)?;
        let console = self.system.create_console(size, &input.read, &output.write)?;
        let process = self.system.spawn(&self.command, working_directory, &console)?;

        // The console holds its own copies. Keeping ours open would stop the
        // output pipe from ever reaching end-of-stream.
        drop(input.read);
        drop(output.write);

        Ok(Acquired {
            console,
            process,
            writer: input.write,
            reader: output.read,
        })
    }

    fn spawn_reader(&self, reader: S::Reader) -> Result<Worker> {
        let running = self.running.clone();
        let events = self.events.clone();
        let process = self.process.clone();
        let buffer_size = self.options.read_buffer_size.max(1);

        Worker::spawn("pty-reader", move || {
            read_output(reader, buffer_size, &events);
            running.store(false, Ordering::SeqCst);

            let code = wait_exit_code(&process);
            info!("Process exited with code {:?}", code);
            events.emit(SessionEvent::Exited(code));
        })
        .map_err(PtyError::ReaderSpawn)
    }

    /// Destroy the console once the child exits; the console host then
    /// closes its end of the output pipe.
    fn spawn_exit_watcher(&self, wait: ExitWait) -> io::Result<Worker> {
        let running = self.running.clone();
        let console = self.console.clone();

        Worker::spawn("pty-exit-watch", move || {
            wait();
            running.store(false, Ordering::SeqCst);
            if let Some(console) = lock(&console).take() {
                debug!("Child exited; closing console");
                drop(console);
            }
        })
    }

    /// Write bytes to the child's input and flush.
    ///
    /// Silently does nothing when the session is not running. Failures are
    /// reported but leave the session running.
    pub fn write_input(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        if !self.is_running() {
            trace!("Dropping {} input bytes: session not running", data.len());
            return Ok(());
        }

        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        writer.write_all(data).map_err(PtyError::Write)?;
        writer.flush().map_err(PtyError::Write)
    }

    /// Write `text`, followed by a carriage return when `submit` is set.
    pub fn write_line(&self, text: &str, submit: bool) -> Result<()> {
        let mut line = text.as_bytes().to_vec();
        if submit {
            line.push(b'\r');
        }
        self.write_input(line)
    }

    /// Resize the console. The stored size only changes if the console
    /// accepted the new one.
    pub fn resize(&self, rows: u16, columns: u16) -> Result<()> {
        let size = ConsoleSize::new(rows, columns)?;

        let guard = lock(&self.console);
        let console = match guard.as_ref() {
            Some(console) if self.is_running() => console,
            _ => return Err(PtyError::NotRunning),
        };

        console.resize(size)?;
        *lock(&self.size) = size;
        debug!("Resized to {}x{}", columns, rows);
        Ok(())
    }

    /// Tear everything down. Safe to call repeatedly and before initialize.
    pub fn dispose(&self) {
        let (reader, watcher) = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state == SessionState::Disposed {
                return;
            }
            lifecycle.state = SessionState::Disposed;
            (lifecycle.reader.take(), lifecycle.watcher.take())
        };
        self.running.store(false, Ordering::SeqCst);

        let writer = lock(&self.writer).take();
        drop(writer);

        // Closing the process handle is what terminates the child
        let process = lock(&self.process).take();
        drop(process);

        // Only after the child is gone; closes the output pipe's far end
        let console = lock(&self.console).take();
        drop(console);

        if let Some(watcher) = watcher {
            watcher.stop(self.options.shutdown_timeout);
        }
        if let Some(reader) = reader {
            reader.stop(self.options.shutdown_timeout);
        }

        // Channels whose sender saw no exit event (opened after it) end here
        for slot in lock(&self.channels).drain(..) {
            lock(&slot).take();
        }
        info!("Session disposed");
    }

    /// Alias for [`Session::dispose`].
    pub fn close(&self) {
        self.dispose();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        lock(&self.lifecycle).state
    }

    /// Last size applied to the console (or the requested size before start).
    pub fn size(&self) -> ConsoleSize {
        *lock(&self.size)
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn process_id(&self) -> Option<u32> {
        lock(&self.process).as_ref().map(|process| process.pid())
    }

    /// Exit code of the child if it has exited and the session still holds it.
    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.process)
            .as_mut()
            .and_then(|process| process.try_exit_code().ok().flatten())
    }

    /// Register an event handler. Output emitted before the first handler
    /// existed is replayed to it. Handlers run on the reader thread.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(Box::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Events as a channel. It disconnects after [`SessionEvent::Exited`]
    /// or on dispose, whichever comes first.
    pub fn events(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        let slot: ChannelSlot = Arc::new(Mutex::new(Some(tx)));
        {
            let mut channels = lock(&self.channels);
            if self.state() == SessionState::Disposed {
                return rx;
            }
            channels.retain(|open| lock(open).is_some());
            channels.push(slot.clone());
        }
        self.subscribe(move |event| forward(&slot, event));
        rx
    }
}

impl<S: PtySystem> Drop for Session<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Blocking read loop; returns on end-of-stream or the first error.
fn read_output<R: Read>(mut reader: R, buffer_size: usize, events: &EventHub<SessionEvent>) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => {
                debug!("Output reached end of stream");
                break;
            }
            Ok(n) => {
                trace!("Read {} bytes", n);
                events.emit(SessionEvent::Output(buffer[..n].to_vec()));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Output read failed: {}", e);
                break;
            }
        }
    }
}

fn forward(slot: &Mutex<Option<Sender<SessionEvent>>>, event: &SessionEvent) {
    let mut sender = lock(slot);
    let delivered = sender.as_ref().map_or(false, |tx| tx.send(event.clone()).is_ok());
    if !delivered || matches!(event, SessionEvent::Exited(_)) {
        *sender = None;
    }
}

fn wait_exit_code<P: ChildProcess>(process: &Mutex<Option<P>>) -> Option<i32> {
    for _ in 0..EXIT_CODE_POLLS {
        match lock(process).as_mut().map(|p| p.try_exit_code()) {
            // Disposed: the process handle is already closed
            None => return None,
            Some(Ok(Some(code))) => return Some(code),
            Some(Ok(None)) => {}
            Some(Err(e)) => {
                debug!("Exit code unavailable: {}", e);
                return None;
            }
        }
        thread::sleep(EXIT_CODE_POLL_INTERVAL);
    }
    None
}
