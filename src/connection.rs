//! UI-facing terminal connection
//!
//! [`PtyConnection`] wraps a running [`Session`] behind the
//! [`TerminalConnection`] trait a front end programs against. Output bytes
//! are decoded to text here; a multibyte sequence split across two reads is
//! carried over rather than mangled.

use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::core::events::{EventHub, Handler, SubscriptionId};
use crate::core::pty::{NativePtySystem, PtySystem};
use crate::core::session::{lock, Session, SessionEvent};

/// Events raised to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Output(String),
    /// The child exited; carries its exit code when known.
    Closed(Option<i32>),
}

/// What a terminal front end needs from a connection.
///
/// Calls are fire-and-forget: failures are logged by the implementation.
pub trait TerminalConnection: Send + Sync {
    fn start(&self);
    fn write_input(&self, text: &str);
    fn resize(&self, rows: u16, columns: u16);
    fn close(&self);
    fn subscribe(&self, handler: Handler<ConnectionEvent>) -> SubscriptionId;
}

/// Incremental UTF-8 decoder.
///
/// Invalid sequences become U+FFFD; an incomplete trailing sequence is held
/// until the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Truncated sequence at the end; wait for more
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Flush whatever is held, replacing an unfinished sequence.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// [`TerminalConnection`] over a [`Session`].
///
/// The session must already be initialized; `start` does nothing. Dropping
/// the connection disposes the session.
pub struct PtyConnection<S: PtySystem = NativePtySystem> {
    session: Session<S>,
    events: Arc<EventHub<ConnectionEvent>>,
}

impl<S: PtySystem> PtyConnection<S> {
    /// Wrap `session`. Events raised before the first subscriber are held
    /// up to the session's `backlog_events`.
    pub fn new(session: Session<S>) -> Self {
        let events = Arc::new(EventHub::new(session.options().backlog_events));
        let decoder = Mutex::new(Utf8Decoder::new());

        let sink = events.clone();
        session.subscribe(move |event| match event {
            SessionEvent::Output(bytes) => {
                let text = lock(&decoder).decode(bytes);
                if !text.is_empty() {
                    sink.emit(ConnectionEvent::Output(text));
                }
            }
            SessionEvent::Exited(code) => {
                let rest = lock(&decoder).finish();
                if !rest.is_empty() {
                    sink.emit(ConnectionEvent::Output(rest));
                }
                sink.emit(ConnectionEvent::Closed(*code));
            }
        });

        Self { session, events }
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }
}

impl<S: PtySystem> TerminalConnection for PtyConnection<S> {
    fn start(&self) {
        trace!("start: session already running");
    }

    fn write_input(&self, text: &str) {
        if let Err(e) = self.session.write_input(text) {
            warn!("Input write failed: {}", e);
        }
    }

    fn resize(&self, rows: u16, columns: u16) {
        if let Err(e) = self.session.resize(rows, columns) {
            warn!("Resize to {}x{} failed: {}", columns, rows, e);
        }
    }

    fn close(&self) {
        self.session.dispose();
    }

    fn subscribe(&self, handler: Handler<ConnectionEvent>) -> SubscriptionId {
        self.events.subscribe(handler)
    }
}

impl<S: PtySystem> Drop for PtyConnection<S> {
    fn drop(&mut self) {
        self.close();
    }
}
