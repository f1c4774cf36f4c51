//! Sessions against real processes on the `openpty` backend
#![cfg(unix)]

use std::path::Path;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use ptyhost::connection::{ConnectionEvent, PtyConnection, TerminalConnection};
use ptyhost::core::{CommandLine, ConsoleSize, PtyError, Session, SessionEvent, SessionState};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn sh(script: &str) -> CommandLine {
    CommandLine::new("/bin/sh").arg("-c").arg(script)
}

fn size(rows: u16, columns: u16) -> ConsoleSize {
    ConsoleSize::new(rows, columns).unwrap()
}

/// Collect output until `needle` shows up, the child exits, or time runs out.
fn output_until(events: &Receiver<SessionEvent>, needle: &str) -> String {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    while !String::from_utf8_lossy(&seen).contains(needle) {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(SessionEvent::Output(chunk)) => seen.extend(chunk),
            Ok(SessionEvent::Exited(_)) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&seen).into_owned()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn echo_hi_scenario() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(CommandLine::new("/bin/sh"), size(24, 80));
    let events = session.events();

    assert!(session.initialize(dir.path()));
    assert!(session.is_running());
    assert!(session.process_id().is_some());

    session.write_input("echo hi\n").unwrap();
    assert!(output_until(&events, "hi\r\n").contains("hi"));

    session.dispose();
    assert_eq!(session.state(), SessionState::Disposed);
    session.write_input("echo again\n").unwrap();
}

#[test]
fn cat_echoes_bytes_in_order() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(CommandLine::new("cat"), size(24, 80));
    let events = session.events();
    assert!(session.initialize(dir.path()));

    for word in ["alpha", "beta", "gamma"] {
        session.write_line(word, true).unwrap();
    }
    let output = output_until(&events, "gamma\r\n");
    let alpha = output.find("alpha").unwrap();
    let beta = output.find("beta").unwrap();
    let gamma = output.find("gamma").unwrap();
    assert!(alpha < beta && beta < gamma, "{:?}", output);
}

#[test]
fn resize_reaches_the_child() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(CommandLine::new("/bin/sh"), size(24, 80));
    let events = session.events();
    assert!(session.initialize(dir.path()));

    session.resize(33, 101).unwrap();
    assert_eq!(session.size(), size(33, 101));

    session.write_input("stty size\n").unwrap();
    assert!(output_until(&events, "33 101").contains("33 101"));
}

#[test]
fn child_exit_is_observed_without_dispose() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(sh("exit 3"), size(24, 80));
    let events = session.events();
    assert!(session.initialize(dir.path()));

    let code = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Exited(code) => Some(code),
            SessionEvent::Output(_) => None,
        })
        .unwrap();
    assert_eq!(code, Some(3));
    assert!(wait_until(|| !session.is_running()));
    assert!(matches!(session.resize(30, 90), Err(PtyError::NotRunning)));
}

#[test]
fn events_channel_ends_after_exit() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(sh("echo done"), size(24, 80));
    let events = session.events();
    assert!(session.initialize(dir.path()));

    let (done, finished) = std::sync::mpsc::channel();
    let collector = thread::spawn(move || {
        let all: Vec<SessionEvent> = events.iter().collect();
        let _ = done.send(all);
    });

    let all = finished.recv_timeout(WAIT).expect("channel still open after exit");
    collector.join().unwrap();
    assert_eq!(all.last(), Some(&SessionEvent::Exited(Some(0))));

    session.dispose();
    assert!(session.events().recv_timeout(WAIT).is_err());
}

#[test]
fn working_directory_is_applied() {
    let dir = TempDir::new().unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    let session = Session::new(sh("pwd -P"), size(24, 200));
    let events = session.events();
    assert!(session.initialize(dir.path()));

    let expected = canonical.to_string_lossy().into_owned();
    assert!(output_until(&events, &expected).contains(&expected));
}

#[test]
fn missing_program_fails_cleanly() {
    let session = Session::new(CommandLine::new("/nonexistent/tool"), size(24, 80));

    assert!(!session.initialize(Path::new("/")));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Uninitialized);

    let err = session.try_initialize(Path::new("/")).unwrap_err();
    assert!(matches!(err, PtyError::ProcessSpawn { .. }));
    assert!(!err.is_unsupported());
}

#[test]
fn dispose_twice_and_drop() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(CommandLine::new("cat"), size(24, 80));
    assert!(session.initialize(dir.path()));
    let pid = session.process_id().unwrap();

    session.dispose();
    session.dispose();
    assert!(session.process_id().is_none());
    drop(session);

    // The child was killed and reaped
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
    assert!(!alive);
}

#[test]
fn connection_streams_text_and_close() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(sh("printf 'caf\\303\\251\\n'; exit 7"), size(24, 80));
    assert!(session.initialize(dir.path()));
    let connection = PtyConnection::new(session);

    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    connection.subscribe(Box::new(move |event| {
        let _ = tx.lock().unwrap().send(event.clone());
    }));

    let mut text = String::new();
    let mut closed = None;
    while let Ok(event) = rx.recv_timeout(WAIT) {
        match event {
            ConnectionEvent::Output(chunk) => text.push_str(&chunk),
            ConnectionEvent::Closed(code) => {
                closed = Some(code);
                break;
            }
        }
    }
    assert!(text.contains("café"), "{:?}", text);
    assert_eq!(closed, Some(Some(7)));
}
