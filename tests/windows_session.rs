//! Sessions against cmd.exe on the ConPTY backend
#![cfg(windows)]

use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use ptyhost::core::{CommandLine, ConsoleSize, Session, SessionEvent, SessionState};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(15);

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

#[test]
fn cmd_echo_round_trip() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(CommandLine::new("cmd.exe"), ConsoleSize::new(24, 80).unwrap());
    let events = session.events();

    assert!(session.initialize(dir.path()));
    assert!(session.is_running());

    session.write_line("echo marker-42", true).unwrap();
    assert!(output_until(&events, "marker-42\r\n").contains("marker-42"));

    session.resize(40, 132).unwrap();
    assert_eq!(session.size(), ConsoleSize::new(40, 132).unwrap());

    session.dispose();
    session.dispose();
    assert_eq!(session.state(), SessionState::Disposed);
    session.write_input("echo ignored\r").unwrap();
}

#[test]
fn exit_code_is_readable_after_child_exits() {
    let dir = TempDir::new().unwrap();
    let command = CommandLine::new("cmd.exe").arg("/c").arg("exit 3");
    let session = Session::new(command, ConsoleSize::default());
    let events = session.events();
    assert!(session.initialize(dir.path()));

    let deadline = Instant::now() + WAIT;
    while session.exit_code().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(session.exit_code(), Some(3));

    // No dispose: the console is closed once the child is gone
    let mut exited = None;
    while let Ok(event) = events.recv_timeout(WAIT) {
        if let SessionEvent::Exited(code) = event {
            exited = Some(code);
            break;
        }
    }
    assert_eq!(exited, Some(Some(3)));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Running);
    // The channel ends after the exit event
    assert!(events.recv_timeout(WAIT).is_err());
}

#[test]
fn missing_program_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(CommandLine::new(r"C:\nonexistent\tool.exe"), ConsoleSize::default());

    assert!(!session.initialize(dir.path()));
    assert!(!session.is_running());
    assert_eq!(session.state(), SessionState::Uninitialized);
}
