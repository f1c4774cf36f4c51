//! ptyhost - run an interactive CLI tool behind a pseudo console
//!
//! The tool runs attached to a pseudo console; the host terminal is put in
//! raw mode and bytes are passed through in both directions.
//!
//! # Quick Start
//!
//! ```text
//! ptyhost                      # Run the configured tool (claude by default)
//! ptyhost -c copilot           # Run another tool
//! ptyhost -c "sh -l" -d /tmp   # Any command line, in a given directory
//! ```

mod ui;

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use crossterm::event::{self, Event, KeyEventKind};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptyhost::config::Config;
use ptyhost::connection::{ConnectionEvent, PtyConnection, TerminalConnection};
use ptyhost::core::{ConsoleSize, NativePtySystem, Session};
use ptyhost::locate::{self, Resolver};

use crate::ui::{HostTerminal, KeyMapper, ModeTracker};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line overrides for the config file
#[derive(Debug, Default)]
struct Args {
    command: Option<String>,
    directory: Option<PathBuf>,
    rows: Option<u16>,
    columns: Option<u16>,
}

fn print_version() {
    eprintln!("ptyhost {}", VERSION);
}

fn print_help() {
    eprintln!("ptyhost {} - Run a CLI tool behind a pseudo console", VERSION);
    eprintln!();
    eprintln!("Usage: ptyhost [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --command <CMD>   Tool name or command line (default: claude)");
    eprintln!("  -d, --dir <DIR>       Working directory (default: home)");
    eprintln!("      --rows <N>        Console rows (default: host terminal)");
    eprintln!("      --cols <N>        Console columns (default: host terminal)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("A bare tool name is looked up as an npm shim (Windows), then on PATH");
    eprintln!("as <name>, <name>-code and their .cmd forms.");
    eprintln!();
    eprintln!("Configuration: ~/.ptyhost/config.toml");
    eprintln!("Log file:      ~/.ptyhost/ptyhost.log (level from RUST_LOG or log_level)");
    eprintln!();
    eprintln!("Exit: quit the tool; the host exits with its exit code");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    let value = |i: usize, name: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("Missing value for {}", name))
    };
    let dimension = |text: String, name: &str| -> Result<u16, String> {
        text.parse::<u16>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("Invalid {}: {}", name, text))
    };

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--command" => {
                i += 1;
                parsed.command = Some(value(i, "--command")?);
            }
            "-d" | "--dir" => {
                i += 1;
                parsed.directory = Some(PathBuf::from(value(i, "--dir")?));
            }
            "--rows" => {
                i += 1;
                parsed.rows = Some(dimension(value(i, "--rows")?, "row count")?);
            }
            "--cols" => {
                i += 1;
                parsed.columns = Some(dimension(value(i, "--cols")?, "column count")?);
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(parsed)
}

/// Log to ~/.ptyhost/ptyhost.log; stdout belongs to the child.
fn init_logging(level: &str) {
    let log_path = Config::config_dir()
        .map(|dir| dir.join("ptyhost.log"))
        .unwrap_or_else(|| PathBuf::from("ptyhost.log"));

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let config = Config::load();
    init_logging(&config.log_level);
    info!("ptyhost {} starting", VERSION);

    let exit_code = run(args, config)?;
    info!("Exiting with {:?}", exit_code);

    match exit_code {
        Some(code) if code != 0 => std::process::exit(code),
        _ => Ok(()),
    }
}

/// Start the tool and pump events until it exits. Returns its exit code.
fn run(args: Args, config: Config) -> anyhow::Result<Option<i32>> {
    let requested = args.command.unwrap_or_else(|| config.command.clone());
    let command = locate::command_for(&requested, &Resolver::from_env());
    let directory = args.directory.unwrap_or_else(|| config.working_directory());

    let (host_columns, host_rows) = HostTerminal::size().unwrap_or((config.columns, config.rows));
    let size = ConsoleSize::new(args.rows.unwrap_or(host_rows), args.columns.unwrap_or(host_columns))
        .unwrap_or_else(|_| config.console_size());

    info!("Command: {}", command);
    info!("Directory: {}", directory.display());

    let session = Session::with_system(NativePtySystem::default(), command.clone(), size, config.session_options());
    if let Err(e) = session.try_initialize(&directory) {
        if e.is_unsupported() {
            bail!("{} (Windows 10 1809 or later is required)", e);
        }
        return Err(e).with_context(|| format!("Failed to start {}", command));
    }
    let connection = PtyConnection::new(session);

    let mut host = HostTerminal::new();
    host.init()?;

    let result = pump(&connection);

    let _ = host.cleanup();
    connection.close();
    result
}

fn pump(connection: &PtyConnection) -> anyhow::Result<Option<i32>> {
    let poll_timeout = Duration::from_millis(20);
    let modes = Arc::new(Mutex::new(ModeTracker::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let exit_code = Arc::new(Mutex::new(None));

    {
        let modes = modes.clone();
        let closed = closed.clone();
        let exit_code = exit_code.clone();
        connection.subscribe(Box::new(move |event| match event {
            ConnectionEvent::Output(text) => {
                if let Ok(mut tracker) = modes.lock() {
                    tracker.feed(text.as_bytes());
                }
                if let Err(e) = HostTerminal::write_output(text.as_bytes()) {
                    warn!("Failed to write output: {}", e);
                }
            }
            ConnectionEvent::Closed(code) => {
                if let Ok(mut slot) = exit_code.lock() {
                    *slot = *code;
                }
                closed.store(true, Ordering::SeqCst);
            }
        }));
    }
    connection.start();

    while !closed.load(Ordering::SeqCst) {
        if !event::poll(poll_timeout)? {
            continue;
        }

        let input_modes = match modes.lock() {
            Ok(tracker) => tracker.modes(),
            Err(_) => break,
        };

        match event::read()? {
            Event::Key(key_event) => {
                // Only process key press events
                if key_event.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(bytes) = KeyMapper::map(&key_event, &input_modes) {
                    match String::from_utf8(bytes) {
                        Ok(text) => connection.write_input(&text),
                        Err(e) => error!("Unencodable key {:?}: {}", key_event, e),
                    }
                }
            }

            Event::Paste(text) => {
                let bytes = KeyMapper::paste(&text, &input_modes);
                connection.write_input(&String::from_utf8_lossy(&bytes));
            }

            Event::Resize(columns, rows) => {
                info!("Resize: {}x{}", columns, rows);
                connection.resize(rows, columns);
            }

            _ => {}
        }
    }

    info!("Session ended");
    Ok(exit_code.lock().map(|slot| *slot).unwrap_or(None))
}
