//! thopter-shell - attach the local terminal to a remote sandbox shell
//!
//! Runs a remote-attach command (by default `modal sandbox exec <id> bash`) on
//! a pseudo terminal and proxies the local terminal to it, much like an ssh
//! client does.
//!
//! # Quick Start
//!
//! ```text
//! thopter-shell sb-abc123                 # attach with the configured launcher
//! thopter-shell -e % sb-abc123            # use % as the escape character
//! thopter-shell sb-abc123 -- ssh -t {sandbox}.internal
//! ```
//!
//! # Escape sequences
//!
//! Recognized only at the start of a line:
//!
//! | Keys | Action |
//! |------|--------|
//! | ~. | Disconnect |
//! | ~? | Show help |
//! | ~~ | Send a literal ~ |

#[cfg(not(unix))]
compile_error!("thopter-shell requires a Unix pseudo terminal implementation");

mod config;
mod core;
mod ui;

use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LauncherConfig};
use crate::core::pty::PtyProcess;
use crate::core::session::{Session, SessionOptions};
use crate::core::signals::SignalPipe;
use crate::core::winsize::{WindowGeometry, WinsizeSync};
use crate::ui::escape::parse_escape_char;
use crate::ui::raw_mode::{RawModeGuard, TerminalModeError};

/// Interactive shell proxy for remote sandboxes
#[derive(Parser, Debug)]
#[command(name = "thopter-shell", version, about)]
#[command(after_help = "Escape sequences (at the start of a line):\n  \
    ~.  disconnect\n  \
    ~?  show help\n  \
    ~~  send a literal ~")]
struct Cli {
    /// Sandbox to attach to
    sandbox: String,

    /// Escape character, or "none" to disable escapes
    #[arg(short, long, value_name = "CHAR")]
    escape_char: Option<String>,

    /// Config file (default: ~/.thopter-shell/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run this command instead of the configured launcher
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let escape_char = match cli.escape_char.as_deref() {
        Some(value) => parse_escape_char(value).map_err(anyhow::Error::msg)?,
        None => config.escape_byte()?,
    };

    init_logging(&config, cli.verbose);
    info!("thopter-shell {} starting", env!("CARGO_PKG_VERSION"));

    let (program, args) = launch_command(&config.launcher, &cli.sandbox, &cli.command);
    info!("Attaching to {} via {} {:?}", cli.sandbox, program, args);

    println!("Attaching shell to {}...", cli.sandbox);
    match escape_char {
        Some(c) => println!(
            "(Escape character is '{0}'; use 'exit' or Ctrl-D to detach, {0}? for help)",
            c as char
        ),
        None => println!("(Use 'exit' or Ctrl-D to detach)"),
    }

    let stdin = io::stdin();
    let input = stdin.as_fd();

    // The child is started before raw mode so a failed spawn leaves the
    // terminal untouched
    let pty = PtyProcess::spawn(&program, &args, WindowGeometry::read(input))
        .with_context(|| format!("Failed to start shell for {}", cli.sandbox))?;

    let raw_mode = match RawModeGuard::acquire(input) {
        Ok(guard) => Some(guard),
        Err(TerminalModeError::NotATerminal) => {
            info!("Standard input is not a terminal, running without raw mode");
            None
        }
        Err(e) => return Err(e).context("Failed to configure terminal"),
    };

    let options = SessionOptions {
        escape_char,
        poll_interval: config.poll_interval(),
        terminate_grace: config.terminate_grace(),
    };
    let mut session =
        Session::new(pty, input, io::stdout(), options).with_winsize(WinsizeSync::new(input));
    if let Some(guard) = raw_mode {
        session = session.with_raw_mode(guard);
    }
    match SignalPipe::register(&[libc::SIGWINCH]) {
        Ok(pipe) => session = session.with_resize_signals(pipe),
        Err(e) => warn!("Resize notifications unavailable: {}", e),
    }
    match SignalPipe::register(&[libc::SIGTERM, libc::SIGHUP, libc::SIGINT]) {
        Ok(pipe) => session = session.with_termination_signals(pipe),
        Err(e) => warn!("Termination signals not handled: {}", e),
    }

    let reason = session.run();
    info!("Exiting: {}", reason);
    Ok(())
}

/// Program and arguments to run, with `{sandbox}` substituted
fn launch_command(
    launcher: &LauncherConfig,
    sandbox: &str,
    command: &[String],
) -> (String, Vec<String>) {
    match command.split_first() {
        Some((program, args)) => LauncherConfig {
            program: program.clone(),
            args: args.to_vec(),
        }
        .command_for(sandbox),
        None => launcher.command_for(sandbox),
    }
}

/// Log to a file; the terminal belongs to the remote shell
fn init_logging(config: &Config, verbose: u8) {
    let log_path = config.log_path();

    if let Some(parent) = log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(log_filter(verbose, &config.log.level))
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// RUST_LOG wins, then -v flags, then the configured level
fn log_filter(verbose: u8, configured: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["thopter-shell", "-vv", "-e", "%", "sb-1"]).unwrap();
        assert_eq!(cli.sandbox, "sb-1");
        assert_eq!(cli.escape_char.as_deref(), Some("%"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.command.is_empty());

        let cli =
            Cli::try_parse_from(["thopter-shell", "sb-1", "--", "ssh", "-t", "{sandbox}"]).unwrap();
        assert_eq!(cli.command, vec!["ssh", "-t", "{sandbox}"]);

        assert!(Cli::try_parse_from(["thopter-shell"]).is_err());
    }

    #[test]
    fn test_launch_command() {
        let launcher = LauncherConfig::default();

        let (program, args) = launch_command(&launcher, "sb-1", &[]);
        assert_eq!(program, "modal");
        assert_eq!(args, vec!["sandbox", "exec", "sb-1", "bash"]);

        let command = vec!["ssh".to_string(), "-t".to_string(), "{sandbox}.internal".to_string()];
        let (program, args) = launch_command(&launcher, "sb-1", &command);
        assert_eq!(program, "ssh");
        assert_eq!(args, vec!["-t", "sb-1.internal"]);
    }
}
