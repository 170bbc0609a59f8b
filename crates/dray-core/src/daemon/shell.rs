//! Command line front-end for [`Daemon`].
//!
//! Exit status: 0 if OK, 1 on fatal errors outside of the workers (such as
//! the lock being held), 2 if at least one worker has an unexpected status,
//! 99 on all other errors.

use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd as _,
    path::Path,
};

use clap::{Parser, Subcommand};

use super::{Daemon, Report};
use crate::error::{Error, ErrorKind};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_UNEXPECTED: i32 = 2;
pub const EXIT_ERROR: i32 = 99;

const USAGE: &str = "\
Usage: dray start|stop|kill|status|watch|restart|restart-logging|soft-restart|usage

Commands:

  start
    Start the daemon

  stop
    Stop the daemon

  kill
    Kill the daemon

  status
    Query the status of the daemon. Exit with status 2 if any worker is
    not running.

  watch
    Checks the status (running or stopped) and whether it is as
    expected. Starts the daemon if it is expected to run but is not.

  restart
    Shortcut for consecutive 'stop' and 'start'.

  restart-logging
    Re-opens log files, useful e.g. after the log files have been moved or
    removed by log rotation.

  soft-restart
    Signals workers to restart gracefully. Idle workers restart
    immediately; busy workers finish their current job first. Returns
    immediately. Requires 'watch' (typically via cron) to start fresh
    workers; without it, this behaves like a graceful stop.

  usage
    Show this message

Exit status:
 0 if OK,
 1 on fatal errors outside of dray,
 2 if at least one worker has an unexpected status,
 99 on all other errors.
";

#[derive(Debug, Parser)]
#[command(name = "dray", disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum ShellCommand {
    Start,
    Stop,
    Kill,
    Status,
    Watch,
    Restart,
    RestartLogging,
    SoftRestart,
    Usage,
}

impl ShellCommand {
    fn name(self) -> &'static str {
        match self {
            ShellCommand::Start => "start",
            ShellCommand::Stop => "stop",
            ShellCommand::Kill => "kill",
            ShellCommand::Status => "status",
            ShellCommand::Watch => "watch",
            ShellCommand::Restart => "restart",
            ShellCommand::RestartLogging => "restart-logging",
            ShellCommand::SoftRestart => "soft-restart",
            ShellCommand::Usage => "usage",
        }
    }

    /// `kill` and `watch` give up instead of queueing behind another command.
    fn waits_for_lock(self) -> bool {
        !matches!(self, ShellCommand::Kill | ShellCommand::Watch)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Could not acquire lock. Is another dray command already running?")]
struct LockNotAvailable;

/// Exclusive advisory lock on the lock file, released on drop.
#[derive(Debug)]
struct ShellLock {
    file: File,
}

impl ShellLock {
    fn acquire(path: &Path, wait: bool) -> Result<Self, Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let flags = if wait {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };
        // SAFETY: the descriptor is owned by `file` and stays open.
        if unsafe { libc::flock(file.as_raw_fd(), flags) } != 0 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(Error::new(ErrorKind::Lock, LockNotAvailable));
            }
            return Err(error.into());
        }
        Ok(Self { file })
    }
}

impl Drop for ShellLock {
    fn drop(&mut self) {
        // SAFETY: see `acquire`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Runs supervisor commands given as command line arguments.
#[derive(Debug)]
pub struct ShellHandler {
    daemon: Daemon,
}

impl ShellHandler {
    pub fn new(daemon: Daemon) -> Self {
        Self { daemon }
    }

    /// Run the command in `args` (the first item is the program name) and
    /// return the exit status. Messages are printed.
    pub fn run<I, T>(&self, args: I) -> i32
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let command = match Cli::try_parse_from(args) {
            Ok(cli) => cli.command,
            Err(error) => {
                tracing::debug!(error = %error, "Invalid arguments");
                eprint!("{USAGE}");
                return EXIT_ERROR;
            }
        };

        match self.execute(command) {
            Ok(Some(report)) => {
                report.print();
                report.code()
            }
            Ok(None) => {
                eprint!("{USAGE}");
                EXIT_OK
            }
            Err(error) if error.kind() == ErrorKind::Lock => {
                tracing::debug!(command = command.name(), "Lock not available");
                eprintln!("{error}");
                EXIT_FATAL
            }
            Err(error) => {
                eprintln!("{}", error.report());
                EXIT_ERROR
            }
        }
    }

    /// `None` for `usage`.
    fn execute(&self, command: ShellCommand) -> Result<Option<Report>, Error> {
        if command == ShellCommand::Usage {
            return Ok(None);
        }

        tracing::debug!(command = command.name(), "Shell command invoked");
        let _lock = if self.daemon.locks_shell_commands() {
            Some(ShellLock::acquire(
                self.daemon.lock_file(),
                command.waits_for_lock(),
            )?)
        } else {
            None
        };

        let report = match command {
            ShellCommand::Start => self.daemon.start()?,
            ShellCommand::Stop => self.daemon.stop(false)?,
            ShellCommand::Kill => self.daemon.stop(true)?,
            ShellCommand::Status => self.daemon.status()?,
            ShellCommand::Watch => self.daemon.watch()?,
            ShellCommand::Restart => self.daemon.restart()?,
            ShellCommand::RestartLogging => self.daemon.restart_logging()?,
            ShellCommand::SoftRestart => self.daemon.soft_restart()?,
            ShellCommand::Usage => return Ok(None),
        };
        Ok(Some(report))
    }
}

/// Run the command given on the process command line and exit.
pub fn run(daemon: Daemon) -> ! {
    let code = ShellHandler::new(daemon).run(std::env::args_os());
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::WorkerCommand;

    fn daemon(dir: &Path) -> Daemon {
        Daemon::builder()
            .worker("w", WorkerCommand::new("true"))
            .pid_file(dir.join("dray.pid").to_string_lossy())
            .lock_file(dir.join("dray.lock"))
            .shutdown_marker_dir(dir)
            .quiet(true)
            .build()
            .unwrap()
    }

    #[test]
    fn parses_kebab_case_commands() {
        let cli = Cli::try_parse_from(["dray", "restart-logging"]).unwrap();
        assert_eq!(cli.command, ShellCommand::RestartLogging);

        let cli = Cli::try_parse_from(["dray", "soft-restart"]).unwrap();
        assert_eq!(cli.command, ShellCommand::SoftRestart);
    }

    #[test]
    fn bad_arguments_exit_with_99() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellHandler::new(daemon(dir.path()));

        assert_eq!(shell.run(["dray"]), EXIT_ERROR);
        assert_eq!(shell.run(["dray", "explode"]), EXIT_ERROR);
        assert_eq!(shell.run(["dray", "start", "stop"]), EXIT_ERROR);
        assert_eq!(shell.run(["dray", "usage"]), EXIT_OK);
    }

    #[test]
    fn status_of_stopped_daemon_is_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellHandler::new(daemon(dir.path()));

        assert_eq!(shell.run(["dray", "status"]), EXIT_UNEXPECTED);
    }

    #[test]
    fn watch_and_kill_do_not_wait_for_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellHandler::new(daemon(dir.path()));
        let _held = ShellLock::acquire(&dir.path().join("dray.lock"), true).unwrap();

        assert_eq!(shell.run(["dray", "watch"]), EXIT_FATAL);
        assert_eq!(shell.run(["dray", "kill"]), EXIT_FATAL);
    }
}
