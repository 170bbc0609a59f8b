//! Process supervisor: one OS process and pid file per worker definition.
//!
//! Workers are spawned as detached processes (new session, null stdio) so they
//! outlive the supervisor invocation that started them. Every command returns
//! a [`Report`] carrying the exit code and the operator messages; printing is
//! left to the caller (see [`shell`]).

use std::{
    ffi::OsString,
    io,
    os::unix::process::CommandExt as _,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use crate::{
    error::Error,
    process::{process_signalable, send_signal, shutdown_marker_path},
};

pub mod shell;

/// Environment variable carrying the 1-based worker number into the child.
pub const WORKER_ID_ENV: &str = "DRAY_WORKER_ID";
/// Environment variable carrying the worker name into the child.
pub const WORKER_NAME_ENV: &str = "DRAY_WORKER_NAME";

const DEFAULT_PID_DIR: &str = "tmp/pids";

/// Program and arguments that run one worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            current_dir: Some(dir.into()),
            ..self
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerDefinition {
    id: usize,
    name: String,
    command: WorkerCommand,
}

/// Stream a [`Message`] belongs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Standard output.
    Info,
    /// Standard error.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub level: Level,
    pub text: String,
}

/// Outcome of a supervisor command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    code: i32,
    messages: Vec<Message>,
}

impl Report {
    /// 0 when everything is as expected, 2 when at least one worker is not.
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Texts of all messages, in order.
    pub fn lines(&self) -> Vec<&str> {
        self.messages.iter().map(|m| m.text.as_str()).collect()
    }

    /// Write the messages to stdout and stderr.
    pub fn print(&self) {
        for message in &self.messages {
            match message.level {
                Level::Info => println!("{}", message.text),
                Level::Warn => eprintln!("{}", message.text),
            }
        }
    }

    fn info(&mut self, text: String) {
        self.messages.push(Message {
            level: Level::Info,
            text,
        });
    }

    fn warn(&mut self, text: String) {
        self.messages.push(Message {
            level: Level::Warn,
            text,
        });
    }

    fn unexpected(&mut self) {
        self.code = 2;
    }
}

/// Builder for [`Daemon`].
#[derive(Debug, Clone)]
pub struct DaemonBuilder {
    workers: Vec<WorkerDefinition>,
    pid_file: Option<String>,
    lock_file: PathBuf,
    lock_shell_commands: bool,
    shutdown_marker_dir: PathBuf,
    stop_file: Option<PathBuf>,
    quiet: bool,
    silence_watcher: bool,
    stop_poll_interval: Duration,
    stop_timeout: Option<Duration>,
}

impl Default for DaemonBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonBuilder {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            pid_file: None,
            lock_file: PathBuf::from("dray.lock"),
            lock_shell_commands: true,
            shutdown_marker_dir: PathBuf::from(DEFAULT_PID_DIR),
            stop_file: None,
            quiet: false,
            silence_watcher: false,
            stop_poll_interval: Duration::from_secs(1),
            stop_timeout: None,
        }
    }

    /// Add a worker definition. Workers are numbered from 1 in the order
    /// they are added.
    pub fn worker(mut self, name: impl Into<String>, command: WorkerCommand) -> Self {
        let id = self.workers.len() + 1;
        self.workers.push(WorkerDefinition {
            id,
            name: name.into(),
            command,
        });
        self
    }

    /// Pid file path; `%i` is replaced by the worker number and is required
    /// when more than one worker is defined.
    pub fn pid_file(self, template: impl Into<String>) -> Self {
        Self {
            pid_file: Some(template.into()),
            ..self
        }
    }

    pub fn lock_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            lock_file: path.into(),
            ..self
        }
    }

    pub fn lock_shell_commands(self, lock_shell_commands: bool) -> Self {
        Self {
            lock_shell_commands,
            ..self
        }
    }

    /// Where workers leave their shutdown markers. Must match the workers'
    /// `Config::shutdown_marker_dir`.
    pub fn shutdown_marker_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            shutdown_marker_dir: dir.into(),
            ..self
        }
    }

    /// While this file exists, `watch` leaves the workers alone.
    pub fn stop_file(self, path: impl Into<PathBuf>) -> Self {
        Self {
            stop_file: Some(path.into()),
            ..self
        }
    }

    pub fn quiet(self, quiet: bool) -> Self {
        Self { quiet, ..self }
    }

    /// Suppress the messages of starts triggered by `watch`.
    pub fn silence_watcher(self, silence_watcher: bool) -> Self {
        Self {
            silence_watcher,
            ..self
        }
    }

    pub fn stop_poll_interval(self, stop_poll_interval: Duration) -> Self {
        Self {
            stop_poll_interval,
            ..self
        }
    }

    /// Give up stopping a worker after this long.
    pub fn stop_timeout(self, stop_timeout: Duration) -> Self {
        Self {
            stop_timeout: Some(stop_timeout),
            ..self
        }
    }

    pub fn build(self) -> Result<Daemon, Error> {
        if self.workers.is_empty() {
            return Err(Error::config("No workers are defined."));
        }

        let count = self.workers.len();
        let pid_file = match self.pid_file {
            None if count > 1 => format!("{DEFAULT_PID_DIR}/dray.%i.pid"),
            None => format!("{DEFAULT_PID_DIR}/dray.pid"),
            Some(template) if count > 1 && !template.contains("%i") => {
                return Err(Error::config(
                    "Pid file must include placeholder \"%i\" for the worker id when defining more than one worker.",
                ));
            }
            Some(template) => template,
        };

        Ok(Daemon {
            workers: self.workers,
            pid_file,
            lock_file: self.lock_file,
            lock_shell_commands: self.lock_shell_commands,
            shutdown_marker_dir: self.shutdown_marker_dir,
            stop_file: self.stop_file,
            quiet: self.quiet,
            silence_watcher: self.silence_watcher,
            stop_poll_interval: self.stop_poll_interval,
            stop_timeout: self.stop_timeout,
        })
    }
}

#[derive(Debug)]
struct PidFile {
    path: PathBuf,
    pid: Option<u32>,
    alive: bool,
    marker: Option<PathBuf>,
}

impl PidFile {
    /// Alive and not on its way out.
    fn running(&self) -> bool {
        self.alive && self.marker.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Daemon {
    workers: Vec<WorkerDefinition>,
    pid_file: String,
    lock_file: PathBuf,
    lock_shell_commands: bool,
    shutdown_marker_dir: PathBuf,
    stop_file: Option<PathBuf>,
    quiet: bool,
    silence_watcher: bool,
    stop_poll_interval: Duration,
    stop_timeout: Option<Duration>,
}

impl Daemon {
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder::new()
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn locks_shell_commands(&self) -> bool {
        self.lock_shell_commands
    }

    /// Pid file of the worker with the given 1-based number.
    pub fn pid_file_for(&self, id: usize) -> PathBuf {
        PathBuf::from(self.pid_file.replace("%i", &id.to_string()))
    }

    /// Spawn every worker that is not running.
    pub fn start(&self) -> Result<Report, Error> {
        self.start_with(self.quiet)
    }

    fn start_with(&self, quiet: bool) -> Result<Report, Error> {
        let mut report = Report::default();
        let mut starting = false;

        for worker in &self.workers {
            let Some(pid_file) = self.read_pid(worker)? else {
                if !quiet {
                    report.warn(format!("Worker #{} ({}): Starting", worker.id, worker.name));
                    starting = true;
                }
                self.spawn(worker)?;
                continue;
            };

            if pid_file.running() {
                if !quiet {
                    report.warn(format!(
                        "Worker #{} ({}): Already started (PID {})",
                        worker.id,
                        worker.name,
                        pid_file.pid.unwrap_or_default()
                    ));
                }
                report.unexpected();
                continue;
            }

            remove_if_exists(&pid_file.path)?;
            if !quiet && pid_file.marker.is_none() {
                report.warn(format!(
                    "Worker #{} ({}): Starting (stale pid file)",
                    worker.id, worker.name
                ));
                starting = true;
            }
            self.spawn(worker)?;
            if let Some(marker) = &pid_file.marker {
                remove_if_exists(marker)?;
            }
        }

        // Nothing to say unless something was actually started.
        if !starting {
            report.messages.clear();
        }
        Ok(report)
    }

    /// Stop every live worker with TERM and INT, or KILL when `kill` is set.
    pub fn stop(&self, kill: bool) -> Result<Report, Error> {
        let mut report = Report::default();
        let quiet = self.quiet;

        for worker in &self.workers {
            match self.read_pid(worker)? {
                Some(PidFile {
                    path,
                    pid: Some(pid),
                    alive: true,
                    ..
                }) => {
                    if !quiet {
                        report.info(format!("Worker ({}) #{}: Stopping", worker.name, worker.id));
                    }
                    if !self.stop_worker(&path, pid, kill)? {
                        report.warn(format!(
                            "Worker ({}) #{}: Still running after {}s (PID {pid})",
                            worker.name,
                            worker.id,
                            self.stop_timeout.unwrap_or_default().as_secs()
                        ));
                        report.unexpected();
                    }
                }
                Some(pid_file) => {
                    remove_if_exists(&pid_file.path)?;
                    if !quiet {
                        report.info(format!(
                            "Worker ({}) #{}: Already stopped (stale PID file)",
                            worker.name, worker.id
                        ));
                    }
                }
                None => {
                    if !quiet {
                        report.warn(format!(
                            "Worker ({}) #{}: Already stopped",
                            worker.name, worker.id
                        ));
                    }
                    report.unexpected();
                }
            }
        }

        Ok(report)
    }

    pub fn status(&self) -> Result<Report, Error> {
        self.status_with(self.quiet)
    }

    fn status_with(&self, quiet: bool) -> Result<Report, Error> {
        let mut report = Report::default();

        for worker in &self.workers {
            match self.read_pid(worker)? {
                Some(pid_file) if pid_file.running() => {
                    if !quiet {
                        report.info(format!("Worker #{} ({}): Running", worker.id, worker.name));
                    }
                }
                Some(_) => {
                    if !quiet {
                        report.warn(format!(
                            "Worker #{} ({}): Not running (stale PID file)",
                            worker.id, worker.name
                        ));
                    }
                    report.unexpected();
                }
                None => {
                    if !quiet {
                        report.warn(format!("Worker #{} ({}): Not running", worker.id, worker.name));
                    }
                    report.unexpected();
                }
            }
        }

        Ok(report)
    }

    /// Start the workers if they should be running but are not.
    pub fn watch(&self) -> Result<Report, Error> {
        let should_be_running = self.stop_file.as_ref().is_none_or(|path| !path.exists());
        if should_be_running && self.status_with(true)?.code() != 0 {
            return self.start_with(self.quiet || self.silence_watcher);
        }
        Ok(Report::default())
    }

    pub fn restart(&self) -> Result<Report, Error> {
        let stopped = self.stop(false)?;
        let mut started = self.start()?;
        let mut messages = stopped.messages;
        messages.append(&mut started.messages);
        Ok(Report {
            code: started.code,
            messages,
        })
    }

    /// Ask every live worker to reopen its logs (SIGHUP).
    pub fn restart_logging(&self) -> Result<Report, Error> {
        self.signal_all(
            libc::SIGHUP,
            "Sent signal for restart-logging",
            "Could not send signal for restart-logging, process not found",
        )
    }

    /// Ask every live worker to drain and exit (SIGUSR1). Returns without
    /// waiting; a later `watch` starts the replacements.
    pub fn soft_restart(&self) -> Result<Report, Error> {
        self.signal_all(libc::SIGUSR1, "Sent soft-restart signal", "Process not found")
    }

    fn signal_all(&self, signal: libc::c_int, sent: &str, missing: &str) -> Result<Report, Error> {
        let mut report = Report::default();
        tracing::debug!(signal, workers = self.workers.len(), "Signalling workers");

        for worker in &self.workers {
            let Some(PidFile {
                pid: Some(pid),
                alive: true,
                ..
            }) = self.read_pid(worker)?
            else {
                continue;
            };

            match send_signal(pid, signal) {
                Ok(()) => report.info(format!("Worker ({}) #{}: {sent}", worker.name, worker.id)),
                Err(error) => {
                    tracing::debug!(pid, error = %error, "Failed to signal worker");
                    report.warn(format!("Worker ({}) #{}: {missing}", worker.name, worker.id));
                    report.unexpected();
                }
            }
        }

        Ok(report)
    }

    fn read_pid(&self, worker: &WorkerDefinition) -> Result<Option<PidFile>, Error> {
        let path = self.pid_file_for(worker.id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let pid = raw.trim().parse::<u32>().ok();
        let alive = pid.is_some_and(process_signalable);
        let marker = pid
            .map(|pid| shutdown_marker_path(&self.shutdown_marker_dir, pid))
            .filter(|marker| marker.exists());

        Ok(Some(PidFile {
            path,
            pid,
            alive,
            marker,
        }))
    }

    fn spawn(&self, worker: &WorkerDefinition) -> Result<u32, Error> {
        let WorkerCommand {
            program,
            args,
            envs,
            current_dir,
        } = &worker.command;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, worker.id.to_string())
            .env(WORKER_NAME_ENV, &worker.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = current_dir {
            command.current_dir(dir);
        }
        // SAFETY: setsid(2) is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        tracing::debug!(worker = worker.id, name = %worker.name, "Spawning worker");
        let mut child = command.spawn()?;
        let pid = child.id();

        let path = self.pid_file_for(worker.id);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, pid.to_string())?;

        std::thread::spawn(move || {
            if let Err(error) = child.wait() {
                tracing::warn!(pid, error = %error, "Failed to reap worker process");
            }
        });

        tracing::debug!(worker = worker.id, pid, "Worker spawned");
        Ok(pid)
    }

    /// `false` when the process outlived the stop timeout.
    fn stop_worker(&self, pid_file: &Path, pid: u32, kill: bool) -> Result<bool, Error> {
        let signals: &[libc::c_int] = if kill {
            &[libc::SIGKILL]
        } else {
            &[libc::SIGTERM, libc::SIGINT]
        };
        let started = Instant::now();

        tracing::debug!(pid, ?signals, "Stopping worker");
        'signal: loop {
            for signal in signals {
                if send_signal(pid, *signal).is_err() {
                    break 'signal;
                }
            }
            if self
                .stop_timeout
                .is_some_and(|timeout| started.elapsed() >= timeout)
            {
                return Ok(false);
            }
            std::thread::sleep(self.stop_poll_interval);
        }

        tracing::debug!(pid, "Worker stopped");
        remove_if_exists(pid_file)?;
        Ok(true)
    }
}

fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}
