use crate::config::BackendConfig;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Health of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    /// No launch has been attempted yet
    NotStarted,
    /// The backend process is alive
    Running,
    /// A restart sequence is in progress
    Restarting,
    /// The backend exited or could not be launched
    NotRunning,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::NotStarted => "NotStarted",
            Health::Running => "Running",
            Health::Restarting => "Restarting",
            Health::NotRunning => "NotRunning",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response body of the control endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub health: String,
}

impl Status {
    pub fn new(health: impl Into<String>) -> Self {
        Self {
            health: health.into(),
        }
    }
}

impl From<Health> for Status {
    fn from(health: Health) -> Self {
        Self::new(health.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no backend command configured")]
    MissingCommand,
    #[error("invalid backend command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },
    #[error("failed to spawn backend '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("restart task failed: {0}")]
    Task(String),
}

/// Launch settings for the backend process
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Initial command line, used until a restart supplies another one
    pub command: Option<String>,
    /// Exported to the backend as `PORT`
    pub port: u16,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Time between SIGTERM and SIGKILL. `None` waits for exit indefinitely.
    pub shutdown_grace_period: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new(port: u16) -> Self {
        Self {
            command: None,
            port,
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace_period: None,
        }
    }

    /// Set the initial command (builder pattern)
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    /// Set extra environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the SIGKILL deadline (builder pattern)
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = Some(grace);
        self
    }
}

impl From<&BackendConfig> for SupervisorConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            command: config.command().map(str::to_string),
            port: config.port,
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            env: config.env.clone(),
            shutdown_grace_period: config.shutdown_grace_period(),
        }
    }
}

/// Snapshot of the live backend instance
#[derive(Debug, Clone)]
pub struct BackendHandle {
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// A launched backend and the task that owns its child process
struct BackendInstance {
    handle: BackendHandle,
    exited: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl BackendInstance {
    fn is_alive(&self) -> bool {
        self.handle.pid.is_some() && !self.exited.load(Ordering::SeqCst)
    }

    /// Ask the lifecycle task to stop the child and wait until it has exited
    async fn terminate(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = self.task.await {
            error!(pid = ?self.handle.pid, error = %e, "Backend lifecycle task failed");
        }
    }
}

/// Owns the single backend process.
///
/// Restarts are single-flight: a restart waits for any in-flight restart to
/// finish, then terminates the current instance and waits for it to exit
/// before launching the next one, so two instances never compete for the
/// backend port. The child itself is only ever touched by its lifecycle task.
///
/// The restart sequence runs in its own task, so a caller that goes away
/// (a dropped request) cannot leave the backend stopped but not relaunched.
pub struct Supervisor {
    config: SupervisorConfig,
    /// Most recently used command line
    last_command: Mutex<Option<String>>,
    /// Held for the whole restart sequence
    restart_gate: tokio::sync::Mutex<()>,
    /// Set while a restart sequence runs; `stop` holds the gate without it
    restarting: AtomicBool,
    current: RwLock<Option<BackendInstance>>,
    attempts: AtomicU64,
    launches: AtomicU64,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let last_command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty());

        Arc::new(Self {
            config,
            last_command: Mutex::new(last_command),
            restart_gate: tokio::sync::Mutex::new(()),
            restarting: AtomicBool::new(false),
            current: RwLock::new(None),
            attempts: AtomicU64::new(0),
            launches: AtomicU64::new(0),
        })
    }

    /// The command the next argument-less restart will use
    pub fn command(&self) -> Option<String> {
        self.last_command.lock().clone()
    }

    /// Number of backend processes spawned so far
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<BackendHandle> {
        self.current.read().as_ref().map(|i| i.handle.clone())
    }

    pub fn health(&self) -> Health {
        if self.restarting.load(Ordering::SeqCst) {
            return Health::Restarting;
        }

        match self.current.read().as_ref() {
            Some(instance) if instance.is_alive() => Health::Running,
            Some(_) => Health::NotRunning,
            None if self.attempts.load(Ordering::SeqCst) == 0 => Health::NotStarted,
            None => Health::NotRunning,
        }
    }

    pub fn status(&self) -> Status {
        self.health().into()
    }

    /// Replace the running backend with a fresh instance.
    ///
    /// `command` becomes the new default when given; otherwise the most
    /// recent command is reused. Returns as soon as the new process has been
    /// spawned, without waiting for it to become ready.
    ///
    /// Dropping the returned future does not cancel the restart: the
    /// terminate-and-launch sequence completes in the background.
    pub async fn restart(self: &Arc<Self>, command: Option<&str>) -> Result<Status, SupervisorError> {
        let (command, argv) = self.resolve_command(command)?;

        let supervisor = Arc::clone(self);
        let sequence = tokio::spawn(async move { supervisor.run_restart(command, argv).await });

        sequence
            .await
            .map_err(|e| SupervisorError::Task(e.to_string()))?
    }

    async fn run_restart(&self, command: String, argv: Vec<String>) -> Result<Status, SupervisorError> {
        let _gate = self.restart_gate.lock().await;
        let _restarting = RestartingFlag::raise(&self.restarting);
        info!(command = %command, "Restarting backend");

        let previous = self.current.write().take();
        if let Some(previous) = previous {
            debug!(pid = ?previous.handle.pid, "Waiting for previous backend to exit");
            previous.terminate().await;
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        let instance = self.launch(&command, &argv)?;
        *self.current.write() = Some(instance);

        Ok(Health::Restarting.into())
    }

    /// Terminate the backend, if any, and wait for it to exit
    pub async fn stop(&self) {
        let _gate = self.restart_gate.lock().await;

        let current = self.current.write().take();
        if let Some(instance) = current {
            info!(pid = ?instance.handle.pid, "Stopping backend");
            instance.terminate().await;
        }
    }

    fn resolve_command(
        &self,
        requested: Option<&str>,
    ) -> Result<(String, Vec<String>), SupervisorError> {
        let mut last = self.last_command.lock();

        if let Some(requested) = requested.filter(|c| !c.trim().is_empty()) {
            match parse_command(requested) {
                Ok(argv) => {
                    *last = Some(requested.to_string());
                    return Ok((requested.to_string(), argv));
                }
                Err(e) if last.is_some() => {
                    warn!(command = requested, error = %e, "Invalid backend command, reusing the previous one");
                }
                Err(e) => return Err(e),
            }
        }

        let command = last.clone().ok_or(SupervisorError::MissingCommand)?;
        let argv = parse_command(&command)?;
        Ok((command, argv))
    }

    fn launch(&self, command: &str, argv: &[String]) -> Result<BackendInstance, SupervisorError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SupervisorError::InvalidCommand {
                command: command.to_string(),
                reason: "empty command".to_string(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        // Set last so it replaces any PORT from the inherited or extra environment
        cmd.env("PORT", self.config.port.to_string());

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();
        self.launches.fetch_add(1, Ordering::SeqCst);
        info!(command, ?pid, port = self.config.port, "Backend process spawned");

        let exited = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            child,
            pid,
            stop_rx,
            Arc::clone(&exited),
            self.config.shutdown_grace_period,
        ));

        Ok(BackendInstance {
            handle: BackendHandle {
                command: command.to_string(),
                pid,
                started_at: Utc::now(),
            },
            exited,
            stop_tx: Some(stop_tx),
            task,
        })
    }
}

/// Holds `Health::Restarting` for the lifetime of a restart sequence
struct RestartingFlag<'a>(&'a AtomicBool);

impl<'a> RestartingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RestartingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Split a command line using shell quoting rules
pub fn parse_command(command: &str) -> Result<Vec<String>, SupervisorError> {
    let argv = shell_words::split(command).map_err(|e| SupervisorError::InvalidCommand {
        command: command.to_string(),
        reason: e.to_string(),
    })?;

    if argv.is_empty() {
        return Err(SupervisorError::InvalidCommand {
            command: command.to_string(),
            reason: "empty command".to_string(),
        });
    }

    Ok(argv)
}

/// Lifecycle task: the only place that waits on or signals the child.
/// A dropped stop sender counts as a stop request.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    mut stop_rx: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
    grace_period: Option<Duration>,
) {
    let stop_requested = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(?pid, %status, "Backend process exited"),
                Err(e) => error!(?pid, error = %e, "Failed to wait for backend process"),
            }
            false
        }
        _ = &mut stop_rx => true,
    };

    if stop_requested {
        terminate_child(&mut child, pid, grace_period).await;
    }

    exited.store(true, Ordering::SeqCst);
    debug!(?pid, "Backend lifecycle task finished");
}

async fn terminate_child(child: &mut Child, pid: Option<u32>, grace_period: Option<Duration>) {
    if let Some(pid) = pid {
        info!(pid, "Sending SIGTERM to backend");
        send_sigterm(child, pid);
    }

    let wait_result = match grace_period {
        Some(grace_period) => match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    ?pid,
                    grace_period_secs = grace_period.as_secs_f64(),
                    "Grace period exceeded, sending SIGKILL"
                );
                if let Err(e) = child.kill().await {
                    warn!(?pid, error = %e, "Failed to kill backend process");
                }
                return;
            }
        },
        None => child.wait().await,
    };

    match wait_result {
        Ok(status) => info!(?pid, %status, "Backend process exited gracefully"),
        Err(e) => warn!(?pid, error = %e, "Error waiting for backend to exit"),
    }
}

#[cfg(unix)]
fn send_sigterm(_child: &mut Child, pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}
