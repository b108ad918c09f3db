//! Local server supervisor
//!
//! Launches the STT and TTS inference servers as child processes, waits for
//! their health endpoints, restarts them after a crash with exponential
//! backoff, and tears them down on shutdown. The supervisor is the only owner
//! of the child processes. Everything else observes it through a
//! [`ReadinessGate`].

use crate::error::SupervisorError;
use crate::health::{HealthProbe, HealthStatus, HealthTarget};
use crate::settings::VoiceSettings;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How to launch and probe one managed server. Immutable once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub health_path: String,
}

impl ServerDescriptor {
    /// A server started as `{executable} {args...}` with no implied script.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        args: Vec<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args,
            working_dir: None,
            host: host.into(),
            port,
            health_path: "/health".to_string(),
        }
    }

    /// `{python} {script} --port {port} --host {host}`, run from the script's directory.
    pub fn python_script(
        name: impl Into<String>,
        python: impl Into<PathBuf>,
        script: impl AsRef<Path>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let script = script.as_ref();
        let host = host.into();
        let args = vec![
            script.display().to_string(),
            "--port".to_string(),
            port.to_string(),
            "--host".to_string(),
            host.clone(),
        ];
        let working_dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        Self {
            working_dir,
            ..Self::new(name, python, args, host, port)
        }
    }

    /// The Whisper STT server described by `settings`.
    pub fn stt_from_settings(settings: &VoiceSettings) -> Self {
        Self::python_script(
            "stt",
            &settings.python_path,
            &settings.stt_server_script,
            &settings.server_host,
            settings.stt_port,
        )
        .with_args(["--model", settings.whisper_model.as_str()])
    }

    /// The TTS server described by `settings`.
    pub fn tts_from_settings(settings: &VoiceSettings) -> Self {
        Self::python_script(
            "tts",
            &settings.python_path,
            &settings.tts_server_script,
            &settings.server_host,
            settings.tts_port,
        )
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn health_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.health_path)
    }

    fn health_target(&self) -> HealthTarget {
        HealthTarget::new(&self.name, self.health_url())
    }
}

/// Startup, crash-restart and shutdown timing.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Crash restarts allowed before the server is declared fatal.
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Interval of the monitor loop.
    pub poll_interval: Duration,
    /// Health polls after launch before giving up on a start.
    pub startup_attempts: u32,
    pub startup_interval: Duration,
    /// Time between the termination signal and a force kill.
    pub stop_grace: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            // model loading can take a while on first launch
            startup_attempts: 120,
            startup_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `restarts + 1`.
    pub fn backoff(&self, restarts: u32) -> Duration {
        let factor = 2u32.saturating_pow(restarts.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Restarting,
    Stopped,
    /// Launch failed; stays down until a manual restart.
    Failed,
    /// Restart budget exhausted; stays down until a manual restart.
    Fatal,
}

/// Snapshot of one managed server.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    /// Only set while the process is running.
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_health: Option<HealthStatus>,
}

/// Whether turns may start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// No server has been started yet.
    Pending,
    Ready,
    /// Some servers are starting, restarting, stopped or failing health checks.
    Unavailable { servers: Vec<String> },
    /// A server failed to launch or exhausted its restart budget.
    Fatal { server: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Read side of the supervisor's readiness flag.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    rx: watch::Receiver<Readiness>,
}

impl ReadinessGate {
    /// A gate with no servers behind it, used when STT/TTS are remote.
    pub fn always_ready() -> Self {
        let (_tx, rx) = watch::channel(Readiness::Ready);
        Self { rx }
    }

    /// A gate fed by periodic health checks of servers this process does not
    /// launch. It reads ready only after every target answered in the same
    /// round. The probe loop ends when `cancel` fires or every clone of the
    /// gate is dropped.
    pub fn from_probe(
        probe: HealthProbe,
        targets: Vec<HealthTarget>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(Readiness::Pending);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let round = futures::future::join_all(targets.iter().map(|t| probe.probe(t))).await;
                        let down: Vec<String> = round
                            .into_iter()
                            .filter(|h| !h.reachable)
                            .map(|h| h.server_name)
                            .collect();
                        let next = if down.is_empty() {
                            Readiness::Ready
                        } else {
                            Readiness::Unavailable { servers: down }
                        };
                        let previous = tx.send_replace(next.clone());
                        if previous != next {
                            info!(readiness = ?next, "external server readiness changed");
                        }
                    }
                }
            }
            debug!("external health watch stopped");
        });
        Self { rx }
    }

    pub fn current(&self) -> Readiness {
        self.rx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_ready()
    }

    /// Wait until the gate reports ready or `timeout` passes.
    pub async fn wait_ready(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.rx.wait_for(Readiness::is_ready))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// One managed process. Owned exclusively by the supervisor.
struct ServerHandle {
    descriptor: Arc<ServerDescriptor>,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    restart_count: u32,
    last_health: Option<HealthStatus>,
    state: ServerState,
}

impl ServerHandle {
    fn new(descriptor: Arc<ServerDescriptor>) -> Self {
        Self {
            descriptor,
            child: None,
            pid: None,
            started_at: None,
            restart_count: 0,
            last_health: None,
            state: ServerState::Starting,
        }
    }

    fn attach(&mut self, launched: Launched) {
        self.pid = launched.child.id();
        self.child = Some(launched.child);
        self.started_at = Some(Utc::now());
        self.last_health = Some(launched.health);
        self.state = ServerState::Running;
    }

    fn detach(&mut self, state: ServerState) -> Option<Child> {
        self.pid = None;
        self.state = state;
        self.child.take()
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.descriptor.name.clone(),
            state: self.state,
            pid: self.pid,
            started_at: self.started_at,
            restart_count: self.restart_count,
            last_health: self.last_health.clone(),
        }
    }

    fn is_healthy(&self) -> bool {
        self.state == ServerState::Running
            && self.last_health.as_ref().map_or(false, |h| h.reachable)
    }
}

/// A process that passed its startup health check.
struct Launched {
    child: Child,
    health: HealthStatus,
}

struct Inner {
    handles: Mutex<BTreeMap<String, ServerHandle>>,
    probe: HealthProbe,
    policy: RestartPolicy,
    readiness: watch::Sender<Readiness>,
}

struct MonitorTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the managed server processes.
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
    monitor: std::sync::Mutex<Option<MonitorTask>>,
}

impl ProcessSupervisor {
    pub fn new(policy: RestartPolicy, probe: HealthProbe) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            inner: Arc::new(Inner {
                handles: Mutex::new(BTreeMap::new()),
                probe,
                policy,
                readiness,
            }),
            monitor: std::sync::Mutex::new(None),
        }
    }

    pub fn readiness_gate(&self) -> ReadinessGate {
        ReadinessGate {
            rx: self.inner.readiness.subscribe(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.readiness.borrow().clone()
    }

    /// Launch a server and wait for its health endpoint.
    ///
    /// Starting a server that is already running returns its current status.
    pub async fn start(&self, descriptor: ServerDescriptor) -> Result<ServerStatus, SupervisorError> {
        let name = descriptor.name.clone();
        let descriptor = Arc::new(descriptor);
        {
            let mut handles = self.inner.handles.lock().await;
            if let Some(existing) = handles.get(&name) {
                if matches!(existing.state, ServerState::Running | ServerState::Starting) {
                    return Ok(existing.status());
                }
            }
            handles.insert(name.clone(), ServerHandle::new(Arc::clone(&descriptor)));
        }
        self.inner.publish().await;

        let result = self.inner.launch(&descriptor).await;
        let (outcome, orphan) = {
            let mut handles = self.inner.handles.lock().await;
            // A stop, restart or shutdown during launch replaces or parks the handle.
            let handle = handles
                .get_mut(&name)
                .filter(|h| Arc::ptr_eq(&h.descriptor, &descriptor))
                .filter(|h| h.state == ServerState::Starting);
            match (handle, result) {
                (Some(handle), Ok(launched)) => {
                    handle.attach(launched);
                    info!(server = %name, pid = ?handle.pid, port = descriptor.port, "server running");
                    (Ok(handle.status()), None)
                }
                (Some(handle), Err(e)) => {
                    handle.detach(ServerState::Failed);
                    error!(server = %name, error = %e, "server failed to start");
                    (Err(e), None)
                }
                (None, Ok(launched)) => {
                    info!(server = %name, "server stopped while starting; discarding process");
                    (
                        Err(SupervisorError::StoppedDuringStart(name.clone())),
                        Some(launched.child),
                    )
                }
                (None, Err(e)) => {
                    debug!(server = %name, error = %e, "launch of a stopped server failed");
                    (Err(SupervisorError::StoppedDuringStart(name.clone())), None)
                }
            }
        };
        if let Some(child) = orphan {
            if let Err(e) = terminate(child, self.inner.policy.stop_grace).await {
                warn!(server = %name, error = %e, "failed to terminate discarded server");
            }
        }
        self.inner.publish().await;
        outcome
    }

    /// Terminate a server. Stopping a stopped server is a no-op.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let child = {
            let mut handles = self.inner.handles.lock().await;
            let handle = handles
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
            handle.detach(ServerState::Stopped)
        };
        self.inner.publish().await;

        if let Some(child) = child {
            info!(server = %name, "stopping server");
            terminate(child, self.inner.policy.stop_grace).await?;
        }
        Ok(())
    }

    /// Manual restart: clears a failed or fatal state and the restart counter.
    pub async fn restart(&self, name: &str) -> Result<ServerStatus, SupervisorError> {
        let descriptor = {
            let handles = self.inner.handles.lock().await;
            let handle = handles
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownServer(name.to_string()))?;
            Arc::clone(&handle.descriptor)
        };
        self.stop(name).await?;
        {
            let mut handles = self.inner.handles.lock().await;
            handles.remove(name);
        }
        self.start((*descriptor).clone()).await
    }

    pub async fn status(&self) -> Vec<ServerStatus> {
        let handles = self.inner.handles.lock().await;
        handles.values().map(ServerHandle::status).collect()
    }

    /// Spawn the background loop that health-checks running servers and
    /// restarts crashed ones. Calling it twice keeps the first loop.
    pub fn spawn_monitor(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if monitor.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.policy.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => Arc::clone(&inner).tick(&token).await,
                }
            }
            debug!("supervisor monitor stopped");
        });
        *monitor = Some(MonitorTask { cancel, join });
    }

    /// Stop the monitor, then every server.
    pub async fn shutdown(&self) {
        let task = self
            .monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.join.await {
                warn!(error = %e, "supervisor monitor ended abnormally");
            }
        }

        let names: Vec<String> = self.inner.handles.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(server = %name, error = %e, "failed to stop server during shutdown");
            }
        }
        info!("supervisor shut down");
    }
}

impl Inner {
    /// Spawn the process and poll its health until it answers.
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<Launched, SupervisorError> {
        let mut child = spawn(descriptor)?;
        let target = descriptor.health_target();

        for attempt in 1..=self.policy.startup_attempts.max(1) {
            if let Some(status) = child.try_wait()? {
                return Err(if port_answers(descriptor).await {
                    SupervisorError::PortInUse {
                        server: descriptor.name.clone(),
                        port: descriptor.port,
                    }
                } else {
                    SupervisorError::Launch {
                        server: descriptor.name.clone(),
                        reason: format!("exited during startup ({})", status),
                    }
                });
            }

            let health = self.probe.probe(&target).await;
            if health.reachable {
                debug!(server = %descriptor.name, attempt, "startup health check passed");
                return Ok(Launched { child, health });
            }
            tokio::time::sleep(self.policy.startup_interval).await;
        }

        if let Err(e) = child.kill().await {
            warn!(server = %descriptor.name, error = %e, "failed to kill unhealthy server");
        }
        if port_answers(descriptor).await {
            return Err(SupervisorError::PortInUse {
                server: descriptor.name.clone(),
                port: descriptor.port,
            });
        }
        Err(SupervisorError::Launch {
            server: descriptor.name.clone(),
            reason: format!(
                "not healthy after {} health checks",
                self.policy.startup_attempts
            ),
        })
    }

    /// One monitor pass: reap crashed processes, probe the live ones.
    async fn tick(self: Arc<Self>, cancel: &CancellationToken) {
        let mut crashed = Vec::new();
        let mut alive = Vec::new();
        {
            let mut handles = self.handles.lock().await;
            for (name, handle) in handles.iter_mut() {
                if handle.state != ServerState::Running {
                    continue;
                }
                let exited = match handle.child.as_mut().map(Child::try_wait) {
                    Some(Ok(None)) => None,
                    Some(Ok(Some(status))) => Some(status.to_string()),
                    Some(Err(e)) => Some(e.to_string()),
                    None => Some("process handle missing".to_string()),
                };
                match exited {
                    None => alive.push(handle.descriptor.health_target()),
                    Some(reason) => {
                        warn!(server = %name, pid = ?handle.pid, %reason, "server exited unexpectedly");
                        handle.detach(ServerState::Restarting);
                        crashed.push(name.clone());
                    }
                }
            }
        }

        let probes = futures::future::join_all(alive.iter().map(|t| self.probe.probe(t))).await;
        {
            let mut handles = self.handles.lock().await;
            for health in probes {
                if let Some(handle) = handles.get_mut(&health.server_name) {
                    if handle.state == ServerState::Running {
                        if !health.reachable {
                            warn!(server = %health.server_name, "server failed health check");
                        }
                        handle.last_health = Some(health);
                    }
                }
            }
        }
        self.publish().await;

        for name in crashed {
            let inner = Arc::clone(&self);
            let cancel = cancel.child_token();
            tokio::spawn(async move { inner.recover(name, cancel).await });
        }
    }

    /// Relaunch a crashed server with exponential backoff until it runs or the
    /// restart budget is spent.
    async fn recover(self: Arc<Self>, name: String, cancel: CancellationToken) {
        loop {
            let (descriptor, restarts) = {
                let mut handles = self.handles.lock().await;
                let Some(handle) = handles.get_mut(&name) else {
                    return;
                };
                if handle.state != ServerState::Restarting {
                    return;
                }
                if handle.restart_count >= self.policy.max_restarts {
                    handle.state = ServerState::Fatal;
                    error!(
                        server = %name,
                        restarts = handle.restart_count,
                        "{}",
                        SupervisorError::ServerFatal {
                            server: name.clone(),
                            restarts: handle.restart_count,
                        }
                    );
                    drop(handles);
                    self.publish().await;
                    return;
                }
                handle.restart_count += 1;
                (Arc::clone(&handle.descriptor), handle.restart_count - 1)
            };

            let delay = self.policy.backoff(restarts);
            info!(server = %name, attempt = restarts + 1, ?delay, "restarting server");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = self.launch(&descriptor).await;
            let mut handles = self.handles.lock().await;
            let Some(handle) = handles.get_mut(&name) else {
                return;
            };
            match result {
                Ok(launched) if handle.state == ServerState::Restarting && !cancel.is_cancelled() => {
                    handle.attach(launched);
                    info!(server = %name, pid = ?handle.pid, "server restarted");
                    drop(handles);
                    self.publish().await;
                    return;
                }
                Ok(launched) => {
                    // stopped or shut down while we were relaunching
                    drop(handles);
                    let _ = terminate(launched.child, self.policy.stop_grace).await;
                    return;
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "restart attempt failed");
                }
            }
        }
    }

    /// Recompute readiness from the handle table and broadcast changes.
    async fn publish(&self) {
        let next = {
            let handles = self.handles.lock().await;
            compute_readiness(handles.values())
        };
        let previous = self.readiness.send_replace(next.clone());
        if previous != next {
            info!(readiness = ?next, "readiness changed");
        }
    }
}

fn compute_readiness<'a>(handles: impl Iterator<Item = &'a ServerHandle>) -> Readiness {
    let mut seen = false;
    let mut unavailable = Vec::new();
    for handle in handles {
        seen = true;
        if matches!(handle.state, ServerState::Fatal | ServerState::Failed) {
            return Readiness::Fatal {
                server: handle.descriptor.name.clone(),
            };
        }
        if !handle.is_healthy() {
            unavailable.push(handle.descriptor.name.clone());
        }
    }
    match (seen, unavailable.is_empty()) {
        (false, _) => Readiness::Pending,
        (true, true) => Readiness::Ready,
        (true, false) => Readiness::Unavailable {
            servers: unavailable,
        },
    }
}

fn spawn(descriptor: &ServerDescriptor) -> Result<Child, SupervisorError> {
    let mut command = Command::new(&descriptor.executable);
    command
        .args(&descriptor.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &descriptor.working_dir {
        command.current_dir(dir);
    }

    info!(
        server = %descriptor.name,
        executable = %descriptor.executable.display(),
        args = ?descriptor.args,
        port = descriptor.port,
        "launching server"
    );
    let mut child = command.spawn().map_err(|e| SupervisorError::Launch {
        server: descriptor.name.clone(),
        reason: format!("{}: {}", descriptor.executable.display(), e),
    })?;

    if let Some(stdout) = child.stdout.take() {
        forward_output(descriptor.name.clone(), stdout, false);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(descriptor.name.clone(), stderr, true);
    }
    Ok(child)
}

/// Pipe a child's output into the log, line by line.
fn forward_output<R>(server: String, stream: R, is_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(target: "parley_voice::server_output", server = %server, "{}", line);
            } else {
                debug!(target: "parley_voice::server_output", server = %server, "{}", line);
            }
        }
    });
}

/// True when something accepts TCP connections on the descriptor's port.
async fn port_answers(descriptor: &ServerDescriptor) -> bool {
    let addr = (descriptor.host.as_str(), descriptor.port);
    matches!(
        tokio::time::timeout(
            Duration::from_millis(500),
            tokio::net::TcpStream::connect(addr)
        )
        .await,
        Ok(Ok(_))
    )
}

/// Ask the process to exit, then force-kill it after `grace`.
async fn terminate(mut child: Child, grace: Duration) -> Result<(), SupervisorError> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signalling a pid we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        child.start_kill()?;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            debug!(status = ?status, "server exited");
            Ok(())
        }
        Err(_) => {
            warn!(?grace, "server ignored termination signal; killing");
            child.kill().await?;
            Ok(())
        }
    }
}
