//! Lifecycle supervision for local helper processes that double as upstreams:
//! launch, crash-restart, active health-check restart, and guaranteed
//! termination when stopped or when the parent exits.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{expand_env_vars, HealthCheckConfig, ProcessConfig};
use crate::error::SupervisorError;

const CRASH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_MONITOR_GRACE: Duration = Duration::from_secs(2);
const STOP_POLITE_WAIT: Duration = Duration::from_secs(5);
const STOP_KILL_WAIT: Duration = Duration::from_secs(2);

/// Supervises one helper process across its whole lifetime. `host`/`port`
/// identify the upstream the process is expected to serve, used only for
/// health-checking; the supervisor never dials them for proxying itself.
pub struct Supervisor {
    process: ProcessConfig,
    health_check: Option<HealthCheckConfig>,
    host: String,
    port: u16,
    child: Mutex<Option<Child>>,
    restart_attempts: AtomicU32,
    stopping: Arc<AtomicBool>,
    monitor_cancel: CancellationToken,
    health_consecutive_failures: AtomicU32,
}

impl Supervisor {
    pub fn new(process: ProcessConfig, health_check: Option<HealthCheckConfig>, host: String, port: u16) -> Self {
        Supervisor {
            process,
            health_check,
            host,
            port,
            child: Mutex::new(None),
            restart_attempts: AtomicU32::new(0),
            stopping: Arc::new(AtomicBool::new(false)),
            monitor_cancel: CancellationToken::new(),
            health_consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Launches the process, sleeps `startupDelayMs`, and reports a startup
    /// failure if the child already exited by then. Spawns the crash monitor
    /// and, if configured, the health monitor as background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut child = self.spawn_child()?;

        tokio::time::sleep(Duration::from_millis(self.process.startup_delay_ms)).await;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(SupervisorError::ExitedDuringStartup {
                file_name: self.process.file_name.clone(),
                status: status.code(),
            });
        }

        *self.child.lock().await = Some(child);

        if self.process.auto_restart {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.crash_monitor().await });
        }

        if self.health_check.as_ref().is_some_and(|h| h.enabled) && self.process.auto_start && !self.host.is_empty() {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.health_monitor().await });
        }

        Ok(())
    }

    fn spawn_child(&self) -> Result<Child, SupervisorError> {
        let file_name = expand_env_vars(&self.process.file_name);
        let arguments: Vec<String> = self.process.arguments.iter().map(|a| expand_env_vars(a)).collect();

        let mut command = Command::new(&file_name);
        command.args(&arguments).kill_on_drop(true);

        if let Some(dir) = &self.process.working_directory {
            command.current_dir(expand_env_vars(dir));
        }

        if self.process.redirect_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::LaunchFailure {
            file_name: file_name.clone(),
            source,
        })?;

        if let Some(stdout) = child.stdout.take() {
            let file_name = file_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(process = %file_name, "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let file_name = file_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process = %file_name, "{line}");
                }
            });
        }

        info!(process = %file_name, args = ?arguments, "helper process launched");
        Ok(child)
    }

    async fn crash_monitor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.monitor_cancel.cancelled() => return,
                _ = tokio::time::sleep(CRASH_POLL_INTERVAL) => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            let exited = {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                    None => false,
                }
            };
            if !exited {
                continue;
            }

            let status = {
                let mut guard = self.child.lock().await;
                guard.take().and_then(|mut c| c.try_wait().ok().flatten()).and_then(|s| s.code())
            };
            warn!(process = %self.process.file_name, exit_code = ?status, "helper process exited unexpectedly");

            let attempts = self.restart_attempts.load(Ordering::SeqCst);
            if self.process.max_restart_attempts > 0 && attempts >= self.process.max_restart_attempts {
                error!(process = %self.process.file_name, attempts, "maximum restart attempts reached, giving up");
                return;
            }

            tokio::select! {
                _ = self.monitor_cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(self.process.restart_delay_ms)) => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            let next_attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.spawn_child() {
                Ok(child) => {
                    info!(process = %self.process.file_name, attempt = next_attempt, "helper process restarted after crash");
                    *self.child.lock().await = Some(child);
                }
                Err(e) => error!(process = %self.process.file_name, error = %e, "restart attempt failed to launch"),
            }
        }
    }

    async fn health_monitor(self: Arc<Self>) {
        let Some(health) = self.health_check.clone() else { return };
        let threshold = health.failure_threshold;

        tokio::select! {
            _ = self.monitor_cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(health.interval_ms)) => {}
        }

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            let probe = timeout(Duration::from_millis(health.timeout_ms), TcpStream::connect((self.host.as_str(), self.port))).await;
            match probe {
                Ok(Ok(_)) => {
                    let previous = self.health_consecutive_failures.swap(0, Ordering::SeqCst);
                    if previous > 0 {
                        info!(process = %self.process.file_name, "health check recovered after {previous} consecutive failures");
                    }
                }
                Ok(Err(e)) => {
                    debug!(process = %self.process.file_name, error = %e, "health probe rejected");
                    self.record_health_failure(threshold).await;
                }
                Err(_) => {
                    debug!(process = %self.process.file_name, "health probe timed out");
                    self.record_health_failure(threshold).await;
                }
            }

            tokio::select! {
                _ = self.monitor_cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(health.interval_ms)) => {}
            }
        }
    }

    async fn record_health_failure(&self, threshold: u32) {
        let failures = self.health_consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < threshold {
            return;
        }
        self.health_consecutive_failures.store(0, Ordering::SeqCst);
        warn!(process = %self.process.file_name, failures, "health check threshold reached, restarting without touching restart attempts");

        {
            let mut guard = self.child.lock().await;
            if let Some(mut child) = guard.take() {
                terminate_child(&mut child).await;
            }
        }

        match self.spawn_child() {
            Ok(child) => *self.child.lock().await = Some(child),
            Err(e) => error!(process = %self.process.file_name, error = %e, "health-check-triggered restart failed to launch"),
        }
    }

    /// Sets `stopping` before cancelling monitors (I6), waits briefly for
    /// them to notice, then tree-kills the child: polite SIGTERM, a grace
    /// window, then SIGKILL.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.monitor_cancel.cancel();
        tokio::time::sleep(STOP_MONITOR_GRACE).await;

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            terminate_child(&mut child).await;
        }
    }
}

#[cfg(unix)]
async fn terminate_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    }
    if timeout(STOP_POLITE_WAIT, child.wait()).await.is_ok() {
        return;
    }
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    }
    let _ = timeout(STOP_KILL_WAIT, child.wait()).await;
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut Child) {
    let _ = child.kill().await;
}
