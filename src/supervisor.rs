//! Child process supervision: spawning services, health checking them,
//! tailing their output, and tearing them down.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Duration, sleep, timeout};

use crate::config::SupervisorConfig;
use crate::errors::{PactownError, Result};
use crate::runtime::driver_for;
use crate::sandbox::Sandbox;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Stopping,
    Dead,
}

/// Caller-facing snapshot of one supervised process.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub state: ProcessState,
    pub log_tail: Vec<String>,
}

struct ServiceEntry {
    pid: u32,
    port: u16,
    started_at: DateTime<Utc>,
    state: ProcessState,
    log_tail: VecDeque<String>,
    child: Option<Child>,
}

impl ServiceEntry {
    fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            pid: self.pid,
            port: self.port,
            started_at: self.started_at,
            state: self.state,
            log_tail: self.log_tail.iter().cloned().collect(),
        }
    }
}

/// Owns the table of live service processes.
///
/// The table mutex guards only map and state updates; it is never held
/// across process or network I/O.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    table: Arc<Mutex<HashMap<String, ServiceEntry>>>,
    http: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.health_attempt_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            table: Arc::new(Mutex::new(HashMap::new())),
            http,
        }
    }

    /// Spawn the service command inside its sandbox and supervise it.
    ///
    /// Any pre-existing listener on the port is killed best-effort first.
    /// With a health path the call blocks until the service answers 2xx
    /// (or times out); without one the handle is `Ready` on spawn.
    pub async fn start(
        &self,
        service_id: &str,
        sandbox: &Sandbox,
        run_cmd: &str,
        env: &std::collections::BTreeMap<String, String>,
        health_path: Option<&str>,
        skip_health_check: bool,
    ) -> Result<ProcessHandle> {
        ensure_port_free(sandbox.port, true).await?;

        let command_line = substitute_port(run_cmd, sandbox.port);
        log::info!("starting '{service_id}' on port {}: {command_line}", sandbox.port);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command_line)
            .current_dir(&sandbox.path)
            .env("MARKPACT_PORT", sandbox.port.to_string())
            .env("PORT", sandbox.port.to_string())
            .envs(env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        if let Some(bin) = driver_for(sandbox.runtime).and_then(|d| d.bin_dir(&sandbox.path)) {
            cmd.env("PATH", prefixed_path(&bin));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PactownError::Spawn(format!("could not spawn '{command_line}': {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| PactownError::Spawn("child exited before it was tracked".into()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut table = self.table.lock().expect("supervisor table poisoned");
            table.insert(
                service_id.to_string(),
                ServiceEntry {
                    pid,
                    port: sandbox.port,
                    started_at: Utc::now(),
                    state: ProcessState::Starting,
                    log_tail: VecDeque::new(),
                    child: Some(child),
                },
            );
        }

        if let Some(stdout) = stdout {
            self.spawn_output_reader(service_id, stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_output_reader(service_id, stderr);
        }
        self.spawn_exit_monitor(service_id);

        let stopped_underneath =
            || PactownError::Spawn("service was stopped during startup".into());

        if skip_health_check || health_path.is_none() {
            self.set_state(service_id, ProcessState::Ready);
            return self.handle(service_id).ok_or_else(stopped_underneath);
        }

        let path = normalized_health_path(health_path.unwrap_or("/health"));
        self.await_ready(service_id, sandbox.port, &path).await?;
        self.spawn_liveness_loop(service_id, sandbox.port, path);
        self.handle(service_id).ok_or_else(stopped_underneath)
    }

    /// Poll the health endpoint until the first 2xx, the child dying, or
    /// the attempt budget running out.
    async fn await_ready(&self, service_id: &str, port: u16, path: &str) -> Result<()> {
        let url = format!("http://127.0.0.1:{port}{path}");
        for _ in 0..self.config.startup_attempts {
            match self.state_of(service_id) {
                Some(ProcessState::Dead) | None => {
                    let tail = self.log_tail(service_id).join("\n");
                    return Err(PactownError::Spawn(format!(
                        "service exited before becoming healthy:\n{tail}"
                    )));
                }
                _ => {}
            }
            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status().is_success() {
                    self.set_state(service_id, ProcessState::Ready);
                    log::info!("'{service_id}' is ready on port {port}");
                    return Ok(());
                }
            }
            sleep(self.config.health_interval).await;
        }

        log::warn!("'{service_id}' never answered {url}; stopping it");
        let _ = self.stop(service_id).await;
        Err(PactownError::HealthTimeout {
            port,
            attempts: self.config.startup_attempts,
        })
    }

    /// Gracefully stop a service: SIGTERM, a grace period, then SIGKILL.
    /// Returns false (not an error) when the id is unknown.
    pub async fn stop(&self, service_id: &str) -> Result<bool> {
        let entry = {
            let mut table = self.table.lock().expect("supervisor table poisoned");
            table.remove(service_id)
        };
        let Some(mut entry) = entry else {
            return Ok(false);
        };
        entry.state = ProcessState::Stopping;
        log::info!("stopping '{service_id}' (pid {})", entry.pid);

        terminate_pid(entry.pid).await;

        if let Some(mut child) = entry.child.take() {
            match timeout(self.config.stop_grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    log::warn!("'{service_id}' ignored SIGTERM; killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
        Ok(true)
    }

    /// Stop every supervised service; used on teardown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let table = self.table.lock().expect("supervisor table poisoned");
            table.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }

    pub fn handle(&self, service_id: &str) -> Option<ProcessHandle> {
        let table = self.table.lock().expect("supervisor table poisoned");
        table.get(service_id).map(ServiceEntry::handle)
    }

    pub fn list(&self) -> Vec<(String, ProcessHandle)> {
        let table = self.table.lock().expect("supervisor table poisoned");
        let mut entries: Vec<_> = table
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Last lines of merged stdout/stderr for a service, oldest first.
    pub fn log_tail(&self, service_id: &str) -> Vec<String> {
        let table = self.table.lock().expect("supervisor table poisoned");
        table
            .get(service_id)
            .map(|entry| entry.log_tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn state_of(&self, service_id: &str) -> Option<ProcessState> {
        let table = self.table.lock().expect("supervisor table poisoned");
        table.get(service_id).map(|entry| entry.state)
    }

    fn set_state(&self, service_id: &str, state: ProcessState) {
        let mut table = self.table.lock().expect("supervisor table poisoned");
        if let Some(entry) = table.get_mut(service_id) {
            entry.state = state;
        }
    }

    fn push_log_line(&self, service_id: &str, line: String, cap: usize) {
        let mut table = self.table.lock().expect("supervisor table poisoned");
        if let Some(entry) = table.get_mut(service_id) {
            if entry.log_tail.len() >= cap {
                entry.log_tail.pop_front();
            }
            entry.log_tail.push_back(line);
        }
    }

    fn spawn_output_reader(
        &self,
        service_id: &str,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let supervisor = self.clone_parts();
        let id = service_id.to_string();
        let cap = self.config.log_tail_lines;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[{id}] {line}");
                supervisor.push_log_line(&id, line, cap);
            }
        });
    }

    /// Watch for child exit and flip the handle to `Dead`. The wait also
    /// reaps the process so no zombies accumulate.
    fn spawn_exit_monitor(&self, service_id: &str) {
        let supervisor = self.clone_parts();
        let id = service_id.to_string();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_millis(200)).await;
                let mut table = supervisor.table.lock().expect("supervisor table poisoned");
                let Some(entry) = table.get_mut(&id) else {
                    return;
                };
                let Some(child) = entry.child.as_mut() else {
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::warn!("'{id}' exited with {status}");
                        entry.state = ProcessState::Dead;
                        entry.child = None;
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!("could not poll '{id}': {err}");
                        return;
                    }
                }
            }
        });
    }

    /// Ongoing liveness polling once a service is ready; N consecutive
    /// failures flip the handle to `Dead`.
    fn spawn_liveness_loop(&self, service_id: &str, port: u16, path: String) {
        let supervisor = self.clone_parts();
        let id = service_id.to_string();
        let interval = self.config.health_interval;
        let max_failures = self.config.max_consecutive_failures;
        let url = format!("http://127.0.0.1:{port}{path}");
        tokio::spawn(async move {
            let mut failures = 0;
            loop {
                sleep(interval).await;
                match supervisor.state_of(&id) {
                    Some(ProcessState::Ready) => {}
                    _ => return,
                }
                let healthy = match supervisor.http.get(&url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(_) => false,
                };
                if healthy {
                    failures = 0;
                } else {
                    failures += 1;
                    if failures >= max_failures {
                        log::warn!("'{id}' failed {failures} consecutive health checks");
                        supervisor.set_state(&id, ProcessState::Dead);
                        return;
                    }
                }
            }
        });
    }

    fn clone_parts(&self) -> SupervisorParts {
        SupervisorParts {
            table: self.table.clone(),
            http: self.http.clone(),
        }
    }
}

/// The subset of supervisor state background tasks need.
struct SupervisorParts {
    table: Arc<Mutex<HashMap<String, ServiceEntry>>>,
    http: reqwest::Client,
}

impl SupervisorParts {
    fn state_of(&self, service_id: &str) -> Option<ProcessState> {
        let table = self.table.lock().expect("supervisor table poisoned");
        table.get(service_id).map(|entry| entry.state)
    }

    fn set_state(&self, service_id: &str, state: ProcessState) {
        let mut table = self.table.lock().expect("supervisor table poisoned");
        if let Some(entry) = table.get_mut(service_id) {
            entry.state = state;
        }
    }

    fn push_log_line(&self, service_id: &str, line: String, cap: usize) {
        let mut table = self.table.lock().expect("supervisor table poisoned");
        if let Some(entry) = table.get_mut(service_id) {
            if entry.log_tail.len() >= cap {
                entry.log_tail.pop_front();
            }
            entry.log_tail.push_back(line);
        }
    }
}

/// Replace the run command's `$PORT` token with the allocated port. The
/// `${MARKPACT_PORT:-...}` form is resolved by the shell from the injected
/// environment.
pub fn substitute_port(cmd: &str, port: u16) -> String {
    cmd.replace("${PORT}", &port.to_string())
        .replace("$PORT", &port.to_string())
}

fn normalized_health_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn prefixed_path(bin: &std::path::Path) -> String {
    match std::env::var("PATH") {
        Ok(existing) => format!("{}:{existing}", bin.display()),
        Err(_) => bin.display().to_string(),
    }
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Best-effort SIGTERM of whatever currently listens on `port`. Returns
/// true when at least one process was signaled.
pub async fn kill_process_on_port(port: u16) -> bool {
    let output = Command::new("lsof")
        .args(["-ti", &format!(":{port}")])
        .output()
        .await;
    let Ok(output) = output else {
        return false;
    };
    let mut signaled = false;
    for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        log::info!("killing pid {pid} holding port {port}");
        if let Ok(status) = Command::new("kill").args(["-TERM", pid]).status().await {
            signaled = signaled || status.success();
        }
    }
    signaled
}

async fn terminate_pid(pid: u32) {
    let _ = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await;
}

/// Verify `port` is bindable, killing a pre-existing listener once when
/// permitted. A port still busy after the single kill attempt is an error.
pub async fn ensure_port_free(port: u16, allow_kill: bool) -> Result<()> {
    if port_is_free(port) {
        return Ok(());
    }
    if !allow_kill {
        return Err(PactownError::Spawn(format!("port {port} is already in use")));
    }
    log::warn!("port {port} is busy; attempting to free it");
    kill_process_on_port(port).await;
    sleep(Duration::from_millis(500)).await;
    if port_is_free(port) {
        Ok(())
    } else {
        Err(PactownError::Spawn(format!(
            "port {port} is still in use after killing the previous listener"
        )))
    }
}
