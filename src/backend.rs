//! The Backend instance: a stateful wrapper around one configured
//! (server, endpoint) pair. All mutable lifecycle state lives here; drivers
//! are stateless and only ever told what they need for one call.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

use crate::driver::{Driver, DriverCapabilities};
use crate::error::{Error, Result};

const INITIAL_STARTUP_DELAY: Duration = Duration::from_millis(150);
const STARTUP_DELAY_MULTIPLIER: f64 = 1.1;
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

struct BackendState {
    child: Option<Child>,
    port: Option<u16>,
    ready: bool,
    attached: bool,
    checkpoint_maybe_loaded: bool,
    kv_cache_saved: bool,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            child: None,
            port: None,
            ready: false,
            attached: false,
            checkpoint_maybe_loaded: false,
            kv_cache_saved: false,
        }
    }
}

/// One managed (server:endpoint) backend. Lifetime equals process lifetime.
pub struct Backend {
    /// `"<server>:<endpoint>"`, used for logging and as the manager's map key.
    key: String,
    driver: Arc<dyn Driver>,
    capabilities: DriverCapabilities,
    binary: Option<PathBuf>,
    attach_to: Option<String>,
    default_parameters: Vec<String>,
    endpoint_parameters: Vec<String>,
    model_unloading: bool,
    kv_cache_saving: bool,
    host: String,
    temp_dir: PathBuf,
    kv_cache_file_name: String,
    http: reqwest::Client,
    state: RwLock<BackendState>,
}

#[allow(clippy::too_many_arguments)]
pub struct BackendSpec {
    pub key: String,
    pub driver: Arc<dyn Driver>,
    pub binary: Option<PathBuf>,
    pub attach_to: Option<String>,
    pub default_parameters: Vec<String>,
    pub endpoint_parameters: Vec<String>,
    pub model_unloading: bool,
    pub kv_cache_saving: bool,
    pub host: String,
    pub temp_dir: PathBuf,
}

impl Backend {
    pub fn new(spec: BackendSpec) -> Self {
        let capabilities = spec.driver.capabilities();
        let kv_cache_file_name = {
            let (server, endpoint) = spec.key.split_once(':').unwrap_or((spec.key.as_str(), ""));
            format!("kv_cache-{server}-{endpoint}.bin")
        };
        Self {
            key: spec.key,
            driver: spec.driver,
            capabilities,
            binary: spec.binary,
            attach_to: spec.attach_to,
            default_parameters: spec.default_parameters,
            endpoint_parameters: spec.endpoint_parameters,
            model_unloading: spec.model_unloading,
            kv_cache_saving: spec.kv_cache_saving,
            host: spec.host,
            temp_dir: spec.temp_dir,
            kv_cache_file_name,
            http: reqwest::Client::new(),
            state: RwLock::new(BackendState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ensure the backend can service traffic. See SPEC_FULL.md §4.2.
    #[tracing::instrument(skip(self), fields(key = %self.key))]
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if state.attached {
            return Ok(());
        }

        if self.refresh_running(&mut state) && state.ready {
            return Ok(());
        }

        if let Some(attach_url) = self.attach_to.clone() {
            if self.driver.probe_ready(&self.http, &attach_url).await {
                state.attached = true;
                state.checkpoint_maybe_loaded = true;
                tracing::info!(key = %self.key, url = %attach_url, "attached to running instance");
                return Ok(());
            }
            tracing::debug!(key = %self.key, "attach probe failed");
        }

        if self.binary.is_some() {
            return self.start_service(&mut state).await;
        }

        Err(Error::BinaryMissing(self.key.clone()))
    }

    /// Release the accelerator. `force=true` always hard-shuts-down even if
    /// the driver supports live unloading.
    #[tracing::instrument(skip(self), fields(key = %self.key))]
    pub async fn quiesce(&self, force: bool) -> Result<()> {
        let mut state = self.state.write().await;

        let running = self.refresh_running(&mut state);
        if !running && !state.attached {
            return Ok(());
        }

        if self.kv_cache_saving {
            if let Ok(base_url) = self.base_url_locked(&state) {
                if self
                    .driver
                    .save_kv_cache(&self.http, &base_url, &self.kv_cache_file_name)
                    .await
                {
                    state.kv_cache_saved = true;
                } else {
                    tracing::warn!(key = %self.key, "kv cache save failed, continuing");
                }
            }
        }

        if !force && self.model_unloading {
            if let Ok(base_url) = self.base_url_locked(&state) {
                if self.driver.unload_model(&self.http, &base_url).await {
                    state.checkpoint_maybe_loaded = false;
                    return Ok(());
                }
                tracing::warn!(key = %self.key, "model unload failed, falling back to shutdown");
            }
        }

        self.shutdown(&mut state).await
    }

    /// `attachTo` if attached, else `http://host:port`.
    pub async fn url(&self) -> Result<String> {
        let state = self.state.read().await;
        self.base_url_locked(&state)
    }

    pub async fn is_running(&self) -> bool {
        let mut state = self.state.write().await;
        self.refresh_running(&mut state)
    }

    pub async fn is_attached(&self) -> bool {
        self.state.read().await.attached
    }

    pub async fn checkpoint_maybe_loaded(&self) -> bool {
        self.state.read().await.checkpoint_maybe_loaded
    }

    /// Best-effort shutdown of any live child, used at process exit.
    pub async fn shutdown_for_exit(&self) {
        let mut state = self.state.write().await;
        if state.child.is_some() {
            let _ = self.shutdown(&mut state).await;
        }
    }

    fn base_url_locked(&self, state: &BackendState) -> Result<String> {
        if state.attached {
            return self
                .attach_to
                .clone()
                .ok_or_else(|| Error::BackendUnavailable(self.key.clone()));
        }
        match state.port {
            Some(port) => Ok(format!("http://{}:{}", self.host, port)),
            None => Err(Error::BackendUnavailable(self.key.clone())),
        }
    }

    /// Re-checks the child process's liveness, resetting state if it exited.
    /// Returns whether the child is currently alive.
    fn refresh_running(&self, state: &mut BackendState) -> bool {
        let Some(child) = state.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(key = %self.key, %status, "child process exited");
                state.child = None;
                state.port = None;
                state.ready = false;
                false
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "failed to poll child status");
                state.child = None;
                state.port = None;
                state.ready = false;
                false
            }
        }
    }

    async fn allocate_ephemeral_port(&self) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind((self.host.as_str(), 0))
            .await
            .map_err(|e| Error::SpawnFailure(self.key.clone(), format!("could not allocate port: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::SpawnFailure(self.key.clone(), format!("could not read allocated port: {e}")))?
            .port();
        // Dropping the listener closes the socket; a small race window exists
        // between this close and the child's own bind. Documented, not retried.
        drop(listener);
        Ok(port)
    }

    async fn start_service(&self, state: &mut BackendState) -> Result<()> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| Error::BinaryMissing(self.key.clone()))?;

        if !binary.exists() {
            return Err(Error::BinaryMissing(self.key.clone()));
        }

        tracing::info!(key = %self.key, binary = %binary.display(), "starting backend");

        let port = self.allocate_ephemeral_port().await?;

        let kv_cache_dir = if self.kv_cache_saving {
            Some(self.temp_dir.join("kv_cache"))
        } else {
            None
        };
        if let Some(dir) = &kv_cache_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::SpawnFailure(self.key.clone(), format!("could not create kv_cache dir: {e}")))?;
        }

        let argv = self.driver.build_command_line(
            &self.default_parameters,
            &self.endpoint_parameters,
            port,
            kv_cache_dir.as_deref(),
            &self.temp_dir,
        )?;

        let mut command = Command::new(binary);
        command
            .args(&argv)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(overlay) = self.driver.build_environment(&self.host, port) {
            command.envs(overlay);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::SpawnFailure(self.key.clone(), format!("spawn failed: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_drain_task(self.key.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain_task(self.key.clone(), "stderr", stderr);
        }

        tokio::time::sleep(INITIAL_STARTUP_DELAY).await;

        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::SpawnFailure(self.key.clone(), e.to_string()))?
        {
            return Err(Error::SpawnFailure(
                self.key.clone(),
                format!("service failed to start (exited with {status})"),
            ));
        }

        let base_url = format!("http://{}:{}", self.host, port);
        let mut delay = INITIAL_STARTUP_DELAY;
        loop {
            if self.driver.probe_ready(&self.http, &base_url).await {
                break;
            }
            if let Some(status) = child
                .try_wait()
                .map_err(|e| Error::SpawnFailure(self.key.clone(), e.to_string()))?
            {
                return Err(Error::SpawnFailure(
                    self.key.clone(),
                    format!("exited while waiting for readiness (exited with {status})"),
                ));
            }
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(STARTUP_DELAY_MULTIPLIER);
        }

        if state.kv_cache_saved {
            self.driver
                .restore_kv_cache(&self.http, &base_url, &self.kv_cache_file_name)
                .await;
        }

        state.child = Some(child);
        state.port = Some(port);
        state.ready = true;
        state.checkpoint_maybe_loaded = true;

        tracing::info!(key = %self.key, port, "backend ready");
        Ok(())
    }

    async fn shutdown(&self, state: &mut BackendState) -> Result<()> {
        if let Some(mut child) = state.child.take() {
            if let Some(pid) = child.id() {
                send_sigterm(pid);
            }
            match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(key = %self.key, "shutdown grace period elapsed, force killing");
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
            tracing::info!(key = %self.key, "backend stopped");
        }

        state.port = None;
        state.ready = false;
        state.checkpoint_maybe_loaded = false;
        Ok(())
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

fn spawn_drain_task<R>(key: String, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(key = %key, stream, "{line}");
        }
    });
}
