use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

const QUICK_PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);
const LOG_TAIL_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("server binary not found: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("model file not found: {}", .0.display())]
    MissingModelFile(PathBuf),
    #[error("failed to open log file {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {}: {source}", .bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("server did not become ready within {timeout_secs}s\n--- log tail ---\n{log_tail}")]
    StartTimeout {
        timeout_secs: u64,
        log_path: PathBuf,
        log_tail: String,
    },
}

/// Supervises one locally spawned model-serving process. The server is
/// considered ready once its models endpoint answers 200.
pub struct LlamaServer {
    bin: PathBuf,
    host: String,
    port: u16,
    args: Vec<String>,
    log_path: PathBuf,
    http: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl LlamaServer {
    pub fn new(config: &RuntimeConfig, log_path: PathBuf) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            bin: PathBuf::from(&config.bin),
            host: config.host.clone(),
            port: config.port,
            args: config.args.clone(),
            log_path,
            http,
            child: Mutex::new(None),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Brings the server to a ready state. If something already answers the
    /// readiness probe, nothing is spawned. The child handle lock is held
    /// for the whole sequence so concurrent starts cannot double-spawn.
    pub async fn start(&self, wait_timeout: Duration) -> Result<(), RuntimeError> {
        let mut guard = self.child.lock().await;

        if self.probe(QUICK_PROBE_TIMEOUT).await {
            debug!(host = %self.host, port = self.port, "server already answering, skipping spawn");
            return Ok(());
        }

        self.preflight()?;

        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RuntimeError::LogFile {
                path: self.log_path.clone(),
                source,
            })?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| RuntimeError::LogFile {
                path: self.log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| RuntimeError::LogFile {
            path: self.log_path.clone(),
            source,
        })?;

        info!(bin = %self.bin.display(), port = self.port, "spawning model server");
        let child = Command::new(&self.bin)
            .args(&self.args)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;
        *guard = Some(child);

        let deadline = Instant::now() + wait_timeout;
        loop {
            if self.probe(PROBE_TIMEOUT).await {
                info!(host = %self.host, port = self.port, "model server ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        let log_tail = self.log_tail();
        if let Some(mut child) = guard.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(%status, "model server exited before becoming ready")
                }
                _ => terminate(child).await,
            }
        }

        Err(RuntimeError::StartTimeout {
            timeout_secs: wait_timeout.as_secs(),
            log_path: self.log_path.clone(),
            log_tail,
        })
    }

    /// No-op when nothing is tracked. The handle is cleared in all cases.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.take() else {
            return;
        };
        info!(bin = %self.bin.display(), "stopping model server");
        terminate(child).await;
    }

    pub async fn is_ready(&self, probe_timeout: Duration) -> bool {
        self.probe(probe_timeout).await
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    *guard = None;
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }

    async fn probe(&self, probe_timeout: Duration) -> bool {
        let url = format!("http://{}:{}/v1/models", self.host, self.port);
        match self.http.get(&url).timeout(probe_timeout).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        }
    }

    fn preflight(&self) -> Result<(), RuntimeError> {
        if !self.bin.exists() {
            return Err(RuntimeError::MissingExecutable(self.bin.clone()));
        }
        if let Some(model) = self.model_file_arg() {
            if !model.exists() {
                return Err(RuntimeError::MissingModelFile(model));
            }
        }
        Ok(())
    }

    fn model_file_arg(&self) -> Option<PathBuf> {
        let index = self
            .args
            .iter()
            .position(|arg| arg == "-m" || arg == "--model")?;
        self.args.get(index + 1).map(PathBuf::from)
    }

    fn log_tail(&self) -> String {
        match std::fs::read(&self.log_path) {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(LOG_TAIL_BYTES);
                String::from_utf8_lossy(&bytes[start..]).into_owned()
            }
            Err(_) => String::new(),
        }
    }
}

/// SIGTERM with a grace period, then SIGKILL. Always reaps the child.
async fn terminate(mut child: Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                match timeout(STOP_GRACE, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(%status, "model server exited after SIGTERM");
                        return;
                    }
                    Ok(Err(error)) => warn!(%error, "wait after SIGTERM failed"),
                    Err(_) => warn!("model server ignored SIGTERM, escalating"),
                }
            }
        }
    }

    if let Err(error) = child.kill().await {
        warn!(%error, "force kill failed");
    }
    let _ = child.wait().await;
}
