use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reload command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
}

/// Boundary to whatever actually runs the proxy process.
///
/// Controllers only see this trait; how files reach the host and how the
/// process is restarted is up to the implementation.
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    /// Write `content` to `remote_path`, creating parent directories
    async fn copy_file(&self, content: &[u8], remote_path: &Path) -> Result<(), DriverError>;

    fn working_directory(&self) -> PathBuf;

    /// Whether install and customization have finished; config is only pushed after that
    fn is_customization_complete(&self) -> bool;

    /// Make the process pick up the current configuration
    async fn reload(&self) -> Result<(), DriverError>;

    async fn fetch_resource(&self, url: &str) -> Result<Vec<u8>, DriverError>;

    /// Install and customize; afterwards `is_customization_complete` is true
    async fn launch(&self) -> Result<(), DriverError>;

    async fn stop(&self) -> Result<(), DriverError>;
}

/// Creates one driver per controller entity
pub trait DriverFactory: Send + Sync {
    fn create(&self, entity_id: &str) -> Arc<dyn ProxyDriver>;
}

/// Driver for a proxy on the local host, rooted at a run directory.
///
/// Reload runs an optional shell command inside the run directory.
pub struct LocalProcessDriver {
    run_dir: PathBuf,
    reload_command: Option<String>,
    client: reqwest::Client,
    customized: AtomicBool,
    reloads: AtomicU64,
}

impl LocalProcessDriver {
    pub fn new(run_dir: impl Into<PathBuf>, reload_command: Option<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            reload_command,
            client: reqwest::Client::new(),
            customized: AtomicBool::new(false),
            reloads: AtomicU64::new(0),
        }
    }

    /// Successful reloads so far
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyDriver for LocalProcessDriver {
    async fn copy_file(&self, content: &[u8], remote_path: &Path) -> Result<(), DriverError> {
        let io = |source| DriverError::Io {
            path: remote_path.to_path_buf(),
            source,
        };
        if let Some(parent) = remote_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(remote_path, content).await.map_err(io)?;
        debug!(path = %remote_path.display(), bytes = content.len(), "File installed");
        Ok(())
    }

    fn working_directory(&self) -> PathBuf {
        self.run_dir.clone()
    }

    fn is_customization_complete(&self) -> bool {
        self.customized.load(Ordering::SeqCst)
    }

    async fn reload(&self) -> Result<(), DriverError> {
        if let Some(command) = &self.reload_command {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.run_dir)
                .output()
                .await
                .map_err(|e| DriverError::Command {
                    command: command.clone(),
                    reason: e.to_string(),
                })?;
            if !output.status.success() {
                return Err(DriverError::Command {
                    command: command.clone(),
                    reason: format!(
                        "{}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        info!(run_dir = %self.run_dir.display(), "Proxy reloaded");
        Ok(())
    }

    async fn fetch_resource(&self, url: &str) -> Result<Vec<u8>, DriverError> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path).await.map_err(|source| DriverError::Io {
                path: PathBuf::from(path),
                source,
            });
        }

        let fetch_error = |reason: String| DriverError::Fetch {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("status {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn launch(&self) -> Result<(), DriverError> {
        let conf = self.run_dir.join("conf");
        tokio::fs::create_dir_all(&conf)
            .await
            .map_err(|source| DriverError::Io {
                path: conf.clone(),
                source,
            })?;
        self.customized.store(true, Ordering::SeqCst);
        info!(run_dir = %self.run_dir.display(), "Proxy run directory ready");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        if !self.customized.swap(false, Ordering::SeqCst) {
            warn!(run_dir = %self.run_dir.display(), "Stopping a proxy that was never launched");
        }
        Ok(())
    }
}

/// Creates a [`LocalProcessDriver`] under `<run_dir>/<entity id>`
pub struct LocalDriverFactory {
    run_dir: PathBuf,
    reload_command: Option<String>,
}

impl LocalDriverFactory {
    pub fn new(run_dir: impl Into<PathBuf>, reload_command: Option<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            reload_command,
        }
    }
}

impl DriverFactory for LocalDriverFactory {
    fn create(&self, entity_id: &str) -> Arc<dyn ProxyDriver> {
        Arc::new(LocalProcessDriver::new(
            self.run_dir.join(entity_id),
            self.reload_command.clone(),
        ))
    }
}
