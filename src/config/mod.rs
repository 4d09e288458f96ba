use serde::Deserialize;
use std::path::PathBuf;

/// Complete Steward configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StewardConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub feeds: FeedConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8081".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Feed runner configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Upper bound on a single poll; slower polls publish their fallback value
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_poll_timeout_ms() -> u64 {
    5000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Effector task executor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Finished tasks kept for inspection; older ones are dropped first
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

fn default_max_concurrent() -> usize {
    64
}

fn default_retain_finished() -> usize {
    1024
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retain_finished: default_retain_finished(),
        }
    }
}

/// Defaults for proxy controllers
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Each controller gets `<run_dir>/<entity id>`
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    /// Shell command run in the controller's run dir on reload
    #[serde(default)]
    pub reload_command: Option<String>,
    /// Config template; the built-in template is used when unset
    #[serde(default)]
    pub template_path: Option<PathBuf>,
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/tmp/steward-proxy")
}

fn default_proxy_port() -> u16 {
    8000
}

fn default_poll_period_ms() -> u64 {
    1000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            port: default_proxy_port(),
            poll_period_ms: default_poll_period_ms(),
            reload_command: None,
            template_path: None,
        }
    }
}

/// On-fire web hook
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl StewardConfig {
    /// Apply `STEWARD_*` environment overrides.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("STEWARD_BIND_ADDR") {
            self.api.bind_addr = v;
        }
        if let Ok(v) = std::env::var("STEWARD_PROXY_RUN_DIR") {
            self.proxy.run_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STEWARD_MAX_CONCURRENT_TASKS") {
            if let Ok(n) = v.parse::<usize>() {
                self.tasks.max_concurrent = n;
            }
        }
        self
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<StewardConfig> {
    use anyhow::Context;

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
    let config: StewardConfig =
        toml::from_str(&contents).with_context(|| format!("parsing config file {}", path))?;
    Ok(config)
}
