use crate::controller::template::RenderError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// TLS material for the proxy, either fetched from a source URL or already
/// present at a destination path on the proxy host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySslConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_destination: Option<String>,
    #[serde(default)]
    pub reuse_sessions: bool,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl ProxySslConfig {
    /// A certificate must come from somewhere: a source URL, a preset destination, or both.
    pub fn validate(&self, id: &str) -> Result<(), RenderError> {
        if non_empty(&self.certificate_source_url).is_none()
            && non_empty(&self.certificate_destination).is_none()
        {
            return Err(RenderError::InvalidSsl {
                id: id.to_string(),
                reason: "needs a certificate source URL or a certificate destination".to_string(),
            });
        }
        Ok(())
    }

    /// Certificate path as referenced from the rendered config
    pub fn certificate_reference(&self, id: &str) -> String {
        non_empty(&self.certificate_destination)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.crt", id))
    }

    /// Key path as referenced from the rendered config, if there is a key at all
    pub fn key_reference(&self, id: &str) -> Option<String> {
        if let Some(dest) = non_empty(&self.key_destination) {
            return Some(dest.to_string());
        }
        non_empty(&self.key_source_url).map(|_| format!("{}.key", id))
    }

    /// (source url, install path) pairs to copy for `id`
    pub fn installs(&self, id: &str, workdir: &Path) -> Vec<(String, PathBuf)> {
        let mut installs = Vec::new();
        if let Some(source) = non_empty(&self.certificate_source_url) {
            let dest = non_empty(&self.certificate_destination)
                .map(PathBuf::from)
                .unwrap_or_else(|| workdir.join("conf").join(format!("{}.crt", id)));
            installs.push((source.to_string(), dest));
        }
        if let Some(source) = non_empty(&self.key_source_url) {
            let dest = non_empty(&self.key_destination)
                .map(PathBuf::from)
                .unwrap_or_else(|| workdir.join("conf").join(format!("{}.key", id)));
            installs.push((source.to_string(), dest));
        }
        installs
    }
}
