use crate::controller::ssl::ProxySslConfig;
use crate::state::EntityId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RenderError {
    #[error("invalid SSL configuration for '{id}': {reason}")]
    InvalidSsl { id: String, reason: String },

    #[error("template references unknown value '${{{0}}}'")]
    UnresolvedReference(String),

    #[error("unterminated placeholder at byte {0}")]
    Malformed(usize),
}

/// Built-in HAProxy-style template
pub const DEFAULT_TEMPLATE: &str = "\
global
    daemon

defaults
    mode http
    timeout connect 5s
    timeout client 30s
    timeout server 30s

frontend main
    bind *:${port}${ssl}
${tls}${frontends}
${backends}";

/// One url-mapping as seen by the renderer
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MappingView {
    pub id: EntityId,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<ProxySslConfig>,
    pub addresses: BTreeSet<String>,
}

/// Everything a render sees
#[derive(Clone, Debug, Default, Serialize)]
pub struct RenderInput {
    pub port: u16,
    /// Controller-wide TLS, installed under id `global`
    pub ssl: Option<ProxySslConfig>,
    /// Server pool addresses for the default backend
    pub pool: BTreeSet<String>,
    /// Mappings that have at least one target, ordered by domain, path, id
    pub mappings: Vec<MappingView>,
    pub domains: BTreeMap<String, Vec<MappingView>>,
    /// Static values available to the template by name
    pub globals: BTreeMap<String, String>,
}

impl RenderInput {
    /// Reject SSL configurations whose certificate cannot be located
    pub fn validate(&self) -> Result<(), RenderError> {
        if let Some(ssl) = &self.ssl {
            ssl.validate("global")?;
        }
        for mapping in &self.mappings {
            if let Some(ssl) = &mapping.ssl {
                ssl.validate(&mapping.domain)?;
            }
        }
        Ok(())
    }

    /// Distinct TLS material ids referenced, each with the config that installs it.
    ///
    /// The first mapping of a domain decides that domain's material.
    pub fn ssl_material(&self) -> Vec<(String, ProxySslConfig)> {
        let mut material = Vec::new();
        if let Some(ssl) = &self.ssl {
            material.push(("global".to_string(), ssl.clone()));
        }
        let mut seen = BTreeSet::new();
        for mapping in &self.mappings {
            if let Some(ssl) = &mapping.ssl {
                if seen.insert(mapping.domain.clone()) {
                    material.push((mapping.domain.clone(), ssl.clone()));
                }
            }
        }
        material
    }
}

/// Turns a template and the gathered input into config text.
///
/// Implementations must be pure: equal inputs give byte-identical output.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, input: &RenderInput) -> Result<String, RenderError>;
}

/// `${name}` substitution over a fixed set of generated blocks.
///
/// Known names: `port`, `ssl`, `tls`, `frontends`, `backends`, plus every key of
/// [`RenderInput::globals`]. `ssl` continues the bind line; `tls` is one line per
/// key or session-reuse setting of each TLS material id.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinRenderer;

impl TemplateRenderer for BuiltinRenderer {
    fn render(&self, template: &str, input: &RenderInput) -> Result<String, RenderError> {
        let mut out = String::with_capacity(template.len() * 2);
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or(RenderError::Malformed(offset + start))?;
            let name = &after[..end];
            out.push_str(&resolve(name, input)?);

            let consumed = start + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn resolve(name: &str, input: &RenderInput) -> Result<String, RenderError> {
    match name {
        "port" => Ok(input.port.to_string()),
        "ssl" => Ok(ssl_block(input)),
        "tls" => Ok(tls_block(input)),
        "frontends" => Ok(frontends_block(input)),
        "backends" => Ok(backends_block(input)),
        other => input
            .globals
            .get(other)
            .cloned()
            .ok_or_else(|| RenderError::UnresolvedReference(other.to_string())),
    }
}

fn ssl_block(input: &RenderInput) -> String {
    let material = input.ssl_material();
    if material.is_empty() {
        return String::new();
    }
    let mut out = String::from(" ssl");
    for (id, ssl) in &material {
        let _ = write!(out, " crt {}", ssl.certificate_reference(id));
    }
    out
}

fn tls_block(input: &RenderInput) -> String {
    let mut out = String::new();
    for (id, ssl) in input.ssl_material() {
        if let Some(key) = ssl.key_reference(&id) {
            let _ = writeln!(out, "    ssl_certificate_key {} {}", id, key);
        }
        if ssl.reuse_sessions {
            let _ = writeln!(out, "    ssl_session_reuse {} on", id);
        }
    }
    out
}

/// Mappings of one domain, most specific path first
fn ordered(mappings: &[MappingView]) -> Vec<&MappingView> {
    let mut ordered: Vec<&MappingView> = mappings.iter().collect();
    ordered.sort_by(|a, b| {
        let len = |m: &MappingView| m.path.as_deref().map(str::len).unwrap_or(0);
        len(b)
            .cmp(&len(a))
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}

fn backend_name(index: usize) -> String {
    format!("mapping_{}", index)
}

fn frontends_block(input: &RenderInput) -> String {
    let mut out = String::new();
    let mut index = 0;
    for (host_index, (domain, mappings)) in input.domains.iter().enumerate() {
        let _ = writeln!(out, "    acl host_{} hdr(host) -i {}", host_index, domain);
        for mapping in ordered(mappings) {
            match &mapping.path {
                Some(path) => {
                    let _ = writeln!(out, "    acl path_{} path_beg {}", index, path);
                    let _ = writeln!(
                        out,
                        "    use_backend {} if host_{} path_{}",
                        backend_name(index),
                        host_index,
                        index
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "    use_backend {} if host_{}",
                        backend_name(index),
                        host_index
                    );
                }
            }
            index += 1;
        }
    }
    if !input.pool.is_empty() {
        out.push_str("    default_backend pool\n");
    }
    out
}

fn backends_block(input: &RenderInput) -> String {
    let mut out = String::new();
    if !input.pool.is_empty() {
        write_backend(&mut out, "pool", &input.pool);
    }
    let mut index = 0;
    for mappings in input.domains.values() {
        for mapping in ordered(mappings) {
            write_backend(&mut out, &backend_name(index), &mapping.addresses);
            index += 1;
        }
    }
    out
}

fn write_backend(out: &mut String, name: &str, addresses: &BTreeSet<String>) {
    let _ = writeln!(out, "backend {}", name);
    out.push_str("    balance roundrobin\n");
    for (i, address) in addresses.iter().enumerate() {
        let _ = writeln!(out, "    server {}_{} {} check", name, i, address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(id: &str, domain: &str, path: Option<&str>, addresses: &[&str]) -> MappingView {
        MappingView {
            id: id.to_string(),
            domain: domain.to_string(),
            path: path.map(str::to_string),
            ssl: None,
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn input(mappings: Vec<MappingView>) -> RenderInput {
        let mut domains: BTreeMap<String, Vec<MappingView>> = BTreeMap::new();
        for m in &mappings {
            domains.entry(m.domain.clone()).or_default().push(m.clone());
        }
        RenderInput {
            port: 8080,
            pool: ["10.0.0.1:80".to_string()].into_iter().collect(),
            mappings,
            domains,
            ..Default::default()
        }
    }

    #[test]
    fn test_renders_frontends_and_backends() {
        let input = input(vec![
            mapping("m1", "example.com", None, &["10.0.1.1:8080"]),
            mapping("m2", "example.com", Some("/api"), &["10.0.2.1:8080", "10.0.2.2:8080"]),
        ]);
        let text = BuiltinRenderer.render(DEFAULT_TEMPLATE, &input).unwrap();

        assert!(text.contains("bind *:8080\n"));
        assert!(text.contains("acl host_0 hdr(host) -i example.com"));
        // Path mapping is matched before the catch-all for the domain
        let api = text.find("use_backend mapping_0 if host_0 path_0").unwrap();
        let root = text.find("use_backend mapping_1 if host_0\n").unwrap();
        assert!(api < root);
        assert!(text.contains("default_backend pool"));
        assert!(text.contains("server mapping_0_1 10.0.2.2:8080 check"));
        assert!(text.contains("server pool_0 10.0.0.1:80 check"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = input(vec![
            mapping("m2", "b.com", None, &["10.0.0.2:80"]),
            mapping("m1", "a.com", None, &["10.0.0.1:80"]),
        ]);
        let first = BuiltinRenderer.render(DEFAULT_TEMPLATE, &a).unwrap();
        let second = BuiltinRenderer.render(DEFAULT_TEMPLATE, &a.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_globals_and_unresolved_references() {
        let mut input = input(Vec::new());
        input.globals.insert("maxconn".to_string(), "2048".to_string());

        let text = BuiltinRenderer
            .render("maxconn ${maxconn} on ${port}", &input)
            .unwrap();
        assert_eq!(text, "maxconn 2048 on 8080");

        assert_eq!(
            BuiltinRenderer.render("timeout ${timeout}", &input),
            Err(RenderError::UnresolvedReference("timeout".to_string()))
        );
        assert_eq!(
            BuiltinRenderer.render("bind ${port", &input),
            Err(RenderError::Malformed(5))
        );
    }

    #[test]
    fn test_ssl_block_and_material() {
        let mut input = input(vec![
            MappingView {
                ssl: Some(ProxySslConfig {
                    certificate_source_url: Some("http://certs/a".to_string()),
                    ..Default::default()
                }),
                ..mapping("m1", "secure.com", None, &["10.0.0.1:443"])
            },
            MappingView {
                ssl: Some(ProxySslConfig {
                    certificate_source_url: Some("http://certs/other".to_string()),
                    ..Default::default()
                }),
                ..mapping("m2", "secure.com", Some("/x"), &["10.0.0.2:443"])
            },
        ]);
        input.ssl = Some(ProxySslConfig {
            certificate_destination: Some("/etc/ssl/global.pem".to_string()),
            ..Default::default()
        });

        let material = input.ssl_material();
        assert_eq!(material.len(), 2);
        assert_eq!(material[0].0, "global");
        assert_eq!(material[1].0, "secure.com");
        assert_eq!(
            material[1].1.certificate_source_url.as_deref(),
            Some("http://certs/a")
        );

        let text = BuiltinRenderer.render("bind${ssl}", &input).unwrap();
        assert_eq!(text, "bind ssl crt /etc/ssl/global.pem crt secure.com.crt");
    }

    #[test]
    fn test_tls_block_names_keys_and_session_reuse() {
        let mut input = input(vec![MappingView {
            ssl: Some(ProxySslConfig {
                certificate_source_url: Some("http://certs/a.crt".to_string()),
                key_source_url: Some("http://certs/a.key".to_string()),
                ..Default::default()
            }),
            ..mapping("m1", "secure.com", None, &["10.0.0.1:443"])
        }]);
        input.ssl = Some(ProxySslConfig {
            certificate_destination: Some("/etc/ssl/global.pem".to_string()),
            key_destination: Some("/etc/ssl/global.key".to_string()),
            reuse_sessions: true,
            ..Default::default()
        });

        let text = BuiltinRenderer.render(DEFAULT_TEMPLATE, &input).unwrap();
        assert!(text.contains("bind *:8080 ssl crt /etc/ssl/global.pem crt secure.com.crt\n"));
        assert!(text.contains("    ssl_certificate_key global /etc/ssl/global.key\n"));
        assert!(text.contains("    ssl_session_reuse global on\n"));
        assert!(text.contains("    ssl_certificate_key secure.com secure.com.key\n"));
        assert!(!text.contains("ssl_session_reuse secure.com"));
    }

    #[test]
    fn test_tls_block_empty_without_keys() {
        let mut input = input(Vec::new());
        input.ssl = Some(ProxySslConfig {
            certificate_destination: Some("/etc/ssl/site.crt".to_string()),
            ..Default::default()
        });
        assert_eq!(BuiltinRenderer.render("${tls}", &input).unwrap(), "");
    }

    #[test]
    fn test_validate_rejects_unlocatable_certificate() {
        let mut input = input(Vec::new());
        input.ssl = Some(ProxySslConfig::default());
        assert!(matches!(
            input.validate(),
            Err(RenderError::InvalidSsl { ref id, .. }) if id == "global"
        ));
    }
}
