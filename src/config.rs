//! Workflow configuration and environment knobs.
//!
//! The zipper reads a YAML workflow file:
//!
//! ```yaml
//! name: zipper-1
//! host: 0.0.0.0
//! port: 9000
//! functions:
//!   - name: echo
//!   - name: sink
//! ```
//!
//! Optional keys: `mesh_config_url`, `auth.token`, `tls.cert` / `tls.key`
//! (DER files) and `tls.ca`. Process-wide knobs come from the environment, see
//! [`RuntimeEnv`].
//!
//! `tls.ca` is a DER certificate the other zippers of the mesh must present
//! or chain to. Without it the zipper dials its mesh peers without verifying
//! their certificates, which only suits meshes running on a trusted network.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::router::App;
use crate::{MeshError, Result};

/// Default inbound buffer size of a stream function.
pub const DEFAULT_BUFFER_SIZE: usize = 200;

/// Default workflow path used by the `zipper` binary.
pub const DEFAULT_CONFIG_PATH: &str = "workflow.yaml";

/// Zipper configuration: where to listen and the ordered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub functions: Vec<App>,
    /// URL of a JSON document listing the other zippers of the mesh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_config_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// Shared-token authentication for handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub token: String,
}

/// Certificate served by the zipper. Without it a self-signed one is generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Trust anchor for dialing mesh peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
}

impl WorkflowConfig {
    /// Minimal config for `name` listening on `host:port`.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            functions: Vec::new(),
            mesh_config_url: None,
            auth: None,
            tls: None,
        }
    }

    pub fn with_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions = names.into_iter().map(App::new).collect();
        self
    }

    /// Load and validate a workflow file. Only `.yaml` and `.yml` are accepted.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {}
            _ => {
                return Err(MeshError::config(format!(
                    "{}: workflow config must be a .yaml or .yml file",
                    path.display()
                )));
            }
        }
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| MeshError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml(&yaml)
    }

    /// Parse and validate workflow YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| MeshError::config(format!("workflow YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the fields the zipper cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MeshError::config("name is required"));
        }
        if self.host.trim().is_empty() {
            return Err(MeshError::config("host is required"));
        }
        if self.port == 0 {
            return Err(MeshError::config("port is required"));
        }
        if self.functions.is_empty() {
            return Err(MeshError::config("at least one function is required"));
        }
        let mut seen = HashSet::new();
        for app in &self.functions {
            if app.name.trim().is_empty() {
                return Err(MeshError::config("function names must not be empty"));
            }
            if !seen.insert(app.name.as_str()) {
                return Err(MeshError::config(format!("function '{}' appears twice", app.name)));
            }
        }
        Ok(())
    }

    /// `host:port` to listen on.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth.as_ref().map(|auth| auth.token.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Process-wide settings read from the environment.
///
/// | Variable | Meaning |
/// |---|---|
/// | `ZIPMESH_DEBUG` | `1` or `true` enables debug logging |
/// | `ZIPMESH_LOG_FORMAT` | `plain` or `json` |
/// | `ZIPMESH_BUFFER_SIZE` | stream-function inbound buffer size |
/// | `ZIPMESH_CONFIG` | workflow file for the `zipper` binary |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub debug: bool,
    pub log_format: LogFormat,
    pub buffer_size: usize,
    pub config_path: PathBuf,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            debug: false,
            log_format: LogFormat::Plain,
            buffer_size: DEFAULT_BUFFER_SIZE,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut env = Self::default();
        if let Some(value) = lookup("ZIPMESH_DEBUG") {
            env.debug = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = lookup("ZIPMESH_LOG_FORMAT") {
            if value.trim().eq_ignore_ascii_case("json") {
                env.log_format = LogFormat::Json;
            }
        }
        if let Some(size) = lookup("ZIPMESH_BUFFER_SIZE").and_then(|v| v.trim().parse::<usize>().ok()) {
            if size > 0 {
                env.buffer_size = size;
            }
        }
        if let Some(value) = lookup("ZIPMESH_CONFIG").filter(|v| !v.trim().is_empty()) {
            env.config_path = PathBuf::from(value);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const WORKFLOW: &str = r#"
name: zipper-1
host: 0.0.0.0
port: 9000
functions:
  - name: echo
  - name: sink
auth:
  token: s3cret
"#;

    #[test]
    fn parses_a_workflow() {
        let config = WorkflowConfig::from_yaml(WORKFLOW).unwrap();
        assert_eq!(config.name, "zipper-1");
        assert_eq!(config.addr(), "0.0.0.0:9000");
        assert_eq!(config.functions, vec![App::new("echo"), App::new("sink")]);
        assert_eq!(config.auth_token(), Some("s3cret"));
        assert_eq!(config.mesh_config_url, None);
    }

    #[test]
    fn requires_functions() {
        let err = WorkflowConfig::from_yaml("name: z\nhost: h\nport: 1\n").unwrap_err();
        assert!(err.to_string().contains("at least one function"));
    }

    #[test]
    fn requires_name_host_and_port() {
        for yaml in [
            "name: ''\nhost: h\nport: 1\nfunctions: [{name: a}]",
            "name: z\nhost: ''\nport: 1\nfunctions: [{name: a}]",
            "name: z\nhost: h\nport: 0\nfunctions: [{name: a}]",
            "host: h\nport: 1\nfunctions: [{name: a}]",
        ] {
            assert!(matches!(WorkflowConfig::from_yaml(yaml), Err(MeshError::Config { .. })), "{yaml}");
        }
    }

    #[test]
    fn rejects_duplicate_and_empty_function_names() {
        let dup = WorkflowConfig::new("z", "h", 1).with_functions(["a", "a"]);
        assert!(dup.validate().unwrap_err().to_string().contains("appears twice"));
        let empty = WorkflowConfig::new("z", "h", 1).with_functions([""]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn tls_trust_anchor_is_optional() {
        let yaml = format!("{WORKFLOW}tls:\n  cert: /etc/zipmesh/cert.der\n  key: /etc/zipmesh/key.der\n");
        let tls = WorkflowConfig::from_yaml(&yaml).unwrap().tls.unwrap();
        assert_eq!(tls.ca, None);

        let yaml = format!("{yaml}  ca: /etc/zipmesh/ca.der\n");
        let tls = WorkflowConfig::from_yaml(&yaml).unwrap().tls.unwrap();
        assert_eq!(tls.ca, Some(PathBuf::from("/etc/zipmesh/ca.der")));
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = format!("{WORKFLOW}\nworkers: 3\n");
        assert!(WorkflowConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn file_extension_is_checked_before_reading() {
        let err = WorkflowConfig::parse("/nonexistent/workflow.json").unwrap_err();
        assert!(matches!(err, MeshError::Config { .. }));
        let err = WorkflowConfig::parse("/nonexistent/workflow.yaml").unwrap_err();
        assert!(matches!(err, MeshError::File { .. }));
    }

    #[test]
    fn parses_from_disk() {
        let path = std::env::temp_dir().join(format!("zipmesh-config-{}.yml", std::process::id()));
        std::fs::write(&path, WORKFLOW).unwrap();
        let config = WorkflowConfig::parse(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.unwrap().functions.len(), 2);
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ZIPMESH_DEBUG", "true"),
            ("ZIPMESH_LOG_FORMAT", "JSON"),
            ("ZIPMESH_BUFFER_SIZE", "50"),
            ("ZIPMESH_CONFIG", "/etc/zipmesh/flow.yml"),
        ]
        .into_iter()
        .collect();
        let env = RuntimeEnv::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert!(env.debug);
        assert_eq!(env.log_format, LogFormat::Json);
        assert_eq!(env.buffer_size, 50);
        assert_eq!(env.config_path, PathBuf::from("/etc/zipmesh/flow.yml"));
    }

    #[test]
    fn bad_environment_values_keep_defaults() {
        let env = RuntimeEnv::from_lookup(|key| match key {
            "ZIPMESH_BUFFER_SIZE" => Some("lots".to_string()),
            "ZIPMESH_DEBUG" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(env, RuntimeEnv::default());
    }
}
