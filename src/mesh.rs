//! Mesh discovery.
//!
//! A mesh document is a JSON array of the zippers in a mesh:
//!
//! ```json
//! [{"name": "zipper-1", "host": "10.0.0.1", "port": 9000},
//!  {"name": "zipper-2", "host": "10.0.0.2", "port": 9000}]
//! ```
//!
//! Every entry other than the local zipper becomes a cascaded downstream.

use serde::{Deserialize, Serialize};

use crate::{MeshError, Result};

/// One zipper of the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl MeshNode {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a mesh document and drop the entry named `local_name`.
///
/// Every entry needs a name and a host.
pub fn parse_mesh_config(json: &str, local_name: &str) -> Result<Vec<MeshNode>> {
    let nodes: Vec<MeshNode> = serde_json::from_str(json).map_err(|e| MeshError::Mesh {
        reason: "invalid mesh document".to_string(),
        source: Some(Box::new(e)),
    })?;
    if let Some(node) = nodes.iter().find(|node| node.name.is_empty() || node.host.is_empty()) {
        return Err(MeshError::mesh(format!("mesh entry {:?} needs a name and a host", node.addr())));
    }
    Ok(nodes.into_iter().filter(|node| node.name != local_name).collect())
}

/// Fetch the mesh document from `url`.
#[cfg(feature = "mesh")]
pub async fn fetch_mesh_config(url: &str, local_name: &str) -> Result<Vec<MeshNode>> {
    use std::time::Duration;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| MeshError::Mesh { reason: "failed to build HTTP client".to_string(), source: Some(Box::new(e)) })?;
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| MeshError::Mesh { reason: format!("failed to fetch {url}"), source: Some(Box::new(e)) })?;
    let body = response
        .text()
        .await
        .map_err(|e| MeshError::Mesh { reason: format!("failed to read {url}"), source: Some(Box::new(e)) })?;
    let nodes = parse_mesh_config(&body, local_name)?;
    tracing::info!(url, peers = nodes.len(), "Fetched mesh config");
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_the_local_zipper() {
        let json = r#"[
            {"name": "zipper-1", "host": "10.0.0.1", "port": 9000},
            {"name": "zipper-2", "host": "10.0.0.2", "port": 9001}
        ]"#;
        let nodes = parse_mesh_config(json, "zipper-1").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "zipper-2");
        assert_eq!(nodes[0].addr(), "10.0.0.2:9001");
    }

    #[test]
    fn malformed_documents_are_mesh_errors() {
        let err = parse_mesh_config(r#"{"name": "zipper-1"}"#, "x").unwrap_err();
        assert!(matches!(err, MeshError::Mesh { .. }));
        assert!(err.is_retryable());
        assert!(parse_mesh_config(r#"[{"name": "z", "host": "h", "port": 70000}]"#, "x").is_err());
    }

    #[test]
    fn entries_without_a_host_are_refused() {
        let err = parse_mesh_config(r#"[{"name": "zipper-2", "host": "", "port": 9000}]"#, "zipper-1").unwrap_err();
        assert!(matches!(err, MeshError::Mesh { source: None, .. }));
    }

    #[test]
    fn empty_mesh_is_fine() {
        assert!(parse_mesh_config("[]", "zipper-1").unwrap().is_empty());
    }
}
