//! Version information for treelet.

use crate::bridge::protocol::WorkerInfo;

/// treelet version from Cargo.toml
pub const TREELET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the host-worker wire protocol. Bumped on any layout change;
/// both sides must agree exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information for a running engine.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub treelet: &'static str,
    pub protocol: u32,
    /// Worker identity (once the worker has greeted us).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerInfo>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            treelet: TREELET_VERSION,
            protocol: PROTOCOL_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, worker: WorkerInfo) -> Self {
        self.worker = Some(worker);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_treelet_version() {
        let info = VersionInfo::new();
        assert_eq!(info.treelet, TREELET_VERSION);
        assert_eq!(info.protocol, PROTOCOL_VERSION);
        assert!(info.worker.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            treelet: "0.1.0",
            protocol: 1,
            worker: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "treelet": "0.1.0",
          "protocol": 1
        }
        "#);
    }

    #[test]
    fn version_info_serializes_worker() {
        let info = VersionInfo {
            treelet: "0.1.0",
            protocol: 1,
            worker: None,
        }
        .with_worker(WorkerInfo {
            name: "treelet-worker".to_string(),
            version: "0.1.0".to_string(),
            instance: uuid::Uuid::nil(),
        });
        insta::assert_json_snapshot!(info, @r#"
        {
          "treelet": "0.1.0",
          "protocol": 1,
          "worker": {
            "name": "treelet-worker",
            "version": "0.1.0",
            "instance": "00000000-0000-0000-0000-000000000000"
          }
        }
        "#);
    }
}
