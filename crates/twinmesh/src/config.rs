//! Node configuration.

use serde::{Deserialize, Serialize};

use twinmesh_envelope::{KdfParams, QrConfig};
use twinmesh_match::HybridConfig;
use twinmesh_sync::NegotiatorConfig;

use crate::error::{NodeError, Result};

/// Everything a [`crate::TwinNode`] can be tuned with.
///
/// Every section and field is optional in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub negotiator: NegotiatorConfig,
    pub hybrid: HybridConfig,
    pub qr: QrConfig,
    pub kdf: KdfParams,
}

impl NodeConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.hybrid.validate()?;
        if self.negotiator.mutual_interest_threshold > 100 {
            return Err(NodeError::Config(
                "mutual_interest_threshold must be at most 100".into(),
            ));
        }
        if self.qr.ttl_ms == 0 {
            return Err(NodeError::Config("qr.ttl_ms must be positive".into()));
        }
        Ok(())
    }
}
