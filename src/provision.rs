use std::path::Path;

use serde::Deserialize;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};

#[derive(Debug)]
pub enum ProvisionError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Engine(EngineError),
}

impl std::fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::Io(e) => write!(f, "cannot read environments file: {e}"),
            ProvisionError::Parse(e) => write!(f, "malformed environments file: {e}"),
            ProvisionError::Engine(e) => write!(f, "cannot provision environment: {e}"),
        }
    }
}

impl std::error::Error for ProvisionError {}

/// One entry of the provisioning file. The id is required so that loading the
/// same file on every startup creates each environment once.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSeed {
    pub id: Ulid,
    pub org_id: String,
    pub owner: String,
    #[serde(default)]
    pub note: Option<String>,
}

pub fn load_seeds(path: &Path) -> Result<Vec<EnvironmentSeed>, ProvisionError> {
    let raw = std::fs::read_to_string(path).map_err(ProvisionError::Io)?;
    serde_json::from_str(&raw).map_err(ProvisionError::Parse)
}

/// Create every seeded environment whose id is not already present.
/// Returns how many were created.
pub async fn apply_seeds(engine: &Engine, seeds: Vec<EnvironmentSeed>) -> Result<usize, ProvisionError> {
    let mut created = 0;
    for seed in seeds {
        match engine
            .create_environment(seed.id, seed.org_id, seed.owner, seed.note)
            .await
        {
            Ok(_) => created += 1,
            Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => return Err(ProvisionError::Engine(e)),
        }
    }
    Ok(created)
}
