//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Versioned build output tracked through the promotion lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: Uuid,
    pub pipeline: String,
    pub version: String,
    /// Immutable content reference (image digest, object URL, ...)
    pub content_ref: String,
    pub run_id: Uuid,
    pub state: ArtifactState,
    pub registered_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Handle to a produced artifact, reported by a package adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactHandle {
    pub version: String,
    pub content_ref: String,
}

/// Promotion state of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Staged,
    Released,
    Deprecated,
    RolledBack,
}

impl ArtifactState {
    /// Whether a transition from `self` to `next` is part of the lifecycle
    pub fn can_transition_to(&self, next: ArtifactState) -> bool {
        matches!(
            (self, next),
            (ArtifactState::Staged, ArtifactState::Released)
                | (ArtifactState::Staged, ArtifactState::RolledBack)
                | (ArtifactState::Released, ArtifactState::Deprecated)
                | (ArtifactState::Released, ArtifactState::RolledBack)
        )
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactState::Staged => "staged",
            ArtifactState::Released => "released",
            ArtifactState::Deprecated => "deprecated",
            ArtifactState::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ArtifactState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(ArtifactState::Staged),
            "released" => Ok(ArtifactState::Released),
            "deprecated" => Ok(ArtifactState::Deprecated),
            "rolled_back" => Ok(ArtifactState::RolledBack),
            other => Err(format!("unknown artifact state '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(ArtifactState::Staged.can_transition_to(ArtifactState::Released));
        assert!(ArtifactState::Released.can_transition_to(ArtifactState::Deprecated));
        assert!(ArtifactState::Staged.can_transition_to(ArtifactState::RolledBack));
        assert!(!ArtifactState::Deprecated.can_transition_to(ArtifactState::Released));
        assert!(!ArtifactState::RolledBack.can_transition_to(ArtifactState::Released));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ArtifactState::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(
            "deprecated".parse::<ArtifactState>().unwrap(),
            ArtifactState::Deprecated
        );
    }
}
