//! Pipeline DTOs

use serde::{Deserialize, Serialize};

use crate::domain::pipeline::PipelineDefinition;

/// Request to register (or replace) a pipeline.
///
/// Exactly one of `script` (Lua source) or `definition` (JSON document)
/// must be provided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatePipeline {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub definition: Option<PipelineDefinition>,
}

impl CreatePipeline {
    pub fn from_script(script: impl Into<String>) -> Self {
        Self {
            script: Some(script.into()),
            definition: None,
        }
    }

    pub fn from_definition(definition: PipelineDefinition) -> Self {
        Self {
            script: None,
            definition: Some(definition),
        }
    }
}

/// Condensed pipeline listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub name: String,
    pub repository: String,
    pub description: Option<String>,
    pub stage_count: usize,
}

impl From<&PipelineDefinition> for PipelineSummary {
    fn from(def: &PipelineDefinition) -> Self {
        Self {
            name: def.name.clone(),
            repository: def.repository.clone(),
            description: def.description.clone(),
            stage_count: def.stages.len(),
        }
    }
}
