//! Pipeline Service
//!
//! Business logic for pipeline management.

use conveyor_core::domain::pipeline::PipelineDefinition;
use conveyor_core::dto::pipeline::{CreatePipeline, PipelineSummary};

use crate::repository::{Repositories, RepositoryError};

/// Service error type
#[derive(Debug)]
pub enum PipelineError {
    NotFound(String),
    ValidationError(String),
    Conflict(String),
    RepositoryError(RepositoryError),
}

impl From<RepositoryError> for PipelineError {
    fn from(err: RepositoryError) -> Self {
        PipelineError::RepositoryError(err)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Create or replace a pipeline
pub async fn create_pipeline(repos: &Repositories, req: CreatePipeline) -> Result<PipelineDefinition> {
    let definition = resolve_definition(req)?;

    // A repository triggers exactly one pipeline
    if let Some(bound) = repos
        .pipelines
        .find_by_repository(&definition.repository)
        .await?
        && bound.name != definition.name
    {
        return Err(PipelineError::Conflict(format!(
            "Repository {} is already bound to pipeline {}",
            definition.repository, bound.name
        )));
    }

    repos.pipelines.upsert(&definition).await?;

    tracing::info!(
        "Pipeline registered: {} ({} stages, repository {})",
        definition.name,
        definition.stages.len(),
        definition.repository
    );

    Ok(definition)
}

/// Get a pipeline by name
pub async fn get_pipeline(repos: &Repositories, name: &str) -> Result<PipelineDefinition> {
    repos
        .pipelines
        .find(name)
        .await?
        .ok_or_else(|| PipelineError::NotFound(name.to_string()))
}

/// List all pipelines
pub async fn list_pipelines(repos: &Repositories) -> Result<Vec<PipelineSummary>> {
    let pipelines = repos.pipelines.list().await?;
    Ok(pipelines.iter().map(PipelineSummary::from).collect())
}

/// Delete a pipeline. Runs already started keep their snapshot.
pub async fn delete_pipeline(repos: &Repositories, name: &str) -> Result<()> {
    let deleted = repos.pipelines.delete(name).await?;

    if !deleted {
        return Err(PipelineError::NotFound(name.to_string()));
    }

    tracing::info!("Pipeline deleted: {}", name);

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

/// Turns a create request into a validated definition
pub fn resolve_definition(req: CreatePipeline) -> Result<PipelineDefinition> {
    let definition = match (req.script, req.definition) {
        (Some(script), None) => {
            if script.trim().is_empty() {
                return Err(PipelineError::ValidationError(
                    "Pipeline script cannot be empty".to_string(),
                ));
            }
            conveyor_lua::parse_pipeline_definition(&script).map_err(|e| {
                PipelineError::ValidationError(format!("Invalid pipeline script: {:#}", e))
            })?
        }
        (None, Some(definition)) => definition,
        _ => {
            return Err(PipelineError::ValidationError(
                "Exactly one of 'script' or 'definition' must be provided".to_string(),
            ));
        }
    };

    if definition.name.len() > 255 {
        return Err(PipelineError::ValidationError(
            "Pipeline name is too long (max 255 characters)".to_string(),
        ));
    }

    definition
        .validate()
        .map_err(|e| PipelineError::ValidationError(e.to_string()))?;

    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::pipeline::{Capability, StageDefinition};

    fn definition(name: &str, repository: &str) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            repository: repository.to_string(),
            description: None,
            stages: vec![
                StageDefinition::new("build", Capability::Build),
                StageDefinition::new("package", Capability::Package).depends_on(["build"]),
            ],
            gates: vec![],
            canary: None,
        }
    }

    #[test]
    fn test_resolve_requires_exactly_one_source() {
        let result = resolve_definition(CreatePipeline::default());
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));

        let both = CreatePipeline {
            script: Some("return {}".to_string()),
            definition: Some(definition("api", "acme/api")),
        };
        assert!(matches!(
            resolve_definition(both),
            Err(PipelineError::ValidationError(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_cycles() {
        let mut def = definition("api", "acme/api");
        def.stages[0] = StageDefinition::new("build", Capability::Build).depends_on(["package"]);

        let result = resolve_definition(CreatePipeline::from_definition(def));
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));
    }

    #[test]
    fn test_resolve_lua_script() {
        let script = r#"
            return pipeline.define({
                name = "api",
                repository = "acme/api",
                stages = {
                    pipeline.stage("build", "build"),
                    pipeline.stage("test", "custom", { depends_on = { "build" } }),
                },
            })
        "#;

        let def = resolve_definition(CreatePipeline::from_script(script)).unwrap();
        assert_eq!(def.name, "api");
        assert_eq!(def.stages.len(), 2);
    }

    #[test]
    fn test_resolve_invalid_script() {
        let result = resolve_definition(CreatePipeline::from_script("return nil +"));
        assert!(matches!(result, Err(PipelineError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_repository_is_bound_to_one_pipeline() {
        let repos = Repositories::in_memory();
        create_pipeline(&repos, CreatePipeline::from_definition(definition("api", "acme/api")))
            .await
            .unwrap();

        // Replacing the same pipeline is fine
        create_pipeline(&repos, CreatePipeline::from_definition(definition("api", "acme/api")))
            .await
            .unwrap();

        let result = create_pipeline(
            &repos,
            CreatePipeline::from_definition(definition("api-2", "acme/api")),
        )
        .await;
        assert!(matches!(result, Err(PipelineError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_pipeline() {
        let repos = Repositories::in_memory();
        let result = delete_pipeline(&repos, "ghost").await;
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }
}
