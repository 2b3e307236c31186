//! Artifact lifecycle manager
//!
//! Registers package outputs as `staged`, promotes them to `released`
//! exactly once, deprecates the previous release and enforces retention.

use chrono::Utc;
use conveyor_core::domain::artifact::{Artifact, ArtifactHandle, ArtifactState};
use conveyor_core::domain::deployment::{Deployment, RolloutState};
use conveyor_core::domain::run::Run;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::error::ArtifactPublishError;
use crate::repository::{ArtifactRepository, RepositoryError};

pub struct ArtifactManager {
    repo: Arc<dyn ArtifactRepository>,
    /// Number of deprecated artifacts kept per pipeline
    retention: usize,
    /// Serializes promotions so each artifact is released at most once
    promotion: Mutex<()>,
}

impl ArtifactManager {
    pub fn new(repo: Arc<dyn ArtifactRepository>, retention: usize) -> Self {
        Self {
            repo,
            retention,
            promotion: Mutex::new(()),
        }
    }

    /// Registers a staged artifact. Re-registering identical content is a
    /// no-op returning the existing record.
    pub async fn register(
        &self,
        pipeline: &str,
        run_id: Uuid,
        handle: &ArtifactHandle,
    ) -> Result<Artifact, ArtifactPublishError> {
        if let Some(existing) = self.repo.find(pipeline, &handle.version).await? {
            return Self::same_content(existing, handle);
        }

        let now = Utc::now();
        let artifact = Artifact {
            id: Uuid::new_v4(),
            pipeline: pipeline.to_string(),
            version: handle.version.clone(),
            content_ref: handle.content_ref.clone(),
            run_id,
            state: ArtifactState::Staged,
            registered_at: now,
            released_at: None,
            updated_at: now,
        };

        match self.repo.insert(&artifact).await {
            Ok(()) => {
                info!(
                    "Registered artifact {}@{} ({})",
                    pipeline, artifact.version, artifact.content_ref
                );
                Ok(artifact)
            }
            // Lost a race with a concurrent registration of the same version
            Err(RepositoryError::Conflict(_)) => {
                let existing = self.repo.find(pipeline, &handle.version).await?.ok_or_else(
                    || ArtifactPublishError::NotFound {
                        version: handle.version.clone(),
                    },
                )?;
                Self::same_content(existing, handle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn same_content(
        existing: Artifact,
        handle: &ArtifactHandle,
    ) -> Result<Artifact, ArtifactPublishError> {
        if existing.content_ref == handle.content_ref {
            debug!(
                "Artifact {}@{} already registered",
                existing.pipeline, existing.version
            );
            Ok(existing)
        } else {
            Err(ArtifactPublishError::VersionConflict {
                version: handle.version.clone(),
            })
        }
    }

    /// Promotes the run's artifact to `released`.
    ///
    /// Requires an acceptable gate verdict on the run and a `Healthy`
    /// deployment serving the artifact's version. Promoting an already
    /// released artifact is a no-op.
    pub async fn promote(
        &self,
        run: &Run,
        deployment: &Deployment,
    ) -> Result<Artifact, ArtifactPublishError> {
        let _guard = self.promotion.lock().await;

        let version = run
            .artifact_version
            .clone()
            .ok_or_else(|| ArtifactPublishError::NotFound {
                version: "<none>".to_string(),
            })?;
        let mut artifact = self
            .repo
            .find(&run.pipeline, &version)
            .await?
            .ok_or_else(|| ArtifactPublishError::NotFound {
                version: version.clone(),
            })?;

        if artifact.state == ArtifactState::Released {
            debug!("Artifact {}@{} already released", run.pipeline, version);
            return Ok(artifact);
        }
        if !artifact.state.can_transition_to(ArtifactState::Released) {
            return Err(ArtifactPublishError::NotPromotable {
                version,
                state: artifact.state,
            });
        }
        if !run.gate_allows_promotion() {
            return Err(ArtifactPublishError::PromotionRefused {
                version,
                reason: "quality gate verdict is not acceptable".to_string(),
            });
        }
        if deployment.state != RolloutState::Healthy
            || deployment.current_version.as_deref() != Some(version.as_str())
        {
            return Err(ArtifactPublishError::PromotionRefused {
                version,
                reason: format!("environment {} is not healthy", deployment.environment),
            });
        }

        let now = Utc::now();
        for mut previous in self
            .repo
            .find_by_state(&run.pipeline, ArtifactState::Released)
            .await?
        {
            previous.state = ArtifactState::Deprecated;
            previous.updated_at = now;
            self.repo.save(&previous).await?;
            info!("Deprecated artifact {}@{}", previous.pipeline, previous.version);
        }

        artifact.state = ArtifactState::Released;
        artifact.released_at = Some(now);
        artifact.updated_at = now;
        self.repo.save(&artifact).await?;
        info!("Released artifact {}@{}", artifact.pipeline, artifact.version);

        self.apply_retention(&run.pipeline).await?;

        Ok(artifact)
    }

    /// Marks an artifact `rolled_back`; it can never be promoted afterwards
    pub async fn mark_rolled_back(
        &self,
        pipeline: &str,
        version: &str,
    ) -> Result<Option<Artifact>, ArtifactPublishError> {
        let Some(mut artifact) = self.repo.find(pipeline, version).await? else {
            warn!("Rolled back artifact {}@{} is not registered", pipeline, version);
            return Ok(None);
        };

        if artifact.state == ArtifactState::RolledBack {
            return Ok(Some(artifact));
        }
        if !artifact.state.can_transition_to(ArtifactState::RolledBack) {
            return Err(ArtifactPublishError::NotPromotable {
                version: version.to_string(),
                state: artifact.state,
            });
        }

        artifact.state = ArtifactState::RolledBack;
        artifact.updated_at = Utc::now();
        self.repo.save(&artifact).await?;
        warn!("Artifact {}@{} marked rolled back", pipeline, version);

        Ok(Some(artifact))
    }

    /// Purges the oldest deprecated artifacts beyond the retention count
    async fn apply_retention(&self, pipeline: &str) -> Result<(), ArtifactPublishError> {
        let deprecated = self
            .repo
            .find_by_state(pipeline, ArtifactState::Deprecated)
            .await?;

        let excess = deprecated.len().saturating_sub(self.retention);
        for artifact in deprecated.into_iter().take(excess) {
            self.repo.delete(artifact.id).await?;
            info!(
                "Purged deprecated artifact {}@{} (retention {})",
                artifact.pipeline, artifact.version, self.retention
            );
        }
        Ok(())
    }

    pub async fn find(
        &self,
        pipeline: &str,
        version: &str,
    ) -> Result<Option<Artifact>, ArtifactPublishError> {
        Ok(self.repo.find(pipeline, version).await?)
    }

    pub async fn list(&self, pipeline: Option<&str>) -> Result<Vec<Artifact>, ArtifactPublishError> {
        Ok(self.repo.list(pipeline).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::gate::{GateEvaluation, Verdict};
    use conveyor_core::domain::pipeline::{Capability, PipelineDefinition, StageDefinition};
    use conveyor_core::domain::run::TriggerContext;

    use crate::repository::artifact::InMemoryArtifactRepository;

    fn handle(version: &str, content: &str) -> ArtifactHandle {
        ArtifactHandle {
            version: version.to_string(),
            content_ref: content.to_string(),
        }
    }

    fn run_for(version: &str, verdict: Verdict) -> Run {
        let definition = PipelineDefinition {
            name: "api".to_string(),
            repository: "acme/api".to_string(),
            description: None,
            stages: vec![StageDefinition::new("package", Capability::Package)],
            gates: vec![],
            canary: None,
        };
        let mut run = Run::new(
            definition,
            TriggerContext {
                repository: "acme/api".to_string(),
                branch: "main".to_string(),
                change_ref: version.to_string(),
            },
        );
        run.artifact_version = Some(version.to_string());
        run.gate = Some(GateEvaluation {
            verdict,
            conditions: vec![],
            evaluated_at: Utc::now(),
            bypass: None,
        });
        run
    }

    fn healthy(version: &str) -> Deployment {
        let mut deployment = Deployment::new("prod");
        deployment.state = RolloutState::Healthy;
        deployment.current_version = Some(version.to_string());
        deployment
    }

    async fn registered(manager: &ArtifactManager, version: &str) -> Run {
        let run = run_for(version, Verdict::Pass);
        manager
            .register("api", run.id, &handle(version, &format!("sha256:{}", version)))
            .await
            .unwrap();
        run
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let manager = ArtifactManager::new(Arc::new(InMemoryArtifactRepository::default()), 5);
        let run_id = Uuid::new_v4();

        let first = manager.register("api", run_id, &handle("1.0", "sha256:a")).await.unwrap();
        let second = manager.register("api", run_id, &handle("1.0", "sha256:a")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.state, ArtifactState::Staged);

        let conflict = manager.register("api", run_id, &handle("1.0", "sha256:b")).await;
        assert!(matches!(
            conflict,
            Err(ArtifactPublishError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_promotion_deprecates_previous_release() {
        let manager = ArtifactManager::new(Arc::new(InMemoryArtifactRepository::default()), 5);

        let run1 = registered(&manager, "1.0").await;
        manager.promote(&run1, &healthy("1.0")).await.unwrap();

        let run2 = registered(&manager, "2.0").await;
        let released = manager.promote(&run2, &healthy("2.0")).await.unwrap();
        assert_eq!(released.state, ArtifactState::Released);

        let old = manager.find("api", "1.0").await.unwrap().unwrap();
        assert_eq!(old.state, ArtifactState::Deprecated);

        // Promoting again is a no-op
        let again = manager.promote(&run2, &healthy("2.0")).await.unwrap();
        assert_eq!(again.released_at, released.released_at);
    }

    #[tokio::test]
    async fn test_promotion_requires_gate_and_health() {
        let manager = ArtifactManager::new(Arc::new(InMemoryArtifactRepository::default()), 5);
        let mut run = registered(&manager, "1.0").await;

        let mut unhealthy = healthy("1.0");
        unhealthy.state = RolloutState::RolloutInProgress;
        assert!(matches!(
            manager.promote(&run, &unhealthy).await,
            Err(ArtifactPublishError::PromotionRefused { .. })
        ));

        run.gate.as_mut().unwrap().verdict = Verdict::Fail;
        assert!(matches!(
            manager.promote(&run, &healthy("1.0")).await,
            Err(ArtifactPublishError::PromotionRefused { .. })
        ));

        run.gate.as_mut().unwrap().verdict = Verdict::Warn;
        assert!(manager.promote(&run, &healthy("1.0")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rolled_back_artifact_cannot_be_promoted() {
        let manager = ArtifactManager::new(Arc::new(InMemoryArtifactRepository::default()), 5);
        let run = registered(&manager, "1.0").await;

        manager.mark_rolled_back("api", "1.0").await.unwrap();
        assert!(matches!(
            manager.promote(&run, &healthy("1.0")).await,
            Err(ArtifactPublishError::NotPromotable { .. })
        ));
    }

    #[tokio::test]
    async fn test_retention_purges_oldest_deprecated() {
        let manager = ArtifactManager::new(Arc::new(InMemoryArtifactRepository::default()), 1);

        for version in ["1", "2", "3", "4"] {
            let run = registered(&manager, version).await;
            manager.promote(&run, &healthy(version)).await.unwrap();
        }

        let remaining: Vec<String> = manager
            .list(Some("api"))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.version)
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"4".to_string()));
        assert!(remaining.contains(&"3".to_string()));
    }
}
