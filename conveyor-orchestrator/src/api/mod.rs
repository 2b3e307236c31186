//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod pipeline;
pub mod release;
pub mod run;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::engine::Orchestrator;

/// Create the main API router with all endpoints
pub fn create_router(engine: Arc<Orchestrator>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Trigger endpoint
        .route("/trigger", post(run::trigger))
        // Pipeline endpoints
        .route("/pipeline/create", post(pipeline::create_pipeline))
        .route("/pipeline/list", get(pipeline::list_pipelines))
        .route(
            "/pipeline/{name}",
            get(pipeline::get_pipeline).delete(pipeline::delete_pipeline),
        )
        // Run endpoints
        .route("/run/list", get(run::list_runs))
        .route("/run/{id}", get(run::get_run))
        .route("/run/{id}/events", get(run::get_run_events))
        .route("/run/{id}/cancel", post(run::cancel_run))
        .route("/run/{id}/gate/override", post(run::override_gate))
        // Artifact endpoints
        .route("/artifact/list", get(release::list_artifacts))
        .route("/artifact/{pipeline}/{version}", get(release::get_artifact))
        // Environment endpoints
        .route("/environment/list", get(release::list_environments))
        .route("/environment/{name}", get(release::get_environment))
        .route(
            "/environment/{name}/rollback",
            post(release::rollback_environment),
        )
        // Gate audit
        .route("/gate/audit", get(release::gate_audit))
        // Add state and middleware
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use conveyor_core::domain::gate::{GateEvaluation, Verdict};
    use conveyor_core::domain::pipeline::{Capability, PipelineDefinition, StageDefinition};
    use conveyor_core::domain::run::{Run, TriggerContext};
    use conveyor_core::domain::trigger::TriggerNotification;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use tower::ServiceExt;

    use crate::engine::EngineSettings;
    use crate::engine::adapter::{AdapterRegistry, NOOP_ADAPTER};
    use crate::engine::testing::{RecordingTarget, ScriptedAdapter, ScriptedProbe};
    use crate::repository::Repositories;

    const SECRET: &str = "s3cret";

    const SCRIPT: &str = r#"
        return pipeline.define({
            name = "api",
            repository = "acme/api",
            stages = {
                pipeline.stage("build", "build"),
                pipeline.stage("package", "package", { depends_on = { "build" } }),
            },
            gates = { "bugs <= 0" },
        })
    "#;

    fn engine(queue_capacity: usize) -> Arc<Orchestrator> {
        let settings = EngineSettings {
            trigger_secret: SECRET.to_string(),
            queue_capacity,
            bypass_tokens: HashMap::from([("letmein".to_string(), "alice".to_string())]),
            ..EngineSettings::default()
        };
        Arc::new(Orchestrator::new(
            Repositories::in_memory(),
            settings,
            AdapterRegistry::new().register(NOOP_ADAPTER, Arc::new(ScriptedAdapter::default())),
            Arc::new(RecordingTarget::default()),
            Arc::new(ScriptedProbe::default()),
        ))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn with_pipeline(queue_capacity: usize) -> (Arc<Orchestrator>, Router) {
        let engine = engine(queue_capacity);
        let app = create_router(engine.clone());
        let (status, _) = send(&app, "POST", "/pipeline/create", Some(json!({ "script": SCRIPT }))).await;
        assert_eq!(status, StatusCode::CREATED);
        (engine, app)
    }

    fn trigger_body(change_ref: &str) -> Value {
        serde_json::to_value(TriggerNotification::signed("acme/api", "main", change_ref, SECRET))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(engine(8));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pipeline_endpoints() {
        let (_, app) = with_pipeline(8).await;

        let (status, body) = send(&app, "GET", "/pipeline/api", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repository"], "acme/api");
        assert_eq!(body["stages"][1]["dependsOn"][0], "build");

        let (status, body) = send(&app, "GET", "/pipeline/list", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["stageCount"], 2);

        let (status, body) = send(
            &app,
            "POST",
            "/pipeline/create",
            Some(json!({ "script": "return pipeline.define({ name = 'x', repository = 'y', stages = {} })" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "DELETE", "/pipeline/api", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "GET", "/pipeline/api", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Pipeline api not found");
    }

    #[tokio::test]
    async fn test_trigger_responses() {
        let (_, app) = with_pipeline(8).await;

        let (status, accepted) = send(&app, "POST", "/trigger", Some(trigger_body("abc"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["duplicate"], false);

        let (status, duplicate) = send(&app, "POST", "/trigger", Some(trigger_body("abc"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(duplicate["runId"], accepted["runId"]);
        assert_eq!(duplicate["duplicate"], true);

        let mut forged = trigger_body("def");
        forged["signature"] = json!("sha256=deadbeef");
        let (status, _) = send(&app, "POST", "/trigger", Some(forged)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = serde_json::to_value(TriggerNotification::signed(
            "acme/unknown",
            "main",
            "abc",
            SECRET,
        ))
        .unwrap();
        let (status, _) = send(&app, "POST", "/trigger", Some(unknown)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, runs) = send(&app, "GET", "/run/list", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_answers_503() {
        let (_, app) = with_pipeline(1).await;

        let (status, _) = send(&app, "POST", "/trigger", Some(trigger_body("one"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = send(&app, "POST", "/trigger", Some(trigger_body("two"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_run_inspection_and_cancel() {
        let (_, app) = with_pipeline(8).await;
        let (_, accepted) = send(&app, "POST", "/trigger", Some(trigger_body("abc"))).await;
        let run_id = accepted["runId"].as_str().unwrap().to_string();

        let (status, run) = send(&app, "GET", &format!("/run/{}", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "running");

        let (status, run) = send(&app, "POST", &format!("/run/{}/cancel", run_id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(run["status"], "cancelled");

        let (status, _) = send(&app, "POST", &format!("/run/{}/cancel", run_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, events) = send(&app, "GET", &format!("/run/{}/events", run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events[0]["kind"]["type"], "created");

        let (status, runs) = send(&app, "GET", "/run/list?status=cancelled", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "GET", &format!("/run/{}", uuid::Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gate_override_endpoints() {
        let engine = engine(8);
        let app = create_router(engine.clone());

        let definition = PipelineDefinition {
            name: "api".to_string(),
            repository: "acme/api".to_string(),
            description: None,
            stages: vec![StageDefinition::new("package", Capability::Package)],
            gates: vec![],
            canary: None,
        };
        let trigger = TriggerContext {
            repository: "acme/api".to_string(),
            branch: "main".to_string(),
            change_ref: "abc".to_string(),
        };
        let mut run = Run::new(definition, trigger);
        run.status = conveyor_core::domain::run::RunStatus::Failed;
        run.completed_at = Some(Utc::now());
        run.gate = Some(GateEvaluation {
            verdict: Verdict::Fail,
            conditions: vec![],
            evaluated_at: Utc::now(),
            bypass: None,
        });
        engine.repositories().runs.insert(&run).await.unwrap();
        let uri = format!("/run/{}/gate/override", run.id);

        let (status, _) = send(&app, "POST", &uri, Some(json!({ "token": "guess" }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            "POST",
            &uri,
            Some(json!({ "token": "letmein", "reason": "hotfix" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["gate"]["bypass"]["actor"], "alice");

        let (status, _) = send(&app, "POST", &uri, Some(json!({ "token": "letmein" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, audit) = send(&app, "GET", &format!("/gate/audit?runId={}", run.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audit.as_array().unwrap().len(), 1);
        assert_eq!(audit[0]["reason"], "hotfix");
    }

    #[tokio::test]
    async fn test_release_endpoints_not_found() {
        let app = create_router(engine(8));

        let (status, _) = send(&app, "GET", "/environment/prod", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/environment/prod/rollback", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/artifact/api/1.0.0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, list) = send(&app, "GET", "/environment/list", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(list.as_array().unwrap().is_empty());

        let (status, list) = send(&app, "GET", "/artifact/list?pipeline=api", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(list.as_array().unwrap().is_empty());
    }
}
