//! Test utilities and common setup.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use conductor::bootstrap::App;
use conductor::config::CoordinatorConfig;
use conductor::db::Database;
use conductor::run::Run;
use conductor_protocol::{ClaimedRun, CompleteRunRequest, EventPayload, IngestEventsRequest};

/// A wired coordinator plus its router, with test-friendly timings.
pub struct TestApp {
    pub app: App,
    pub router: Router,
    _data_dir: tempfile::TempDir,
}

pub async fn test_app() -> TestApp {
    let data_dir = tempfile::tempdir().expect("create test data dir");
    let config = CoordinatorConfig {
        data_dir: data_dir.path().to_path_buf(),
        long_poll_seconds: 1,
        dispatch_timeout_seconds: 30,
        hook_timeout_seconds: 30,
        sweep_interval_seconds: 1,
        ..CoordinatorConfig::default()
    };

    let db = Database::in_memory().await.expect("open in-memory store");
    let mut app = App::build(&db, config).await.expect("build app");
    let _ = app.spawn_callback_processor();
    let router = app.router();

    TestApp {
        app,
        router,
        _data_dir: data_dir,
    }
}

impl TestApp {
    pub async fn send(&self, method: Method, uri: &str, body: Option<&Value>) -> (StatusCode, Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .expect("build request"),
            None => builder.body(Body::empty()).expect("build request"),
        };

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("send request");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(&body)).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::DELETE, uri, None).await
    }

    /// Register a runner declaring the given blueprints; returns its ID.
    pub async fn register_runner(&self, agents: Value) -> String {
        let (status, body) = self
            .post(
                "/runner/register",
                json!({ "hostname": "test-host", "agents": agents }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "registration failed: {body}");
        body["runner_id"].as_str().expect("runner_id").to_string()
    }

    /// Poll the dispatcher until the runner claims a run (or time out).
    pub async fn claim_run(&self, runner_id: &str) -> ClaimedRun {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if let Some(claimed) = self
                .app
                .state
                .dispatcher
                .claim_next(runner_id)
                .await
                .expect("claim")
            {
                return claimed;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no run became claimable for {runner_id}"
            );
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    /// Claim one run and drive it to completion: running, the given events,
    /// then the terminal report.
    pub async fn drive_one_run(
        &self,
        runner_id: &str,
        events: impl FnOnce(&ClaimedRun) -> Vec<EventPayload>,
        report: impl FnOnce(&ClaimedRun) -> CompleteRunRequest,
    ) -> ClaimedRun {
        let claimed = self.claim_run(runner_id).await;

        self.app
            .service
            .mark_running(&claimed.run_id, runner_id)
            .await
            .expect("mark running");

        let batch = events(&claimed);
        if !batch.is_empty() {
            self.app
                .service
                .ingest_events(IngestEventsRequest {
                    session_id: claimed.session_id.clone(),
                    events: batch
                        .into_iter()
                        .map(|payload| conductor_protocol::runner::IngestEvent {
                            timestamp: None,
                            payload,
                        })
                        .collect(),
                })
                .await
                .expect("ingest events");
        }

        let mut terminal = report(&claimed);
        terminal.runner_id = runner_id.to_string();
        self.app
            .service
            .complete_run(&claimed.run_id, terminal)
            .await
            .expect("complete run");

        claimed
    }

    /// Poll a run until it reaches a terminal state.
    pub async fn wait_terminal(&self, run_id: &str) -> Run {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let run = self.app.service.get_run(run_id).await.expect("get run");
            if run.status.is_terminal() {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} never finished"
            );
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }
}

/// Blueprint literal for a minimal autonomous agent.
pub fn autonomous_agent(name: &str) -> Value {
    json!({
        "name": name,
        "type": "autonomous",
        "description": format!("{name} agent"),
    })
}
