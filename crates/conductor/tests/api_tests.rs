//! API integration tests covering the end-to-end coordinator scenarios.

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use serde_json::json;

use conductor::error::{ERR_LEASE_EXPIRED, ERR_NO_RUNNER_AVAILABLE};
use conductor_protocol::{CompleteRunRequest, EventPayload};

mod common;
use common::{TestApp, autonomous_agent, test_app};

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let (status, body) = app.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

/// E1: AI agent success through the full HTTP surface.
#[tokio::test]
async fn test_ai_agent_success_end_to_end() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([autonomous_agent("researcher")]))
        .await;

    let (status, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "researcher",
                "parameters": {"prompt": "Research X"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {run}");
    let run_id = run["id"].as_str().unwrap().to_string();
    let session_id = run["session_id"].as_str().unwrap().to_string();
    assert_eq!(run["status"], "pending");
    assert_eq!(run["run_number"], 1);
    assert!(run_id.starts_with("run_"));
    assert!(session_id.starts_with("ses_"));

    // Runner claims over the poll endpoint; the resolved blueprint rides
    // along.
    let (status, claimed) = app
        .get(&format!("/runner/runs?runner_id={runner_id}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["run_id"], run_id.as_str());
    assert_eq!(claimed["blueprint"]["name"], "researcher");
    assert_eq!(claimed["parameters"]["prompt"], "Research X");

    let (status, _) = app
        .post(
            &format!("/runner/runs/{run_id}/running"),
            json!({"runner_id": runner_id}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Runner streams observability events, then the authoritative result.
    let (status, _) = app
        .post(
            "/events",
            json!({
                "session_id": session_id,
                "events": [
                    {"event_type": "pre_tool", "run_id": run_id, "tool_name": "web_search",
                     "tool_input": {"query": "X"}},
                    {"event_type": "post_tool", "run_id": run_id, "tool_name": "web_search"},
                    {"event_type": "message", "run_id": run_id, "role": "assistant",
                     "text": "Here is what I found."},
                    {"event_type": "result", "run_id": run_id,
                     "result_text": "X is well understood.", "result_data": null}
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, done) = app
        .post(
            &format!("/runner/runs/{run_id}/completed"),
            json!({"runner_id": runner_id}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status"], "completed");

    let (status, session) = app.get(&format!("/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["status"], "finished");

    let (status, result) = app.get(&format!("/sessions/{session_id}/result")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["result_text"], "X is well understood.");
    assert_eq!(result["result_data"], serde_json::Value::Null);

    // The persisted log replays in strict order with contiguous sequences.
    let (status, events) = app
        .get(&format!("/sessions/{session_id}/events?since=0"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        vec!["run_start", "pre_tool", "post_tool", "message", "result", "run_completed"]
    );
    for (i, event) in events.as_array().unwrap().iter().enumerate() {
        assert_eq!(event["sequence"], (i + 1) as i64);
    }
}

/// E2: parameter rejection with the schema echoed back.
#[tokio::test]
async fn test_parameter_rejection() {
    let app = test_app().await;
    app.register_runner(json!([autonomous_agent("researcher")]))
        .await;

    let (status, body) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "researcher",
                "parameters": {}
            }),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "parameter_validation_failed");
    assert_eq!(body["agent_name"], "researcher");
    assert_eq!(body["validation_errors"][0]["path"], "$.prompt");
    // The implicit schema is echoed so the caller can self-correct.
    assert_eq!(body["parameters_schema"]["required"][0], "prompt");
}

/// E3: procedural agent with an output schema emits result_data only.
#[tokio::test]
async fn test_procedural_agent_with_output_schema() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([{
            "name": "web-crawler",
            "type": "procedural",
            "description": "Crawls pages",
            "parameters_schema": {
                "type": "object",
                "required": ["url", "depth"],
                "properties": {
                    "url": {"type": "string", "format": "uri"},
                    "depth": {"type": "integer"}
                }
            },
            "output_schema": {
                "type": "object",
                "required": ["pages_crawled"],
                "properties": {
                    "pages_crawled": {"type": "integer"},
                    "data": {"type": "array"}
                }
            }
        }]))
        .await;

    let (status, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "web-crawler",
                "parameters": {"url": "https://example.com", "depth": 3}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {run}");
    let run_id = run["id"].as_str().unwrap().to_string();
    let session_id = run["session_id"].as_str().unwrap().to_string();

    let claimed = app.claim_run(&runner_id).await;
    assert_eq!(claimed.run_id, run_id);
    app.app
        .service
        .mark_running(&run_id, &runner_id)
        .await
        .unwrap();

    // Text results violate the structured contract.
    let (status, body) = app
        .post(
            &format!("/runner/runs/{run_id}/completed"),
            json!({"runner_id": runner_id, "result_text": "done"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "expected rejection: {body}");

    let (status, done) = app
        .post(
            &format!("/runner/runs/{run_id}/completed"),
            json!({
                "runner_id": runner_id,
                "result_data": {"pages_crawled": 42, "data": [{"url": "https://example.com"}]}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "completion failed: {done}");

    let (status, result) = app.get(&format!("/sessions/{session_id}/result")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["result_text"], serde_json::Value::Null);
    assert_eq!(result["result_data"]["pages_crawled"], 42);

    // The synthesized result event is in the log, exactly once.
    let (_, events) = app
        .get(&format!("/sessions/{session_id}/events?since=0"))
        .await;
    let results: Vec<_> = events
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["event_type"] == "result")
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["result_data"]["pages_crawled"], 42);
}

/// E5: agent name collisions reject the second runner wholesale.
#[tokio::test]
async fn test_agent_name_collision() {
    let app = test_app().await;
    app.register_runner(json!([autonomous_agent("web-crawler")]))
        .await;

    let (status, body) = app
        .post(
            "/runner/register",
            json!({
                "hostname": "other-host",
                "agents": [autonomous_agent("web-crawler"), autonomous_agent("other")]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "agent_name_collision");

    // Runner A's declaration is intact and nothing of B's registered.
    let (_, agents) = app.get("/agents").await;
    let names: Vec<&str> = agents
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.iter().filter(|n| **n == "web-crawler").count(), 1);
    assert!(!names.contains(&"other"));
}

/// E4: runner disconnect fails the run and resumes the parent with the
/// failure callback.
#[tokio::test]
async fn test_runner_disconnect_with_callback() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([
            autonomous_agent("orchestrator"),
            autonomous_agent("worker")
        ]))
        .await;

    // Parent session: run to completion so it sits idle awaiting callbacks.
    let (_, parent_run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "orchestrator",
                "parameters": {"prompt": "Launch a worker"}
            }),
        )
        .await;
    let parent_session = parent_run["session_id"].as_str().unwrap().to_string();

    app.drive_one_run(
        &runner_id,
        |claimed| {
            vec![EventPayload::Result {
                run_id: claimed.run_id.clone(),
                result_text: Some("Worker launched.".to_string()),
                result_data: None,
            }]
        },
        |_| CompleteRunRequest::default(),
    )
    .await;

    // Child in async_callback mode, linked through context.
    let (status, child_run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "worker",
                "parameters": {"prompt": "Do the work"},
                "execution_mode": "async_callback",
                "context": {"parent_session_id": parent_session}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let child_run_id = child_run["id"].as_str().unwrap().to_string();

    let claimed = app.claim_run(&runner_id).await;
    assert_eq!(claimed.run_id, child_run_id);
    app.app
        .service
        .mark_running(&child_run_id, &runner_id)
        .await
        .unwrap();

    // The runner vanishes mid-run.
    let (status, _) = app.delete(&format!("/runner/{runner_id}")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let child = app.wait_terminal(&child_run_id).await;
    assert_eq!(child.status.to_string(), "failed");
    assert_eq!(
        child.error.as_deref(),
        Some("Runner disconnected during execution")
    );

    // The parent is resumed with the failure prompt.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    let resume = loop {
        let runs = app
            .app
            .service
            .session_runs(&parent_session)
            .await
            .unwrap();
        if runs.len() == 2 {
            break runs.into_iter().nth(1).unwrap();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "parent was never resumed"
        );
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    };

    assert_eq!(resume.run_number, 2);
    assert_eq!(resume.run_type.to_string(), "resume_session");
    let prompt = resume.parameters["prompt"].as_str().unwrap();
    assert!(prompt.contains("did not complete"));
    assert!(prompt.contains("Runner disconnected during execution"));
}

/// E6: an on_run_start hook blocks the run before dispatch.
#[tokio::test]
async fn test_hook_block() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([
            {
                "name": "validator",
                "type": "procedural",
                "description": "Validates run inputs",
                "parameters_schema": {"type": "object"},
                "output_schema": {"type": "object"}
            },
            {
                "name": "guarded",
                "type": "autonomous",
                "description": "Guarded agent",
                "hooks": {
                    "on_run_start": {
                        "type": "agent",
                        "agent_name": "validator",
                        "on_error": "block"
                    }
                }
            }
        ]))
        .await;

    let (status, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "guarded",
                "parameters": {"prompt": "fetch http://disallowed.example"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let run_id = run["id"].as_str().unwrap().to_string();
    let session_id = run["session_id"].as_str().unwrap().to_string();

    // The only claimable run is the nested validator invocation; the
    // guarded run is gated behind the hook.
    let claimed = app.claim_run(&runner_id).await;
    assert_eq!(claimed.blueprint.name, "validator");
    assert_eq!(claimed.parameters["run_id"], run_id.as_str());
    assert_eq!(claimed.parameters["agent_name"], "guarded");

    app.app
        .service
        .mark_running(&claimed.run_id, &runner_id)
        .await
        .unwrap();
    app.app
        .service
        .ingest_events(conductor_protocol::IngestEventsRequest {
            session_id: claimed.session_id.clone(),
            events: vec![conductor_protocol::runner::IngestEvent {
                timestamp: None,
                payload: EventPayload::Result {
                    run_id: claimed.run_id.clone(),
                    result_text: None,
                    result_data: Some(json!({
                        "action": "block",
                        "block_reason": "disallowed url"
                    })),
                },
            }],
        })
        .await
        .unwrap();
    app.app
        .service
        .complete_run(
            &claimed.run_id,
            CompleteRunRequest {
                runner_id: runner_id.clone(),
                ..CompleteRunRequest::default()
            },
        )
        .await
        .unwrap();

    // The guarded run fails without ever being dispatched.
    let run = app.wait_terminal(&run_id).await;
    assert_eq!(run.status.to_string(), "failed");
    assert!(run.error.as_deref().unwrap().contains("hook_blocked"));
    assert!(run.error.as_deref().unwrap().contains("disallowed url"));
    assert!(run.runner_id.is_none());

    let (_, events) = app
        .get(&format!("/sessions/{session_id}/events?since=0"))
        .await;
    let blocked = events
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["event_type"] == "hook_blocked")
        .expect("hook_blocked event");
    assert_eq!(blocked["block_reason"], "disallowed url");
    assert_eq!(blocked["agent_name"], "validator");
}

/// One non-terminal run per session; run numbers stay contiguous.
#[tokio::test]
async fn test_session_conflict_and_run_numbering() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([autonomous_agent("researcher")]))
        .await;

    let (_, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "researcher",
                "parameters": {"prompt": "first"}
            }),
        )
        .await;
    let session_id = run["session_id"].as_str().unwrap().to_string();

    // A resume while the first run is active conflicts.
    let (status, body) = app
        .post(
            "/runs",
            json!({
                "type": "resume_session",
                "session_id": session_id,
                "parameters": {"prompt": "too soon"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "session_conflict");

    app.drive_one_run(
        &runner_id,
        |claimed| {
            vec![EventPayload::Result {
                run_id: claimed.run_id.clone(),
                result_text: Some("done".to_string()),
                result_data: None,
            }]
        },
        |_| CompleteRunRequest::default(),
    )
    .await;

    let (status, resume) = app
        .post(
            "/runs",
            json!({
                "type": "resume_session",
                "session_id": session_id,
                "parameters": {"prompt": "follow up"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(resume["run_number"], 2);

    // Unknown agents and sessions map to 404s.
    let (status, body) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "nonexistent",
                "parameters": {"prompt": "x"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "agent_not_found");

    let (status, _) = app.get("/sessions/ses_missing/result").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Dispatch timeout and lease expiry fail runs with the documented errors.
#[tokio::test]
async fn test_dispatch_timeout_and_lease_expiry() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([autonomous_agent("researcher")]))
        .await;

    // A run for an agent nobody declares waits, then times out.
    let lonely = app
        .register_runner(json!([autonomous_agent("lonely")]))
        .await;
    let (_, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "lonely",
                "parameters": {"prompt": "anyone?"}
            }),
        )
        .await;
    let lonely_run = run["id"].as_str().unwrap().to_string();
    // Remove the only runner declaring it, then sweep past the deadline.
    app.delete(&format!("/runner/{lonely}")).await;

    let future = Utc::now() + Duration::seconds(120);
    let expired = app.app.runs.list_dispatch_expired(future).await.unwrap();
    assert!(expired.iter().any(|r| r.id == lonely_run));
    for run in expired {
        app.app
            .service
            .fail_dispatch_expired(&run, ERR_NO_RUNNER_AVAILABLE)
            .await
            .unwrap();
    }

    let failed = app.app.service.get_run(&lonely_run).await.unwrap();
    assert_eq!(failed.status.to_string(), "failed");
    assert_eq!(
        failed.error.as_deref(),
        Some("No matching runner available within timeout")
    );

    // A claimed-but-never-confirmed run loses its lease.
    let (_, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "researcher",
                "parameters": {"prompt": "claim me"}
            }),
        )
        .await;
    let run_id = run["id"].as_str().unwrap().to_string();
    let claimed = app.claim_run(&runner_id).await;
    assert_eq!(claimed.run_id, run_id);

    let expired = app
        .app
        .runs
        .list_lease_expired(Utc::now() + Duration::seconds(300))
        .await
        .unwrap();
    assert!(expired.iter().any(|r| r.id == run_id));
    for run in expired {
        app.app
            .service
            .fail_lease_expired(&run, ERR_LEASE_EXPIRED)
            .await
            .unwrap();
    }

    let failed = app.app.service.get_run(&run_id).await.unwrap();
    assert_eq!(failed.status.to_string(), "failed");
}

/// Stop flow: pending runs stop immediately; running runs go through
/// stopping and are acknowledged by the runner's terminal report.
#[tokio::test]
async fn test_stop_flow() {
    let app = test_app().await;
    let runner_id = app
        .register_runner(json!([autonomous_agent("researcher")]))
        .await;

    // Pending -> stopped directly.
    let lonely = app
        .register_runner(json!([autonomous_agent("slowpoke")]))
        .await;
    let (_, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "slowpoke",
                "parameters": {"prompt": "wait"}
            }),
        )
        .await;
    let pending_run = run["id"].as_str().unwrap().to_string();
    // Keep it pending: claim it with nobody by removing the runner.
    app.delete(&format!("/runner/{lonely}")).await;

    let (status, stopped) = app
        .post(&format!("/runs/{pending_run}/stop"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopped");

    // Running -> stopping -> stopped on the runner's report.
    let (_, run) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "researcher",
                "parameters": {"prompt": "work"}
            }),
        )
        .await;
    let run_id = run["id"].as_str().unwrap().to_string();
    app.claim_run(&runner_id).await;
    app.app
        .service
        .mark_running(&run_id, &runner_id)
        .await
        .unwrap();

    let (status, stopping) = app.post(&format!("/runs/{run_id}/stop"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopping["status"], "stopping");

    let (status, finished) = app
        .post(
            &format!("/runner/runs/{run_id}/completed"),
            json!({"runner_id": runner_id, "result_text": "partial"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["status"], "stopped");

    let (_, events) = app
        .get(&format!(
            "/sessions/{}/events?since=0",
            run["session_id"].as_str().unwrap()
        ))
        .await;
    assert!(
        events
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["event_type"] == "run_stopped")
    );
}

/// Admin blueprint CRUD round trip, including file materialisation
/// precedence over runner-declared blueprints.
#[tokio::test]
async fn test_admin_blueprint_crud() {
    let app = test_app().await;

    let (status, created) = app
        .post(
            "/agents",
            json!({
                "name": "summarizer",
                "type": "autonomous",
                "description": "Summarizes documents",
                "system_prompt": "Summarize {params.prompt}"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "summarizer");

    // Duplicate create is rejected; PUT updates.
    let (status, _) = app
        .post(
            "/agents",
            json!({"name": "summarizer", "type": "autonomous"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, updated) = app
        .send(
            Method::PUT,
            "/agents/summarizer",
            Some(&json!({
                "name": "summarizer",
                "type": "autonomous",
                "description": "Summarizes better"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["description"], "Summarizes better");

    // A runner may declare the same name; the admin copy wins.
    app.register_runner(json!([autonomous_agent("summarizer")]))
        .await;
    let (_, agent) = app.get("/agents/summarizer").await;
    assert_eq!(agent["description"], "Summarizes better");

    let (status, _) = app.delete("/agents/summarizer").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The runner-declared copy shines through after the admin delete.
    let (status, agent) = app.get("/agents/summarizer").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(agent["description"], "summarizer agent");
}

/// Placeholder resolution failures reject run creation with every
/// unresolved reference listed.
#[tokio::test]
async fn test_placeholder_unresolved() {
    let app = test_app().await;
    let (status, _) = app
        .post(
            "/agents",
            json!({
                "name": "templated",
                "type": "autonomous",
                "system_prompt": "Use {scope.tenant} and {params.missing_key}"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "templated",
                "parameters": {"prompt": "go"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "placeholder_unresolved");
    let references: Vec<&str> = body["references"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r.as_str().unwrap())
        .collect();
    assert_eq!(references, vec!["params.missing_key", "scope.tenant"]);

    // With the scope and parameter supplied, the run is accepted.
    let (status, _) = app
        .post(
            "/runs",
            json!({
                "type": "start_session",
                "agent_name": "templated",
                "parameters": {"prompt": "go", "missing_key": "value"},
                "scope": {"tenant": "acme"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
}
