//! Callback prompt templates.
//!
//! The resume run synthesized on a parent session carries a plain-text
//! prompt describing the child's outcome. Structured results are embedded
//! as a pretty-printed JSON block so an AI orchestrator can parse them.

use crate::run::RunStatus;

use super::models::ChildResult;

/// Render the prompt for a callback resume run.
pub fn render_callback_prompt(
    child_session_id: &str,
    child_status: RunStatus,
    result: &ChildResult,
) -> String {
    match child_status {
        RunStatus::Completed => render_success(child_session_id, result),
        status => render_failure(child_session_id, status, result),
    }
}

fn render_success(child_session_id: &str, result: &ChildResult) -> String {
    let mut prompt = format!(
        "A sub-agent task you launched has completed.\n\n\
         Child session: {}\n\
         Status: completed\n",
        child_session_id
    );

    if let Some(text) = &result.result_text {
        prompt.push_str("\nResult:\n");
        prompt.push_str(text);
        prompt.push('\n');
    }

    if let Some(data) = &result.result_data {
        let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
        prompt.push_str("\nResult data:\n```json\n");
        prompt.push_str(&pretty);
        prompt.push_str("\n```\n");
    }

    if result.result_text.is_none() && result.result_data.is_none() {
        prompt.push_str("\nThe task produced no result payload.\n");
    }

    prompt
}

fn render_failure(child_session_id: &str, status: RunStatus, result: &ChildResult) -> String {
    let mut prompt = format!(
        "A sub-agent task you launched did not complete.\n\n\
         Child session: {}\n\
         Status: {}\n",
        child_session_id, status
    );

    if let Some(error) = &result.error {
        prompt.push_str("Error: ");
        prompt.push_str(error);
        prompt.push('\n');
    }

    prompt.push_str(
        "\nDecide how to proceed: you may retry by launching a new task, \
         adjust your plan, or report the failure.\n",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_with_text() {
        let result = ChildResult {
            result_text: Some("Found 3 sources.".to_string()),
            result_data: None,
            error: None,
        };
        let prompt = render_callback_prompt("ses_child", RunStatus::Completed, &result);

        assert!(prompt.contains("Child session: ses_child"));
        assert!(prompt.contains("Status: completed"));
        assert!(prompt.contains("Found 3 sources."));
        assert!(!prompt.contains("```json"));
    }

    #[test]
    fn test_success_with_structured_data() {
        let result = ChildResult {
            result_text: None,
            result_data: Some(json!({"pages_crawled": 42})),
            error: None,
        };
        let prompt = render_callback_prompt("ses_child", RunStatus::Completed, &result);

        assert!(prompt.contains("```json"));
        assert!(prompt.contains("\"pages_crawled\": 42"));
    }

    #[test]
    fn test_failure_variant() {
        let result = ChildResult {
            result_text: None,
            result_data: None,
            error: Some("Runner disconnected during execution".to_string()),
        };
        let prompt = render_callback_prompt("ses_child", RunStatus::Failed, &result);

        assert!(prompt.contains("did not complete"));
        assert!(prompt.contains("Status: failed"));
        assert!(prompt.contains("Runner disconnected during execution"));
        assert!(prompt.contains("retry"));
    }

    #[test]
    fn test_stopped_uses_failure_variant() {
        let prompt =
            render_callback_prompt("ses_child", RunStatus::Stopped, &ChildResult::default());
        assert!(prompt.contains("Status: stopped"));
    }
}
