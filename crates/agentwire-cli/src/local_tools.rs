//! Demo tools the agent can call while chatting

use agentwire_core::{find_param, LocalTool, ToolOutput, ToolParam};
use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Current local time as `YYYY-MM-DD HH:MM:SS`
pub struct LocalTime;

#[async_trait]
impl LocalTool for LocalTime {
    async fn call(&self, _tool_name: &str, _params: &[ToolParam]) -> ToolOutput {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        info!("Sending current time: {}", now);
        ToolOutput::success(now)
    }
}

/// `set_reminder(task: string, timeout: int seconds)`; due reminders are sent
/// to the chat loop
pub struct Reminder {
    due: mpsc::UnboundedSender<String>,
}

impl Reminder {
    pub fn new(due: mpsc::UnboundedSender<String>) -> Self {
        Self { due }
    }
}

#[async_trait]
impl LocalTool for Reminder {
    async fn call(&self, _tool_name: &str, params: &[ToolParam]) -> ToolOutput {
        let task = find_param(params, "task").and_then(ToolParam::as_str);
        let timeout = find_param(params, "timeout").and_then(ToolParam::as_int);
        let (Some(task), Some(timeout)) = (task, timeout.filter(|t| *t > 0)) else {
            return ToolOutput::error(
                "Error: Invalid parameters. 'task' must be a string and 'timeout' must be a positive integer.",
            );
        };

        let due = self.due.clone();
        let message = task.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout as u64)).await;
            info!("Reminder expired: {}", message);
            let _ = due.send(message);
        });

        info!("Reminder set: {} (timeout: {} seconds)", task, timeout);
        ToolOutput::success(format!("Reminder set for '{task}' in {timeout} seconds."))
    }
}

/// Returns its parameters as a JSON object
pub struct Echo;

#[async_trait]
impl LocalTool for Echo {
    async fn call(&self, _tool_name: &str, params: &[ToolParam]) -> ToolOutput {
        let object: serde_json::Map<String, serde_json::Value> = params
            .iter()
            .map(|p| (p.name.clone(), serde_json::json!(p.value)))
            .collect();
        ToolOutput::success(serde_json::Value::Object(object).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwire_core::{ToolParamValue, ToolStatus};

    fn param(name: &str, value: ToolParamValue) -> ToolParam {
        ToolParam::new(name, value)
    }

    #[tokio::test]
    async fn test_local_time_format() {
        let output = LocalTime.call("get_local_time", &[]).await;
        assert_eq!(output.status, ToolStatus::Success);
        let time = output.result.unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(&time, "%Y-%m-%d %H:%M:%S").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminder_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = Reminder::new(tx)
            .call(
                "set_reminder",
                &[
                    param("task", ToolParamValue::Str("stretch".into())),
                    param("timeout", ToolParamValue::Int(5)),
                ],
            )
            .await;
        assert_eq!(
            output,
            ToolOutput::success("Reminder set for 'stretch' in 5 seconds.")
        );
        assert_eq!(rx.recv().await.as_deref(), Some("stretch"));
    }

    #[tokio::test]
    async fn test_reminder_rejects_bad_params() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tool = Reminder::new(tx);
        for params in [
            vec![param("task", ToolParamValue::Str("x".into()))],
            vec![
                param("task", ToolParamValue::Str("x".into())),
                param("timeout", ToolParamValue::Int(0)),
            ],
            vec![param("timeout", ToolParamValue::Int(3))],
        ] {
            let output = tool.call("set_reminder", &params).await;
            assert_eq!(output.status, ToolStatus::Error);
            assert!(output.result.unwrap().starts_with("Error: Invalid parameters"));
        }
    }

    #[tokio::test]
    async fn test_echo() {
        let output = Echo
            .call(
                "echo",
                &[
                    param("b", ToolParamValue::Bool(true)),
                    param("a", ToolParamValue::Int(1)),
                ],
            )
            .await;
        let echoed: serde_json::Value = serde_json::from_str(&output.result.unwrap()).unwrap();
        assert_eq!(echoed, serde_json::json!({"b": true, "a": 1}));
    }
}
