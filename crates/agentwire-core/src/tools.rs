//! Local Tools
//!
//! Functions the server may ask the client to run. Each `tool_request` runs
//! on its own task so a slow tool never stalls the read loop; its single
//! `tool_response` goes out through the outbound queue once the tool returns.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::protocol::encode_tool_response;
use crate::transport::{Frame, OutboundSender};

/// Type of a tool parameter as inferred from its JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolParamType {
    Int,
    Str,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ToolParamValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// A named tool argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolParam {
    pub name: String,
    pub value: ToolParamValue,
}

impl ToolParam {
    pub fn new(name: impl Into<String>, value: ToolParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn param_type(&self) -> ToolParamType {
        match self.value {
            ToolParamValue::Int(_) => ToolParamType::Int,
            ToolParamValue::Str(_) => ToolParamType::Str,
            ToolParamValue::Bool(_) => ToolParamType::Bool,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            ToolParamValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            ToolParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            ToolParamValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// First parameter called `name`
pub fn find_param<'a>(params: &'a [ToolParam], name: &str) -> Option<&'a ToolParam> {
    params.iter().find(|p| p.name == name)
}

/// A parsed `tool_request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub request_id: String,
    pub tool_name: String,
    pub params: Vec<ToolParam>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a tool hands back. `result` is sent even when the status is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: ToolStatus,
    pub result: Option<String>,
}

impl ToolOutput {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            result: Some(result.into()),
        }
    }

    pub fn error(result: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            result: Some(result.into()),
        }
    }

    /// Success with no `result` field
    pub fn empty() -> Self {
        Self {
            status: ToolStatus::Success,
            result: None,
        }
    }

    /// Error with no `result` field
    pub fn failed() -> Self {
        Self {
            status: ToolStatus::Error,
            result: None,
        }
    }
}

/// A function the server can invoke. State the tool needs lives on the
/// implementing type.
#[async_trait]
pub trait LocalTool: Send + Sync {
    async fn call(&self, tool_name: &str, params: &[ToolParam]) -> ToolOutput;
}

/// [`LocalTool`] wrapping an async closure; see [`tool_fn`]
pub struct FnTool<F>(F);

/// Turn `|params| async move { ... }` into a [`LocalTool`]
pub fn tool_fn<F, Fut>(f: F) -> FnTool<F>
where
    F: Fn(Vec<ToolParam>) -> Fut + Send + Sync,
    Fut: Future<Output = ToolOutput> + Send,
{
    FnTool(f)
}

#[async_trait]
impl<F, Fut> LocalTool for FnTool<F>
where
    F: Fn(Vec<ToolParam>) -> Fut + Send + Sync,
    Fut: Future<Output = ToolOutput> + Send,
{
    async fn call(&self, _tool_name: &str, params: &[ToolParam]) -> ToolOutput {
        (self.0)(params.to_vec()).await
    }
}

/// Handle to one in-flight tool execution
#[derive(Debug)]
pub struct ToolTask {
    request_id: String,
    handle: JoinHandle<()>,
}

impl ToolTask {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait until the response has been queued
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!(request_id = %self.request_id, "Tool task failed: {}", e);
        }
    }
}

/// Registry of local tools plus their executor
pub struct ToolEngine {
    tools: RwLock<HashMap<String, Arc<dyn LocalTool>>>,
    outbound: OutboundSender,
}

impl ToolEngine {
    pub fn new(outbound: OutboundSender) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            outbound,
        }
    }

    pub async fn register_tool<T>(&self, name: impl Into<String>, tool: T) -> Result<()>
    where
        T: LocalTool + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(AgentError::InvalidArgument(
                "tool name must not be empty".to_string(),
            ));
        }

        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            return Err(AgentError::AlreadyExists(format!("tool '{name}'")));
        }
        debug!("Registered tool {}", name);
        tools.insert(name, Arc::new(tool));
        Ok(())
    }

    pub async fn unregister_tool(&self, name: &str) -> Result<()> {
        match self.tools.write().await.remove(name) {
            Some(_) => {
                debug!("Unregistered tool {}", name);
                Ok(())
            }
            None => Err(AgentError::NotFound(format!("tool '{name}'"))),
        }
    }

    /// Registered tool names, sorted
    pub async fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Hand `call` to a new task and return immediately
    ///
    /// The task queues exactly one `tool_response`, waiting for queue space
    /// as long as necessary. An unknown tool fails here with `NotFound` and no
    /// response is sent.
    pub async fn execute(&self, call: ToolCall) -> Result<ToolTask> {
        let tool = self
            .tools
            .read()
            .await
            .get(&call.tool_name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("tool '{}'", call.tool_name)))?;

        let request_id = call.request_id.clone();
        let outbound = self.outbound.clone();
        let handle = tokio::spawn(async move {
            info!(
                request_id = %call.request_id,
                tool = %call.tool_name,
                params = ?call.params,
                "Executing tool"
            );

            let output = match AssertUnwindSafe(tool.call(&call.tool_name, &call.params))
                .catch_unwind()
                .await
            {
                Ok(output) => output,
                Err(_) => {
                    error!(tool = %call.tool_name, "Tool panicked");
                    ToolOutput::failed()
                }
            };

            if output.status == ToolStatus::Error {
                warn!(
                    request_id = %call.request_id,
                    tool = %call.tool_name,
                    result = ?output.result,
                    "Tool reported an error"
                );
            }

            let response =
                encode_tool_response(&call.request_id, output.status, output.result.as_deref());
            if let Err(e) = outbound.queue_until_sent(Frame::Text(response)).await {
                error!(request_id = %call.request_id, "Failed to queue tool response: {}", e);
            }
        });

        Ok(ToolTask { request_id, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::outbound_queue;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    fn call(request_id: &str, tool_name: &str, params: Vec<ToolParam>) -> ToolCall {
        ToolCall {
            request_id: request_id.to_string(),
            tool_name: tool_name.to_string(),
            params,
        }
    }

    async fn next_json(rx: &mut mpsc::Receiver<Frame>) -> Value {
        match rx.recv().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    struct Volume;

    #[async_trait]
    impl LocalTool for Volume {
        async fn call(&self, _tool_name: &str, params: &[ToolParam]) -> ToolOutput {
            match find_param(params, "volume").and_then(ToolParam::as_int) {
                Some(v) if (0..=100).contains(&v) => ToolOutput::success(format!("volume set to {v}")),
                Some(v) => ToolOutput::error(format!("volume {v} out of range")),
                None => ToolOutput::failed(),
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let (tx, _rx) = outbound_queue(4);
        let engine = ToolEngine::new(tx);

        engine.register_tool("set_volume", Volume).await.unwrap();
        assert!(matches!(
            engine.register_tool("set_volume", Volume).await,
            Err(AgentError::AlreadyExists(_))
        ));
        assert!(matches!(
            engine.register_tool("", Volume).await,
            Err(AgentError::InvalidArgument(_))
        ));
        assert_eq!(engine.tool_names().await, vec!["set_volume".to_string()]);

        engine.unregister_tool("set_volume").await.unwrap();
        assert!(matches!(
            engine.unregister_tool("set_volume").await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let (tx, mut rx) = outbound_queue(4);
        let engine = ToolEngine::new(tx);
        let result = engine
            .execute(call(
                "r1",
                "set_volume",
                vec![ToolParam::new("volume", ToolParamValue::Int(42))],
            ))
            .await;
        assert!(matches!(result, Err(AgentError::NotFound(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_execute_sends_one_response() {
        let (tx, mut rx) = outbound_queue(4);
        let engine = ToolEngine::new(tx);
        engine.register_tool("set_volume", Volume).await.unwrap();

        let task = engine
            .execute(call(
                "r1",
                "set_volume",
                vec![ToolParam::new("volume", ToolParamValue::Int(42))],
            ))
            .await
            .unwrap();
        assert_eq!(task.request_id(), "r1");
        task.wait().await;

        assert_eq!(
            next_json(&mut rx).await,
            json!({
                "type": "tool_response",
                "content_type": {"type": "json"},
                "content": {"request_id": "r1", "result": {"status": "success", "result": "volume set to 42"}}
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_status_keeps_result() {
        let (tx, mut rx) = outbound_queue(4);
        let engine = ToolEngine::new(tx);
        engine.register_tool("set_volume", Volume).await.unwrap();

        engine
            .execute(call(
                "r2",
                "set_volume",
                vec![ToolParam::new("volume", ToolParamValue::Int(400))],
            ))
            .await
            .unwrap()
            .wait()
            .await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["content"]["result"]["status"], "error");
        assert_eq!(response["content"]["result"]["result"], "volume 400 out of range");

        engine
            .execute(call("r3", "set_volume", vec![]))
            .await
            .unwrap()
            .wait()
            .await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["content"]["result"], json!({"status": "error"}));
    }

    #[tokio::test]
    async fn test_panicking_tool_still_answers() {
        let (tx, mut rx) = outbound_queue(4);
        let engine = ToolEngine::new(tx);
        struct Exploding;

        #[async_trait]
        impl LocalTool for Exploding {
            async fn call(&self, _tool_name: &str, _params: &[ToolParam]) -> ToolOutput {
                panic!("tool bug")
            }
        }

        engine.register_tool("explode", Exploding).await.unwrap();

        engine
            .execute(call("r9", "explode", vec![]))
            .await
            .unwrap()
            .wait()
            .await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["content"]["request_id"], "r9");
        assert_eq!(response["content"]["result"]["status"], "error");
    }

    #[tokio::test]
    async fn test_execute_does_not_wait_for_tool() {
        let (tx, mut rx) = outbound_queue(4);
        let engine = ToolEngine::new(tx);
        let gate = Arc::new(Notify::new());
        let tool_gate = Arc::clone(&gate);
        engine
            .register_tool(
                "slow",
                tool_fn(move |params| {
                    let gate = Arc::clone(&tool_gate);
                    async move {
                        gate.notified().await;
                        ToolOutput::success(format!("{} params", params.len()))
                    }
                }),
            )
            .await
            .unwrap();

        let task = engine
            .execute(call(
                "r5",
                "slow",
                vec![
                    ToolParam::new("a", ToolParamValue::Str("x".into())),
                    ToolParam::new("b", ToolParamValue::Bool(false)),
                ],
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert!(rx.try_recv().is_err());

        gate.notify_one();
        task.wait().await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["content"]["result"]["result"], "2 params");
    }

    #[tokio::test]
    async fn test_response_waits_for_queue_space() {
        let (tx, mut rx) = outbound_queue(1);
        let engine = ToolEngine::new(tx.clone());
        engine
            .register_tool("noop", tool_fn(|_| async { ToolOutput::empty() }))
            .await
            .unwrap();

        tx.queue(Frame::Text("filler".into()), Duration::from_millis(5))
            .await
            .unwrap();
        let task = engine.execute(call("r7", "noop", vec![])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        assert_eq!(rx.recv().await, Some(Frame::Text("filler".into())));
        task.wait().await;
        let response = next_json(&mut rx).await;
        assert_eq!(response["content"]["result"], json!({"status": "success"}));
    }

    #[test]
    fn test_param_accessors() {
        let params = vec![
            ToolParam::new("task", ToolParamValue::Str("water plants".into())),
            ToolParam::new("timeout", ToolParamValue::Int(30)),
            ToolParam::new("loud", ToolParamValue::Bool(true)),
        ];
        let task = find_param(&params, "task").unwrap();
        assert_eq!(task.param_type(), ToolParamType::Str);
        assert_eq!(task.as_str(), Some("water plants"));
        assert_eq!(task.as_int(), None);
        assert_eq!(find_param(&params, "timeout").unwrap().as_int(), Some(30));
        assert_eq!(find_param(&params, "loud").unwrap().as_bool(), Some(true));
        assert!(find_param(&params, "missing").is_none());
    }
}
