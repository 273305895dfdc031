//! Bridge between a validated request and the agent backend.
//!
//! Builds the agent's execution state, runs it exactly once in the requested
//! mode, and converts agent failures into [`ServiceError`]s.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use parley_core::config::AgentConfig;
use parley_core::{
    ChatMessage, LogContext, MessageKind, Mode, Normalizer, Params, ServiceError, SyncReply,
    ThreadId,
};

use crate::agent::{Agent, AgentOutput, AgentState};
use crate::multiplexer::{self, StreamHandle, StreamSettings};

/// Keys the service sets itself and callers may not supply in `params`.
pub const RESERVED_PARAM_KEYS: [&str; 2] = ["thread_id", "model"];

/// Which models a caller may pick, and the fallback.
#[derive(Debug, Clone)]
pub struct ModelPolicy {
    pub default_model: String,
    pub available: Vec<String>,
}

impl ModelPolicy {
    pub fn select(&self, requested: Option<&str>) -> Result<String, ServiceError> {
        match requested {
            None => Ok(self.default_model.clone()),
            Some(model) if self.available.iter().any(|m| m == model) => Ok(model.to_string()),
            Some(model) => Err(ServiceError::Validation(format!(
                "unknown model '{}'",
                model
            ))),
        }
    }
}

impl From<&AgentConfig> for ModelPolicy {
    fn from(config: &AgentConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            available: config.available_models.clone(),
        }
    }
}

/// Per-call execution controls.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Cancelled when the service stops.
    pub cancel: CancellationToken,
    pub deadline: Option<Duration>,
    pub channel_capacity: usize,
    pub normalizer: Normalizer,
    pub log_context: LogContext,
}

/// Result of a successful [`InvocationAdapter::invoke`].
#[derive(Debug)]
pub enum Invocation {
    Reply(SyncReply),
    Stream(StreamHandle),
}

/// Runs one agent on behalf of the request coordinator.
#[derive(Clone)]
pub struct InvocationAdapter {
    agent: Arc<dyn Agent>,
    models: ModelPolicy,
}

impl InvocationAdapter {
    pub fn new(agent: Arc<dyn Agent>, models: ModelPolicy) -> Self {
        Self { agent, models }
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn models(&self) -> &ModelPolicy {
        &self.models
    }

    /// Build the agent's state for one run.
    ///
    /// Fails with a validation error, without touching the agent, when the
    /// message is empty, the model is unknown, or `params` uses a reserved key.
    pub fn build_state(
        &self,
        thread_id: ThreadId,
        run_id: Uuid,
        message: &str,
        params: Option<Params>,
        model: Option<&str>,
    ) -> Result<AgentState, ServiceError> {
        if message.trim().is_empty() {
            return Err(ServiceError::Validation("message is required".to_string()));
        }

        let params = params.unwrap_or_default();
        let mut reserved: Vec<&str> = RESERVED_PARAM_KEYS
            .iter()
            .copied()
            .filter(|key| params.contains_key(*key))
            .collect();
        reserved.sort_unstable();
        if !reserved.is_empty() {
            return Err(ServiceError::Validation(format!(
                "params cannot contain reserved keys: {}",
                reserved.join(", ")
            )));
        }

        let model = self.models.select(model)?;

        let mut configurable = params;
        configurable.insert(
            "thread_id".to_string(),
            Value::String(thread_id.as_str().to_string()),
        );
        configurable.insert("model".to_string(), Value::String(model));

        Ok(AgentState {
            thread_id,
            run_id,
            input: ChatMessage::human(message),
            configurable,
        })
    }

    /// Run the agent once in `mode`.
    pub async fn invoke(
        &self,
        state: AgentState,
        mode: Mode,
        ctx: InvocationContext,
    ) -> Result<Invocation, ServiceError> {
        debug!(
            thread_id = %state.thread_id,
            run_id = %state.run_id,
            mode = mode.as_str(),
            "Invoking agent"
        );
        match mode {
            Mode::Sync => self.invoke_sync(state, &ctx).await.map(Invocation::Reply),
            Mode::Stream => Ok(Invocation::Stream(self.invoke_stream(state, ctx))),
        }
    }

    async fn invoke_sync(
        &self,
        state: AgentState,
        ctx: &InvocationContext,
    ) -> Result<SyncReply, ServiceError> {
        let thread_id = state.thread_id.clone();
        let run_id = state.run_id;
        let run = self.agent.invoke(state);
        let expiry = async {
            match ctx.deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ServiceError::Cancelled),
            _ = expiry => {
                return Err(ServiceError::DeadlineExceeded(ctx.deadline.unwrap_or_default()))
            }
            result = run => result?,
        };

        collect_reply(output, thread_id, run_id)
    }

    fn invoke_stream(&self, state: AgentState, ctx: InvocationContext) -> StreamHandle {
        let thread_id = state.thread_id.clone();
        let run_id = state.run_id;
        let fragments = self.agent.stream(state);
        multiplexer::spawn(
            fragments,
            thread_id,
            run_id,
            StreamSettings {
                channel_capacity: ctx.channel_capacity,
                deadline: ctx.deadline,
                shutdown: ctx.cancel,
            },
            ctx.normalizer,
            ctx.log_context,
        )
    }
}

impl std::fmt::Debug for InvocationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationAdapter")
            .field("agent", &self.agent.info().key)
            .field("models", &self.models)
            .finish()
    }
}

/// Reply content is the last AI message; tool calls come from every AI message.
fn collect_reply(
    output: AgentOutput,
    thread_id: ThreadId,
    run_id: Uuid,
) -> Result<SyncReply, ServiceError> {
    let ai_messages: Vec<&ChatMessage> = output
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::Ai)
        .collect();
    let last = ai_messages.last().ok_or_else(|| {
        ServiceError::AgentExecution("agent run produced no AI message".to_string())
    })?;

    Ok(SyncReply {
        content: last.content.clone(),
        tool_calls: ai_messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().cloned())
            .collect(),
        thread_id,
        run_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedAgent, Step};
    use parley_core::{ErrorKind, EventTag, MemoryLogSink, ToolCall};
    use serde_json::json;

    fn policy() -> ModelPolicy {
        ModelPolicy {
            default_model: "gpt-4o-mini".to_string(),
            available: vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()],
        }
    }

    fn adapter(agent: Arc<ScriptedAgent>) -> InvocationAdapter {
        InvocationAdapter::new(agent, policy())
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            cancel: CancellationToken::new(),
            deadline: None,
            channel_capacity: 16,
            normalizer: Normalizer::new(Arc::new(MemoryLogSink::new())),
            log_context: LogContext::default(),
        }
    }

    fn params(value: Value) -> Option<Params> {
        value.as_object().cloned()
    }

    #[test]
    fn test_build_state_merges_configurable() {
        let a = adapter(Arc::new(ScriptedAgent::reply("ok")));
        let thread = ThreadId::parse("t-1").unwrap();
        let state = a
            .build_state(
                thread,
                Uuid::new_v4(),
                "hi",
                params(json!({"temperature": 0.2})),
                Some("gpt-4o"),
            )
            .unwrap();

        assert_eq!(state.configurable["thread_id"], json!("t-1"));
        assert_eq!(state.configurable["model"], json!("gpt-4o"));
        assert_eq!(state.configurable["temperature"], json!(0.2));
        assert_eq!(state.input.content, "hi");
    }

    #[test]
    fn test_build_state_defaults_model() {
        let a = adapter(Arc::new(ScriptedAgent::reply("ok")));
        let state = a
            .build_state(ThreadId::generate(), Uuid::new_v4(), "hi", None, None)
            .unwrap();
        assert_eq!(state.model(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let a = adapter(Arc::new(ScriptedAgent::reply("ok")));
        let err = a
            .build_state(
                ThreadId::generate(),
                Uuid::new_v4(),
                "hi",
                params(json!({"model": "x", "thread_id": "y"})),
                None,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(
            err.public_message(),
            "params cannot contain reserved keys: model, thread_id"
        );
    }

    #[test]
    fn test_empty_message_rejected() {
        let a = adapter(Arc::new(ScriptedAgent::reply("ok")));
        for message in ["", "   "] {
            let err = a
                .build_state(ThreadId::generate(), Uuid::new_v4(), message, None, None)
                .unwrap_err();
            assert_eq!(err.public_message(), "message is required");
        }
    }

    #[test]
    fn test_unknown_model_rejected() {
        let a = adapter(Arc::new(ScriptedAgent::reply("ok")));
        let err = a
            .build_state(ThreadId::generate(), Uuid::new_v4(), "hi", None, Some("gpt-2"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_sync_invoke_runs_agent_once() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            Step::Tool(ToolCall::new("c1", "search", json!({}))),
            Step::Token("Hello".to_string()),
        ]));
        let a = adapter(agent.clone());
        let thread = ThreadId::parse("t-9").unwrap();
        let state = a
            .build_state(thread.clone(), Uuid::new_v4(), "hi", None, None)
            .unwrap();

        let Invocation::Reply(reply) = a.invoke(state, Mode::Sync, ctx()).await.unwrap() else {
            panic!("expected a reply");
        };
        assert_eq!(reply.content, "Hello");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.thread_id, thread);
        assert_eq!(agent.invocations(), 1);
    }

    #[tokio::test]
    async fn test_sync_failure_is_agent_execution() {
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Fail("provider 500".into())]));
        let a = adapter(agent);
        let state = a
            .build_state(ThreadId::generate(), Uuid::new_v4(), "hi", None, None)
            .unwrap();
        let err = a.invoke(state, Mode::Sync, ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentExecutionError);
        assert!(err.cause().unwrap().contains("provider 500"));
    }

    #[tokio::test]
    async fn test_sync_deadline() {
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Hang]));
        let a = adapter(agent);
        let state = a
            .build_state(ThreadId::generate(), Uuid::new_v4(), "hi", None, None)
            .unwrap();
        let mut c = ctx();
        c.deadline = Some(Duration::from_millis(50));
        let err = a.invoke(state, Mode::Sync, c).await.unwrap_err();
        assert!(matches!(err, ServiceError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_sync_cancelled() {
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Hang]));
        let a = adapter(agent);
        let state = a
            .build_state(ThreadId::generate(), Uuid::new_v4(), "hi", None, None)
            .unwrap();
        let c = ctx();
        c.cancel.cancel();
        let err = a.invoke(state, Mode::Sync, c).await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_invoke_delegates_to_multiplexer() {
        let agent = Arc::new(ScriptedAgent::reply("a b"));
        let a = adapter(agent.clone());
        let state = a
            .build_state(ThreadId::generate(), Uuid::new_v4(), "hi", None, None)
            .unwrap();

        let Invocation::Stream(mut handle) = a.invoke(state, Mode::Stream, ctx()).await.unwrap()
        else {
            panic!("expected a stream");
        };
        let mut tags = Vec::new();
        while let Some(event) = handle.events.recv().await {
            tags.push(event.tag());
        }
        assert_eq!(
            tags,
            vec![EventTag::Start, EventTag::Token, EventTag::Token, EventTag::End]
        );
        assert_eq!(agent.invocations(), 1);
    }

    #[test]
    fn test_collect_reply_without_ai_message_fails() {
        let output = AgentOutput {
            messages: vec![ChatMessage::tool("c1", "ok")],
        };
        let err = collect_reply(output, ThreadId::generate(), Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentExecutionError);
    }
}
