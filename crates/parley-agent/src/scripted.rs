//! Deterministic agent driven by a fixed script.
//!
//! Records how often it was invoked and how many of its streams are still
//! alive, so callers can check that runs happen once and that abandoned
//! streams are released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use parley_core::{AgentInfo, ChatMessage, ThreadId, ToolCall};

use crate::agent::{Agent, AgentOutput, AgentState, Fragment, FragmentStream};
use crate::error::AgentError;
use crate::threads::MemoryThreadStore;

/// One scripted action.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Token(String),
    Tool(ToolCall),
    /// Fail the run with a model error carrying this detail.
    Fail(String),
    Delay(Duration),
    /// Never make progress again.
    Hang,
}

/// Agent that plays back a [`Step`] list on every run.
#[derive(Debug)]
pub struct ScriptedAgent {
    key: String,
    steps: Vec<Step>,
    invocations: AtomicUsize,
    live_streams: Arc<AtomicUsize>,
    store: MemoryThreadStore,
    last_state: Mutex<Option<AgentState>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            key: "scripted".to_string(),
            steps,
            invocations: AtomicUsize::new(0),
            live_streams: Arc::new(AtomicUsize::new(0)),
            store: MemoryThreadStore::new(),
            last_state: Mutex::new(None),
        }
    }

    /// Script that emits `text` split after each space.
    pub fn reply(text: &str) -> Self {
        Self::new(
            text.split_inclusive(' ')
                .map(|t| Step::Token(t.to_string()))
                .collect(),
        )
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Runs started through either `invoke` or `stream`.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Streams created and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    /// State passed to the most recent run.
    pub fn last_state(&self) -> Option<AgentState> {
        self.last_state.lock().ok().and_then(|s| s.clone())
    }

    fn begin(&self, state: &AgentState) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_state.lock() {
            *last = Some(state.clone());
        }
    }
}

/// Counts a stream as live until it is dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptRun {
    steps: VecDeque<Step>,
    _live: LiveGuard,
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn info(&self) -> AgentInfo {
        AgentInfo {
            key: self.key.clone(),
            description: "Plays back a fixed script".to_string(),
        }
    }

    async fn invoke(&self, state: AgentState) -> Result<AgentOutput, AgentError> {
        self.begin(&state);

        let mut messages = Vec::new();
        let mut content = String::new();
        for step in &self.steps {
            match step {
                Step::Token(token) => content.push_str(token),
                Step::Tool(call) => {
                    messages.push(ChatMessage::ai_with_tools("", vec![call.clone()]));
                    messages.push(ChatMessage::tool(call.id.clone(), "ok"));
                }
                Step::Fail(detail) => return Err(AgentError::Model(detail.clone())),
                Step::Delay(d) => tokio::time::sleep(*d).await,
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        messages.push(ChatMessage::ai(content));

        self.store.append(
            &state.thread_id,
            std::iter::once(state.input).chain(messages.iter().cloned()),
        )?;
        Ok(AgentOutput { messages })
    }

    fn stream(&self, state: AgentState) -> FragmentStream {
        self.begin(&state);
        let run = ScriptRun {
            steps: self.steps.iter().cloned().collect(),
            _live: LiveGuard::new(self.live_streams.clone()),
        };

        futures::stream::unfold(run, |mut run| async move {
            loop {
                match run.steps.pop_front()? {
                    Step::Token(token) => return Some((Ok(Fragment::Token(token)), run)),
                    Step::Tool(call) => return Some((Ok(Fragment::ToolInvocation(call)), run)),
                    Step::Fail(detail) => {
                        run.steps.clear();
                        return Some((Err(AgentError::Model(detail)), run));
                    }
                    Step::Delay(d) => tokio::time::sleep(d).await,
                    Step::Hang => std::future::pending::<()>().await,
                }
            }
        })
        .boxed()
    }

    async fn history(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>, AgentError> {
        self.store.messages(thread_id)
    }

    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<bool, AgentError> {
        self.store.remove(thread_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::Params;
    use serde_json::json;
    use uuid::Uuid;

    fn state() -> AgentState {
        AgentState {
            thread_id: ThreadId::generate(),
            run_id: Uuid::new_v4(),
            input: ChatMessage::human("go"),
            configurable: Params::new(),
        }
    }

    #[tokio::test]
    async fn test_invoke_collects_tokens_and_tools() {
        let agent = ScriptedAgent::new(vec![
            Step::Tool(ToolCall::new("c1", "search", json!({"q": "x"}))),
            Step::Token("Hel".to_string()),
            Step::Token("lo".to_string()),
        ]);
        let output = agent.invoke(state()).await.unwrap();

        assert_eq!(output.messages.len(), 3);
        assert_eq!(output.messages[0].tool_calls[0].name, "search");
        assert_eq!(output.messages[2].content, "Hello");
        assert_eq!(agent.invocations(), 1);
    }

    #[tokio::test]
    async fn test_invoke_failure() {
        let agent = ScriptedAgent::new(vec![Step::Fail("boom".to_string())]);
        let err = agent.invoke(state()).await.unwrap_err();
        assert!(matches!(err, AgentError::Model(ref d) if d == "boom"));
    }

    #[tokio::test]
    async fn test_stream_stops_after_failure() {
        let agent = ScriptedAgent::new(vec![
            Step::Token("a".to_string()),
            Step::Fail("boom".to_string()),
            Step::Token("never".to_string()),
        ]);
        let items: Vec<_> = agent.stream(state()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_live_stream_tracking() {
        let agent = ScriptedAgent::reply("a b c");
        let stream = agent.stream(state());
        assert_eq!(agent.live_streams(), 1);
        drop(stream);
        assert_eq!(agent.live_streams(), 0);
        assert_eq!(agent.invocations(), 1);
    }

    #[tokio::test]
    async fn test_last_state_recorded() {
        let agent = ScriptedAgent::reply("ok");
        let s = state();
        let thread = s.thread_id.clone();
        agent.invoke(s).await.unwrap();
        assert_eq!(agent.last_state().unwrap().thread_id, thread);
        assert_eq!(agent.history(&thread).await.unwrap().len(), 2);
    }
}
