//! Built-in agent that answers by repeating the caller.
//!
//! Useful as the default backend for local runs and smoke tests: it keeps
//! per-thread history, honors streaming, and never calls out to a model.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use parley_core::{AgentInfo, ChatMessage, ThreadId};

use crate::agent::{Agent, AgentOutput, AgentState, Fragment, FragmentStream};
use crate::error::AgentError;
use crate::threads::MemoryThreadStore;

/// Agent that replies with "You said: <message>".
#[derive(Debug, Default)]
pub struct EchoAgent {
    store: Arc<MemoryThreadStore>,
    token_delay: Duration,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between streamed tokens.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    fn reply_for(input: &ChatMessage) -> String {
        format!("You said: {}", input.content)
    }
}

struct EchoRun {
    tokens: VecDeque<String>,
    delay: Duration,
    store: Arc<MemoryThreadStore>,
    thread_id: ThreadId,
    turn: Option<[ChatMessage; 2]>,
}

#[async_trait]
impl Agent for EchoAgent {
    fn info(&self) -> AgentInfo {
        AgentInfo {
            key: "echo".to_string(),
            description: "Repeats the message back, one word at a time".to_string(),
        }
    }

    async fn invoke(&self, state: AgentState) -> Result<AgentOutput, AgentError> {
        let reply = ChatMessage::ai(Self::reply_for(&state.input));
        self.store
            .append(&state.thread_id, [state.input, reply.clone()])?;
        Ok(AgentOutput {
            messages: vec![reply],
        })
    }

    fn stream(&self, state: AgentState) -> FragmentStream {
        let reply = Self::reply_for(&state.input);
        let run = EchoRun {
            tokens: reply.split_inclusive(' ').map(str::to_string).collect(),
            delay: self.token_delay,
            store: self.store.clone(),
            thread_id: state.thread_id,
            turn: Some([state.input, ChatMessage::ai(reply)]),
        };

        futures::stream::unfold(run, |mut run| async move {
            if let Some(token) = run.tokens.pop_front() {
                if !run.delay.is_zero() {
                    tokio::time::sleep(run.delay).await;
                }
                return Some((Ok(Fragment::Token(token)), run));
            }
            // History is only committed once every token was consumed.
            let turn = run.turn.take()?;
            match run.store.append(&run.thread_id, turn) {
                Ok(()) => None,
                Err(e) => Some((Err(e), run)),
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
