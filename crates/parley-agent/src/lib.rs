//! Parley agent crate - the agent contract and its invocation plumbing.
//!
//! - [`Agent`]: async trait every backend implements
//! - [`InvocationAdapter`]: builds agent state and runs it once, sync or streamed
//! - [`multiplexer`]: turns fragments into a sequenced, terminated event stream
//! - [`EchoAgent`] / [`ScriptedAgent`]: in-process agents for local runs and tests

pub mod adapter;
pub mod agent;
pub mod echo;
pub mod error;
pub mod multiplexer;
pub mod scripted;
pub mod threads;

pub use adapter::{Invocation, InvocationAdapter, InvocationContext, ModelPolicy};
pub use agent::{Agent, AgentOutput, AgentRegistry, AgentState, Fragment, FragmentStream};
pub use echo::EchoAgent;
pub use error::AgentError;
pub use multiplexer::{Multiplexer, StreamHandle, StreamOutcome, StreamReport, StreamSettings};
pub use scripted::{ScriptedAgent, Step};
pub use threads::MemoryThreadStore;
