//! Turns an agent's fragment stream into a well-formed event stream.
//!
//! [`Multiplexer`] is the pure state machine: it numbers events and refuses
//! to emit anything outside `Idle -> Open -> Emitting* -> Closed`. [`spawn`]
//! drives it from a task that also watches for shutdown, the deadline, and
//! the consumer going away. Only a vanished consumer ends a stream without a
//! terminal event.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use parley_core::{
    ErrorKind, EventBody, LogContext, NormalizedError, Normalizer, ResponseEvent, ServiceError,
    ThreadId,
};

use crate::agent::{Fragment, FragmentStream};

/// Lifecycle position of a [`Multiplexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    Open,
    Emitting,
    Closed,
}

/// Sequencer for one streamed response.
#[derive(Debug)]
pub struct Multiplexer {
    state: MuxState,
    next_seq: u64,
    thread_id: ThreadId,
    run_id: Uuid,
}

impl Multiplexer {
    pub fn new(thread_id: ThreadId, run_id: Uuid) -> Self {
        Self {
            state: MuxState::Idle,
            next_seq: 0,
            thread_id,
            run_id,
        }
    }

    pub fn state(&self) -> MuxState {
        self.state
    }

    /// `Idle -> Open`, producing `start`.
    pub fn open(&mut self) -> Option<ResponseEvent> {
        if self.state != MuxState::Idle {
            return None;
        }
        self.state = MuxState::Open;
        Some(self.emit(EventBody::Start {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id,
        }))
    }

    /// Map one fragment to a `token` or `tool` event.
    pub fn fragment(&mut self, fragment: Fragment) -> Option<ResponseEvent> {
        if !self.is_live() {
            return None;
        }
        self.state = MuxState::Emitting;
        let body = match fragment {
            Fragment::Token(content) => EventBody::Token { content },
            Fragment::ToolInvocation(call) => EventBody::Tool(call),
        };
        Some(self.emit(body))
    }

    /// Close normally with `end`.
    pub fn finish(&mut self) -> Option<ResponseEvent> {
        if !self.is_live() {
            return None;
        }
        self.state = MuxState::Closed;
        Some(self.emit(EventBody::End {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id,
        }))
    }

    /// Close with a terminal `error`.
    pub fn fail(&mut self, error: NormalizedError) -> Option<ResponseEvent> {
        if !self.is_live() {
            return None;
        }
        self.state = MuxState::Closed;
        Some(self.emit(EventBody::Error(error)))
    }

    /// Close without a terminal event. Used when nobody is listening.
    pub fn abandon(&mut self) {
        self.state = MuxState::Closed;
    }

    fn is_live(&self) -> bool {
        matches!(self.state, MuxState::Open | MuxState::Emitting)
    }

    fn emit(&mut self, body: EventBody) -> ResponseEvent {
        let event = ResponseEvent {
            seq: self.next_seq,
            body,
        };
        self.next_seq += 1;
        event
    }
}

/// How a driven stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(ErrorKind),
    DeadlineExceeded,
    Cancelled,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Failed(_) => "failed",
            StreamOutcome::DeadlineExceeded => "deadline_exceeded",
            StreamOutcome::Cancelled => "cancelled",
        }
    }
}

/// Final tally reported by the driver task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    /// `token` and `tool` events delivered to the consumer.
    pub fragments: u64,
}

/// Knobs for [`spawn`].
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub channel_capacity: usize,
    pub deadline: Option<Duration>,
    /// Cancelled when the service stops. The run ends with an `error` event.
    pub shutdown: CancellationToken,
}

/// Consumer side of a driven stream.
///
/// Dropping `events` is how a consumer leaves; the driver notices and
/// releases the agent stream.
#[derive(Debug)]
pub struct StreamHandle {
    pub events: mpsc::Receiver<ResponseEvent>,
    pub report: JoinHandle<StreamReport>,
    pub shutdown: CancellationToken,
}

/// Start a task that drives `fragments` through a fresh [`Multiplexer`].
///
/// Failures are normalized before they become an `error` event. The agent
/// stream is dropped as soon as the task stops, whatever the reason.
pub fn spawn(
    fragments: FragmentStream,
    thread_id: ThreadId,
    run_id: Uuid,
    settings: StreamSettings,
    normalizer: Normalizer,
    context: LogContext,
) -> StreamHandle {
    let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
    let shutdown = settings.shutdown.clone();
    let driver = Driver {
        mux: Multiplexer::new(thread_id, run_id),
        tx,
        shutdown: settings.shutdown,
        normalizer,
        context,
        fragments: 0,
    };
    let report = tokio::spawn(driver.run(fragments, settings.deadline));

    StreamHandle {
        events: rx,
        report,
        shutdown,
    }
}

struct Driver {
    mux: Multiplexer,
    tx: mpsc::Sender<ResponseEvent>,
    shutdown: CancellationToken,
    normalizer: Normalizer,
    context: LogContext,
    fragments: u64,
}

impl Driver {
    async fn run(mut self, mut fragments: FragmentStream, deadline: Option<Duration>) -> StreamReport {
        let Some(start) = self.mux.open() else {
            return self.report(StreamOutcome::Cancelled);
        };
        if !self.deliver(start).await {
            return self.abandon();
        }

        let expires_at = deadline.map(|d| Instant::now() + d);
        let expiry = async move {
            match expires_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                biased;
                _ = self.tx.closed() => return self.abandon(),
                _ = self.shutdown.cancelled() => {
                    drop(fragments);
                    self.terminate_with(&ServiceError::Cancelled).await;
                    return self.report(StreamOutcome::Cancelled);
                }
                _ = &mut expiry => {
                    drop(fragments);
                    let err = ServiceError::DeadlineExceeded(deadline.unwrap_or_default());
                    self.terminate_with(&err).await;
                    return self.report(StreamOutcome::DeadlineExceeded);
                }
                next = fragments.next() => match next {
                    Some(Ok(fragment)) => {
                        if let Some(event) = self.mux.fragment(fragment) {
                            if !self.deliver(event).await {
                                return self.abandon();
                            }
                            self.fragments += 1;
                        }
                    }
                    Some(Err(e)) => {
                        drop(fragments);
                        let err = ServiceError::from(e);
                        let kind = err.kind();
                        self.terminate_with(&err).await;
                        return self.report(StreamOutcome::Failed(kind));
                    }
                    None => {
                        if let Some(end) = self.mux.finish() {
                            if !self.deliver(end).await {
                                return self.report(StreamOutcome::Cancelled);
                            }
                        }
                        return self.report(StreamOutcome::Completed);
                    }
                },
            }
        }
    }

    /// Send one event. False means the consumer is gone.
    async fn deliver(&self, event: ResponseEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Best-effort terminal error. A vanished consumer is not an error here.
    async fn terminate_with(&mut self, err: &ServiceError) {
        let normalized = self.normalizer.normalize(err, &self.context);
        if let Some(event) = self.mux.fail(normalized) {
            if !self.deliver(event).await {
                debug!(run_id = ?self.context.run_id, "Terminal error event not delivered");
            }
        }
    }

    fn abandon(&mut self) -> StreamReport {
        self.mux.abandon();
        debug!(run_id = ?self.context.run_id, "Stream abandoned by consumer");
        self.report(StreamOutcome::Cancelled)
    }

    fn report(&self, outcome: StreamOutcome) -> StreamReport {
        StreamReport {
            outcome,
            fragments: self.fragments,
        }
    }
}
