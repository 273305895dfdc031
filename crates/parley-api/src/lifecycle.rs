//! Request lifecycle coordination for `/inference`.
//!
//! The [`Coordinator`] validates the request, resolves the thread, runs the
//! agent through the invocation adapter in the requested mode, and makes sure
//! exactly one completion record is written however the request ends.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use parley_agent::{
    Invocation, InvocationAdapter, InvocationContext, StreamHandle, StreamOutcome,
};
use parley_core::config::{RequestConfig, StreamConfig};
use parley_core::sink::best_effort;
use parley_core::{
    thread, ErrorKind, InboundRequest, LogContext, LogLevel, LogRecord, LogSink, Mode,
    NormalizedError, Normalizer, ResponseEvent, ServiceError, SyncReply,
};

/// Log target for completion records.
pub const COMPLETION_TARGET: &str = "parley::lifecycle";

/// What a successful call produced.
#[derive(Debug)]
pub enum Outcome {
    Reply(SyncReply),
    Stream(EventStream),
}

/// Events of one streamed response.
///
/// Dropping it (for example when the client disconnects) releases the run.
#[derive(Debug)]
pub struct EventStream {
    events: mpsc::Receiver<ResponseEvent>,
    _release_on_drop: DropGuard,
}

impl Stream for EventStream {
    type Item = ResponseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Drives one `/inference` call from validation to completion record.
#[derive(Debug, Clone)]
pub struct Coordinator {
    adapter: InvocationAdapter,
    normalizer: Normalizer,
    request: RequestConfig,
    stream: StreamConfig,
    shutdown: CancellationToken,
    supervisors: TaskTracker,
}

impl Coordinator {
    pub fn new(
        adapter: InvocationAdapter,
        normalizer: Normalizer,
        request: RequestConfig,
        stream: StreamConfig,
    ) -> Self {
        Self {
            adapter,
            normalizer,
            request,
            stream,
            shutdown: CancellationToken::new(),
            supervisors: TaskTracker::new(),
        }
    }

    /// Cancel in-flight runs when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn adapter(&self) -> &InvocationAdapter {
        &self.adapter
    }

    /// Tasks that write completion records for streamed responses.
    ///
    /// `close()` and `wait()` on it before flushing the log sink at shutdown.
    pub fn supervisors(&self) -> &TaskTracker {
        &self.supervisors
    }

    pub async fn handle(&self, request: InboundRequest) -> Result<Outcome, NormalizedError> {
        let mode = if request.stream {
            Mode::Stream
        } else {
            Mode::Sync
        };
        let mut context = LogContext::for_request(Uuid::new_v4());
        let mut completion = Completion::new(self.normalizer.sink().clone(), mode, context.clone());

        if let Err(err) = self.validate_shape(&request) {
            return Err(completion.fail(&self.normalizer, err));
        }

        let thread_id = thread::resolve(request.thread_id.as_deref());
        let run_id = Uuid::new_v4();
        context.thread_id = Some(thread_id.to_string());
        context.run_id = Some(run_id);
        completion.context = context.clone();

        let state = match self.adapter.build_state(
            thread_id,
            run_id,
            &request.message,
            request.params,
            request.model.as_deref(),
        ) {
            Ok(state) => state,
            Err(err) => return Err(completion.fail(&self.normalizer, err)),
        };

        let ctx = InvocationContext {
            cancel: self.shutdown.child_token(),
            deadline: self.request.deadline(),
            channel_capacity: self.stream.channel_capacity,
            normalizer: self.normalizer.clone(),
            log_context: context,
        };

        match self.adapter.invoke(state, mode, ctx).await {
            Ok(Invocation::Reply(reply)) => {
                completion.finish("completed", None, None);
                Ok(Outcome::Reply(reply))
            }
            Ok(Invocation::Stream(handle)) => Ok(Outcome::Stream(self.supervise(handle, completion))),
            Err(err) => Err(completion.fail(&self.normalizer, err)),
        }
    }

    /// Reject a body that could not be decoded at all.
    pub fn reject_malformed(&self, detail: impl Into<String>) -> NormalizedError {
        let completion = Completion::new(
            self.normalizer.sink().clone(),
            Mode::Sync,
            LogContext::for_request(Uuid::new_v4()),
        );
        completion.fail(&self.normalizer, ServiceError::Validation(detail.into()))
    }

    fn validate_shape(&self, request: &InboundRequest) -> Result<(), ServiceError> {
        let max = self.request.max_message_chars;
        if max > 0 && request.message.chars().count() > max {
            return Err(ServiceError::Validation(format!(
                "message exceeds maximum length of {} characters",
                max
            )));
        }
        Ok(())
    }

    /// Watch the driver task and write the completion record when it ends.
    ///
    /// Once the consumer leaves or the service stops, the driver gets
    /// `cancel_grace_ms` to finish before it is aborted.
    fn supervise(&self, handle: StreamHandle, completion: Completion) -> EventStream {
        let StreamHandle {
            events,
            mut report,
            shutdown,
        } = handle;
        let grace = Duration::from_millis(self.stream.cancel_grace_ms);
        let release = shutdown.child_token();
        let watched = release.clone();

        self.supervisors.spawn(async move {
            let joined = tokio::select! {
                joined = &mut report => joined,
                _ = watched.cancelled() => {
                    match tokio::time::timeout(grace, &mut report).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            report.abort();
                            warn!(
                                run_id = ?completion.context.run_id,
                                "Stream driver did not stop within {:?}, aborted",
                                grace
                            );
                            completion.finish("cancelled", None, None);
                            return;
                        }
                    }
                }
            };

            match joined {
                Ok(report) => {
                    let error_kind = match report.outcome {
                        StreamOutcome::Failed(kind) => Some(kind),
                        StreamOutcome::DeadlineExceeded => Some(ErrorKind::AgentExecutionError),
                        StreamOutcome::Completed | StreamOutcome::Cancelled => None,
                    };
                    completion.finish(report.outcome.as_str(), error_kind, Some(report.fragments));
                }
                Err(e) => {
                    warn!(error = %e, "Stream driver task failed");
                    completion.finish("failed", Some(ErrorKind::InternalError), None);
                }
            }
        });

        EventStream {
            events,
            _release_on_drop: release.drop_guard(),
        }
    }
}

/// Writes the single completion record of a request.
///
/// If it is dropped unfinished, the request was abandoned (for example the
/// client went away during a sync call) and it records a cancellation.
struct Completion {
    sink: Arc<dyn LogSink>,
    mode: Mode,
    context: LogContext,
    started: Instant,
    done: bool,
}

impl Completion {
    fn new(sink: Arc<dyn LogSink>, mode: Mode, context: LogContext) -> Self {
        Self {
            sink,
            mode,
            context,
            started: Instant::now(),
            done: false,
        }
    }

    fn fail(mut self, normalizer: &Normalizer, err: ServiceError) -> NormalizedError {
        let normalized = normalizer.normalize(&err, &self.context);
        let outcome = match err {
            ServiceError::Validation(_) | ServiceError::Authentication(_) => "rejected",
            ServiceError::DeadlineExceeded(_) => "deadline_exceeded",
            ServiceError::Cancelled => "cancelled",
            ServiceError::AgentExecution(_) | ServiceError::Internal(_) => "failed",
        };
        self.record(outcome, Some(normalized.error_kind), None);
        normalized
    }

    fn finish(mut self, outcome: &str, error_kind: Option<ErrorKind>, fragments: Option<u64>) {
        self.record(outcome, error_kind, fragments);
    }

    fn record(&mut self, outcome: &str, error_kind: Option<ErrorKind>, fragments: Option<u64>) {
        if self.done {
            return;
        }
        self.done = true;

        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            request_id = ?self.context.request_id,
            thread_id = ?self.context.thread_id,
            mode = self.mode.as_str(),
            outcome,
            duration_ms,
            "Request completed"
        );

        let mut context = self.context.clone();
        context.extra = Some(json!({
            "mode": self.mode.as_str(),
            "outcome": outcome,
            "error_kind": error_kind.map(|k| k.as_str()),
            "fragments": fragments,
            "duration_ms": duration_ms,
        }));
        let level = if error_kind.is_some() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        best_effort(
            self.sink.as_ref(),
            LogRecord::new(level, COMPLETION_TARGET, format!("request {}", outcome))
                .with_context(context),
        );
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.record("cancelled", None, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_agent::{ModelPolicy, ScriptedAgent, Step};
    use parley_core::{EventTag, MemoryLogSink};
    use tokio_stream::StreamExt;

    fn coordinator(agent: Arc<ScriptedAgent>, sink: Arc<MemoryLogSink>) -> Coordinator {
        let policy = ModelPolicy {
            default_model: "gpt-4o-mini".to_string(),
            available: vec!["gpt-4o-mini".to_string()],
        };
        Coordinator::new(
            InvocationAdapter::new(agent, policy),
            Normalizer::new(sink),
            RequestConfig::default(),
            StreamConfig::default(),
        )
    }

    fn completions(sink: &MemoryLogSink) -> Vec<LogRecord> {
        sink.records()
            .into_iter()
            .filter(|r| r.target == COMPLETION_TARGET)
            .collect()
    }

    #[tokio::test]
    async fn test_sync_success_writes_one_completion() {
        let agent = Arc::new(ScriptedAgent::reply("Hi there"));
        let sink = Arc::new(MemoryLogSink::new());
        let c = coordinator(agent.clone(), sink.clone());

        let outcome = c.handle(InboundRequest::new("Hello")).await.unwrap();
        let Outcome::Reply(reply) = outcome else {
            panic!("expected reply");
        };
        assert_eq!(reply.content, "Hi there");
        assert!(reply.tool_calls.is_empty());

        let records = completions(&sink);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "request completed");
        assert_eq!(
            records[0].context.thread_id.as_deref(),
            Some(reply.thread_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_validation_failure_skips_agent() {
        let agent = Arc::new(ScriptedAgent::reply("x"));
        let sink = Arc::new(MemoryLogSink::new());
        let c = coordinator(agent.clone(), sink.clone());

        let err = c.handle(InboundRequest::new("")).await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::ValidationError);
        assert_eq!(err.message, "message is required");
        assert_eq!(agent.invocations(), 0);

        let records = completions(&sink);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "request rejected");
    }

    #[tokio::test]
    async fn test_message_length_limit() {
        let agent = Arc::new(ScriptedAgent::reply("x"));
        let sink = Arc::new(MemoryLogSink::new());
        let mut c = coordinator(agent.clone(), sink);
        c.request.max_message_chars = 5;

        let err = c.handle(InboundRequest::new("too long")).await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::ValidationError);
        assert_eq!(agent.invocations(), 0);
    }

    #[tokio::test]
    async fn test_agent_failure_is_sanitized() {
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Fail("key sk-123 revoked".into())]));
        let sink = Arc::new(MemoryLogSink::new());
        let c = coordinator(agent, sink.clone());

        let err = c.handle(InboundRequest::new("hi")).await.unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::AgentExecutionError);
        assert!(!err.message.contains("sk-123"));
        assert_eq!(completions(&sink)[0].message, "request failed");
    }

    #[tokio::test]
    async fn test_stream_completion_recorded_after_drain() {
        let agent = Arc::new(ScriptedAgent::reply("a b"));
        let sink = Arc::new(MemoryLogSink::new());
        let c = coordinator(agent, sink.clone());

        let Outcome::Stream(stream) = c
            .handle(InboundRequest::new("hi").streaming())
            .await
            .unwrap()
        else {
            panic!("expected stream");
        };
        let tags: Vec<EventTag> = stream.map(|e| e.tag()).collect().await;
        assert_eq!(tags.first(), Some(&EventTag::Start));
        assert_eq!(tags.last(), Some(&EventTag::End));

        for _ in 0..50 {
            if !completions(&sink).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = completions(&sink);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "request completed");
    }

    #[tokio::test]
    async fn test_abandoned_sync_call_records_cancellation() {
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Hang]));
        let sink = Arc::new(MemoryLogSink::new());
        let c = coordinator(agent, sink.clone());

        let call = c.handle(InboundRequest::new("hi"));
        let timed_out = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(timed_out.is_err());

        let records = completions(&sink);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "request cancelled");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_sync_run() {
        let agent = Arc::new(ScriptedAgent::new(vec![Step::Hang]));
        let sink = Arc::new(MemoryLogSink::new());
        let shutdown = CancellationToken::new();
        let c = coordinator(agent, sink.clone()).with_shutdown(shutdown.clone());

        let task = tokio::spawn(async move { c.handle(InboundRequest::new("hi")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.message, "request cancelled");
        assert_eq!(completions(&sink)[0].message, "request cancelled");
    }

    #[tokio::test]
    async fn test_shutdown_mid_stream_sends_error_and_records_completion() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            Step::Token("a".to_string()),
            Step::Hang,
        ]));
        let sink = Arc::new(MemoryLogSink::new());
        let shutdown = CancellationToken::new();
        let c = coordinator(agent.clone(), sink.clone()).with_shutdown(shutdown.clone());

        let Outcome::Stream(mut stream) = c
            .handle(InboundRequest::new("hi").streaming())
            .await
            .unwrap()
        else {
            panic!("expected stream");
        };
        assert_eq!(stream.next().await.unwrap().tag(), EventTag::Start);
        assert_eq!(stream.next().await.unwrap().tag(), EventTag::Token);

        shutdown.cancel();
        let last = stream.next().await.unwrap();
        assert_eq!(last.tag(), EventTag::Error);
        assert!(stream.next().await.is_none());

        c.supervisors().close();
        c.supervisors().wait().await;

        let records = completions(&sink);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "request cancelled");
        assert_eq!(agent.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_supervisors_finish_before_tracker_wait_returns() {
        let agent = Arc::new(ScriptedAgent::reply("a b c"));
        let sink = Arc::new(MemoryLogSink::new());
        let c = coordinator(agent, sink.clone());

        let Outcome::Stream(stream) = c
            .handle(InboundRequest::new("hi").streaming())
            .await
            .unwrap()
        else {
            panic!("expected stream");
        };
        drop(stream);

        c.supervisors().close();
        c.supervisors().wait().await;
        assert_eq!(completions(&sink).len(), 1);
    }
}
