//! Non-blocking front for a slow log sink.
//!
//! Request tasks hand records to a bounded channel and return immediately; a
//! dedicated writer thread drains the channel into the inner sink. When the
//! queue is full the record is rejected rather than blocking the request.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use parley_core::sink::{LogRecord, LogSink, SinkError};

/// A [`LogSink`] that queues records for a background writer thread.
pub struct QueuedLogSink {
    tx: Mutex<Option<SyncSender<LogRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedLogSink {
    /// Start a writer thread feeding `inner`, with room for `capacity` records.
    pub fn spawn(inner: Arc<dyn LogSink>, capacity: usize) -> Result<Self, SinkError> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let writer = std::thread::Builder::new()
            .name("parley-log-writer".to_string())
            .spawn(move || drain(rx, inner))
            .map_err(|e| SinkError::Unavailable(format!("failed to start log writer: {e}")))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Stop accepting records and wait until everything queued is written.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Log writer thread panicked");
            }
        }
    }
}

fn drain(rx: Receiver<LogRecord>, inner: Arc<dyn LogSink>) {
    debug!("Log writer started");
    for record in rx {
        if let Err(e) = inner.append(record) {
            // Reported through tracing only; the sink itself is what failed.
            warn!(error = %e, "Failed to persist log record");
        }
    }
    debug!("Log writer stopped");
}

impl LogSink for QueuedLogSink {
    fn append(&self, record: LogRecord) -> Result<(), SinkError> {
        let guard = self
            .tx
            .lock()
            .map_err(|e| SinkError::Write(format!("log queue lock poisoned: {e}")))?;
        let tx = guard
            .as_ref()
            .ok_or_else(|| SinkError::Unavailable("log queue is shut down".to_string()))?;
        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SinkError::QueueFull),
            Err(TrySendError::Disconnected(_)) => {
                Err(SinkError::Unavailable("log writer has stopped".to_string()))
            }
        }
    }
}

impl Drop for QueuedLogSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::sink::{LogLevel, MemoryLogSink};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn record(msg: &str) -> LogRecord {
        LogRecord::new(LogLevel::Info, "parley::test", msg)
    }

    #[test]
    fn test_records_reach_inner_sink_in_order() {
        let inner = Arc::new(MemoryLogSink::new());
        let queued = QueuedLogSink::spawn(inner.clone(), 16).unwrap();
        for i in 0..10 {
            queued.append(record(&format!("m{i}"))).unwrap();
        }
        queued.shutdown();

        let messages: Vec<String> = inner.records().into_iter().map(|r| r.message).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_append_after_shutdown_is_rejected() {
        let queued = QueuedLogSink::spawn(Arc::new(MemoryLogSink::new()), 4).unwrap();
        queued.shutdown();
        assert!(matches!(
            queued.append(record("late")),
            Err(SinkError::Unavailable(_))
        ));
    }

    #[test]
    fn test_inner_failures_do_not_stop_writer() {
        let queued = QueuedLogSink::spawn(Arc::new(MemoryLogSink::failing()), 4).unwrap();
        queued.append(record("a")).unwrap();
        queued.append(record("b")).unwrap();
        queued.shutdown();
    }

    /// Sink that blocks until released, to fill the queue deterministically.
    struct GateSink {
        open: AtomicBool,
        inner: MemoryLogSink,
    }

    impl LogSink for GateSink {
        fn append(&self, record: LogRecord) -> Result<(), SinkError> {
            while !self.open.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.inner.append(record)
        }
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let gate = Arc::new(GateSink {
            open: AtomicBool::new(false),
            inner: MemoryLogSink::new(),
        });
        let queued = QueuedLogSink::spawn(gate.clone(), 1).unwrap();

        let mut rejected = 0;
        for i in 0..10 {
            if let Err(SinkError::QueueFull) = queued.append(record(&format!("m{i}"))) {
                rejected += 1;
            }
        }
        assert!(rejected > 0);

        gate.open.store(true, Ordering::Release);
        queued.shutdown();
        assert_eq!(gate.inner.len() + rejected, 10);
    }
}
