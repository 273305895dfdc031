//! In-memory conversation storage keyed by thread.

use std::collections::HashMap;
use std::sync::Mutex;

use parley_core::{ChatMessage, ThreadId};

use crate::error::AgentError;

/// Per-thread message history held in process memory.
#[derive(Debug, Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<ThreadId, Vec<ChatMessage>>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed turn to a thread, creating it if needed.
    pub fn append(
        &self,
        thread_id: &ThreadId,
        messages: impl IntoIterator<Item = ChatMessage>,
    ) -> Result<(), AgentError> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|e| AgentError::ThreadStore(format!("thread lock poisoned: {}", e)))?;
        threads
            .entry(thread_id.clone())
            .or_default()
            .extend(messages);
        Ok(())
    }

    pub fn messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>, AgentError> {
        let threads = self
            .threads
            .lock()
            .map_err(|e| AgentError::ThreadStore(format!("thread lock poisoned: {}", e)))?;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    pub fn remove(&self, thread_id: &ThreadId) -> Result<bool, AgentError> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|e| AgentError::ThreadStore(format!("thread lock poisoned: {}", e)))?;
        Ok(threads.remove(thread_id).is_some())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let store = MemoryThreadStore::new();
        let thread = ThreadId::parse("t-1").unwrap();
        store
            .append(&thread, [ChatMessage::human("hi"), ChatMessage::ai("hello")])
            .unwrap();
        store.append(&thread, [ChatMessage::human("again")]).unwrap();

        let messages = store.messages(&thread).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "again");
    }

    #[test]
    fn test_unknown_thread_is_empty() {
        let store = MemoryThreadStore::new();
        assert!(store.messages(&ThreadId::generate()).unwrap().is_empty());
    }

    #[test]
    fn test_remove_reports_presence() {
        let store = MemoryThreadStore::new();
        let thread = ThreadId::parse("t-1").unwrap();
        store.append(&thread, [ChatMessage::human("hi")]).unwrap();

        assert!(store.remove(&thread).unwrap());
        assert!(!store.remove(&thread).unwrap());
        assert_eq!(store.thread_count(), 0);
    }
}
