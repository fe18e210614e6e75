use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub query: String,
    pub answer: String,
    pub at: DateTime<Utc>,
}

/// Recent question/answer pairs per session.
///
/// Each session is a ring buffer of at most `max_exchanges`; the oldest exchange is dropped
/// first. When more than `max_sessions` are live, the session idle the longest is dropped.
pub struct ConversationMemory {
    sessions: DashMap<String, Session>,
    clock: AtomicU64,
    max_exchanges: usize,
    max_sessions: usize,
}

#[derive(Default)]
struct Session {
    exchanges: VecDeque<Exchange>,
    touched: u64,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(10, 10_000)
    }
}

impl ConversationMemory {
    pub fn new(max_exchanges: usize, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            clock: AtomicU64::new(0),
            max_exchanges: max_exchanges.max(1),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn record(&self, session_id: &str, query: &str, answer: &str) {
        if !self.sessions.contains_key(session_id) && self.sessions.len() >= self.max_sessions {
            self.evict_idle_session();
        }

        let mut session = self.sessions.entry(session_id.to_string()).or_default();
        session.touched = self.clock.fetch_add(1, Ordering::Relaxed);
        if session.exchanges.len() >= self.max_exchanges {
            session.exchanges.pop_front();
        }
        session.exchanges.push_back(Exchange {
            query: query.to_string(),
            answer: answer.to_string(),
            at: Utc::now(),
        });
    }

    /// Up to `n` most recent exchanges, oldest first.
    pub fn recent(&self, session_id: &str, n: usize) -> Vec<Exchange> {
        self.sessions
            .get(session_id)
            .map(|session| {
                let skip = session.exchanges.len().saturating_sub(n);
                session.exchanges.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn history(&self, session_id: &str) -> Vec<Exchange> {
        self.recent(session_id, self.max_exchanges)
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn evict_idle_session(&self) {
        // Collect first so no shard lock is held during removal
        let idle = self
            .sessions
            .iter()
            .min_by_key(|entry| entry.value().touched)
            .map(|entry| entry.key().clone());

        if let Some(session_id) = idle {
            self.sessions.remove(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let memory = ConversationMemory::new(3, 10);
        for i in 0..5 {
            memory.record("s1", &format!("q{}", i), &format!("a{}", i));
        }

        let history = memory.history("s1");
        let queries: Vec<&str> = history.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["q2", "q3", "q4"]);

        let recent = memory.recent("s1", 2);
        assert_eq!(recent[0].query, "q3");
        assert!(memory.history("unknown").is_empty());
    }

    #[test]
    fn test_idle_session_evicted() {
        let memory = ConversationMemory::new(5, 2);
        memory.record("a", "q", "a");
        memory.record("b", "q", "a");
        memory.record("a", "q2", "a2");
        memory.record("c", "q", "a");

        assert_eq!(memory.session_count(), 2);
        assert!(memory.history("b").is_empty());
        assert_eq!(memory.history("a").len(), 2);
    }
}
