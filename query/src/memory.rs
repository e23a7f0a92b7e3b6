use fisiorag_core::model::ChatMessage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use storage::{HistoryPage, Repository};
use tokio::sync::Mutex;

/// Conversational memory: a bounded in-process L1 of recent turns per
/// session over the durable message log (L2). Reads hit L1 when warm and
/// hydrate from L2 otherwise; writes go to L2 first, then refresh L1.
pub struct SessionMemory {
    repo: Arc<Repository>,
    sessions: Mutex<Vec<SessionEntry>>,
    max_sessions: usize,
    turns_per_session: usize,
}

struct SessionEntry {
    session_id: String,
    messages: VecDeque<ChatMessage>,
    last_accessed: Instant,
}

impl SessionMemory {
    pub fn new(repo: Arc<Repository>, max_sessions: usize, turns_per_session: usize) -> Self {
        Self {
            repo,
            sessions: Mutex::new(Vec::new()),
            max_sessions: max_sessions.max(1),
            turns_per_session: turns_per_session.max(1),
        }
    }

    /// The most recent `limit` messages of a session, oldest first.
    pub async fn recent(&self, session_id: &str, limit: usize) -> Vec<ChatMessage> {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(entry) = sessions
                .iter_mut()
                .find(|entry| entry.session_id == session_id)
            {
                entry.last_accessed = Instant::now();
                let skip = entry.messages.len().saturating_sub(limit);
                return entry.messages.iter().skip(skip).cloned().collect();
            }
        }

        // L1 miss: hydrate the window from the durable log.
        let hydrated = self
            .repo
            .recent_messages(session_id, self.turns_per_session)
            .await;

        let mut sessions = self.sessions.lock().await;
        if !sessions.iter().any(|entry| entry.session_id == session_id) {
            while sessions.len() >= self.max_sessions {
                evict_least_recent(&mut sessions);
            }
            sessions.push(SessionEntry {
                session_id: session_id.to_string(),
                messages: hydrated.iter().cloned().collect(),
                last_accessed: Instant::now(),
            });
        }

        let skip = hydrated.len().saturating_sub(limit);
        hydrated.into_iter().skip(skip).collect()
    }

    /// Refresh L1 after a successful L2 write. Sessions not resident in L1
    /// are left alone; the next read hydrates the full window.
    pub async fn record(&self, message: &ChatMessage) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions
            .iter_mut()
            .find(|entry| entry.session_id == message.session_id)
        {
            entry.messages.push_back(message.clone());
            while entry.messages.len() > self.turns_per_session {
                entry.messages.pop_front();
            }
            entry.last_accessed = Instant::now();
        }
    }

    /// Paged chronological history; L2 is authoritative for pagination.
    pub async fn get_history(&self, session_id: &str, limit: usize, offset: usize) -> HistoryPage {
        self.repo.session_history(session_id, limit, offset).await
    }
}

fn evict_least_recent(sessions: &mut Vec<SessionEntry>) {
    if sessions.is_empty() {
        return;
    }
    let mut oldest = 0;
    for (i, entry) in sessions.iter().enumerate() {
        if entry.last_accessed < sessions[oldest].last_accessed {
            oldest = i;
        }
    }
    sessions.remove(oldest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fisiorag_core::model::{message_idempotency_key, MessageRole};
    use tempfile::tempdir;

    async fn seeded_repo(dir: &tempfile::TempDir, session_id: &str, turns: usize) -> Arc<Repository> {
        let repo = Arc::new(
            Repository::open(dir.path().join("memory.wal"), 8)
                .await
                .unwrap(),
        );
        for turn in 0..turns {
            let content = format!("turno {turn}");
            let key = message_idempotency_key(session_id, turn as i64, &content);
            repo.append_message(ChatMessage::new(session_id, MessageRole::User, content, key))
                .await
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn hydrates_on_miss_and_serves_from_l1() {
        let dir = tempdir().unwrap();
        let repo = seeded_repo(&dir, "s-1", 4).await;
        let memory = SessionMemory::new(repo.clone(), 8, 10);

        let first = memory.recent("s-1", 10).await;
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].content, "turno 0");

        // A write bypassing the memory is invisible to the warm L1 window.
        let key = message_idempotency_key("s-1", 99, "fuori cache");
        repo.append_message(ChatMessage::new("s-1", MessageRole::User, "fuori cache", key))
            .await
            .unwrap();
        let second = memory.recent("s-1", 10).await;
        assert_eq!(second.len(), 4);
    }

    #[tokio::test]
    async fn record_appends_to_warm_sessions_and_bounds_window() {
        let dir = tempdir().unwrap();
        let repo = seeded_repo(&dir, "s-1", 2).await;
        let memory = SessionMemory::new(repo.clone(), 8, 3);

        memory.recent("s-1", 10).await; // warm the session

        for turn in 10..14 {
            let content = format!("turno {turn}");
            let key = message_idempotency_key("s-1", turn, &content);
            let appended = repo
                .append_message(ChatMessage::new("s-1", MessageRole::User, content, key))
                .await
                .unwrap();
            memory.record(&appended.message).await;
        }

        let window = memory.recent("s-1", 10).await;
        assert_eq!(window.len(), 3, "L1 window is bounded");
        assert_eq!(window.last().unwrap().content, "turno 13");
    }

    #[tokio::test]
    async fn evicts_least_recently_used_session() {
        let dir = tempdir().unwrap();
        let repo = seeded_repo(&dir, "s-1", 1).await;
        let memory = SessionMemory::new(repo, 2, 10);

        memory.recent("s-1", 10).await;
        memory.recent("s-2", 10).await;
        memory.recent("s-3", 10).await; // evicts s-1

        let sessions = memory.sessions.lock().await;
        assert_eq!(sessions.len(), 2);
        assert!(!sessions.iter().any(|entry| entry.session_id == "s-1"));
    }

    #[tokio::test]
    async fn unknown_session_history_is_empty() {
        let dir = tempdir().unwrap();
        let repo = seeded_repo(&dir, "s-1", 1).await;
        let memory = SessionMemory::new(repo, 8, 10);

        let page = memory.get_history("sconosciuta", 10, 0).await;
        assert_eq!(page.total, 0);
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
    }
}
