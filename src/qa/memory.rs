//! 대화 메모리 - 세션별 최근 대화 턴
//!
//! 표현 연속성을 위한 것이며 검색에는 절대 사용되지 않습니다.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// 대화 한 턴
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(query: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// ConversationMemory
// ============================================================================

/// 최근 N턴 롤링 버퍼 (가득 차면 가장 오래된 턴부터 제거)
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl ConversationMemory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        if self.capacity == 0 {
            return;
        }
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// 최근 `n`턴 (오래된 순)
    pub fn recent(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

// ============================================================================
// SessionStore
// ============================================================================

/// 세션 ID → 메모리 매핑
///
/// 맵 자체는 짧게 잡는 std Mutex로 보호하고, 세션 메모리는 세션별 tokio Mutex로
/// 보호합니다. 같은 세션의 질의는 직렬화되고 다른 세션끼리는 서로 막지 않습니다.
///
/// 세션 수가 `max_sessions`에 도달하면 가장 오래 사용되지 않은 세션을 버립니다.
#[derive(Debug)]
pub struct SessionStore {
    sessions: StdMutex<SessionMap>,
    capacity: usize,
    max_sessions: usize,
}

#[derive(Debug, Default)]
struct SessionMap {
    entries: HashMap<String, SessionEntry>,
    /// 단조 증가 사용 시각
    clock: u64,
}

#[derive(Debug)]
struct SessionEntry {
    memory: Arc<Mutex<ConversationMemory>>,
    last_used: u64,
}

impl SessionStore {
    /// # Arguments
    /// * `capacity` - 세션당 보관할 턴 수
    /// * `max_sessions` - 동시에 유지할 최대 세션 수 (최소 1)
    pub fn new(capacity: usize, max_sessions: usize) -> Self {
        Self {
            sessions: StdMutex::new(SessionMap::default()),
            capacity,
            max_sessions: max_sessions.max(1),
        }
    }

    /// 세션 메모리 핸들 (없으면 생성)
    pub fn session(&self, session_id: &str) -> Arc<Mutex<ConversationMemory>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.clock += 1;
        let now = sessions.clock;

        if let Some(entry) = sessions.entries.get_mut(session_id) {
            entry.last_used = now;
            return Arc::clone(&entry.memory);
        }

        if sessions.entries.len() >= self.max_sessions {
            let oldest = sessions
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                sessions.entries.remove(&id);
                tracing::debug!("Session evicted (idle): {}", id);
            }
        }

        let memory = Arc::new(Mutex::new(ConversationMemory::with_capacity(self.capacity)));
        sessions.entries.insert(
            session_id.to_string(),
            SessionEntry {
                memory: Arc::clone(&memory),
                last_used: now,
            },
        );
        memory
    }

    /// 세션 종료: 메모리를 비우고 맵에서 제거
    ///
    /// 세션이 존재했으면 true
    pub async fn end_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .remove(session_id);

        match removed {
            Some(entry) => {
                entry.memory.lock().await.clear();
                tracing::debug!("Session ended: {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries
            .len()
    }
}
