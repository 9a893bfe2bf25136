//! Conversation history port
//!
//! The answer pipeline reads and writes history through this trait so the
//! engine stays independent of the storage backend. `db::Repository` is the
//! production implementation; `MemoryHistory` backs tests and local runs
//! without a database.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A chat row as the pipeline sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: i64,
    pub title: Option<String>,
    /// Rolling decision summary, fed back into generation requests
    pub state: Option<String>,
}

/// One answered exchange, oldest-first in any returned window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
}

/// Evidence passage stored alongside a completed turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPassage {
    pub file_id: i64,
    pub category: String,
    pub title: String,
    pub content: String,
}

/// Everything needed to finalize a pending turn
#[derive(Debug, Clone)]
pub struct TurnCompletion {
    pub turn_id: i64,
    pub rewritten_query: String,
    pub answer: String,
    pub passages: Vec<StoredPassage>,
}

/// A system-prompt preset with its sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSpec {
    pub content: String,
    pub temperature: f64,
    pub top_p: f64,
}

/// Storage operations the answer pipeline depends on
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Look up a chat by id
    async fn find_chat(&self, chat_id: i64) -> Result<Option<ChatRecord>>;

    /// The most recent `limit` answered turns, returned oldest to newest
    async fn recent_turns(&self, chat_id: i64, limit: usize) -> Result<Vec<ConversationTurn>>;

    /// Insert a pending turn (no answer yet) and return its id
    async fn begin_turn(&self, chat_id: i64, query: &str) -> Result<i64>;

    /// Fill in a pending turn after the stream completed
    async fn complete_turn(&self, completion: TurnCompletion) -> Result<()>;

    /// Replace the chat's rolling summary state
    async fn update_chat_state(&self, chat_id: i64, state: &str) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryTurn {
    turn_id: i64,
    chat_id: i64,
    query: String,
    answer: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryHistoryInner {
    chats: HashMap<i64, ChatRecord>,
    turns: Vec<MemoryTurn>,
    next_turn_id: i64,
    completions: Vec<TurnCompletion>,
    state_updates: Vec<(i64, String)>,
}

/// In-memory `HistoryStore` for tests and local runs
#[derive(Default)]
pub struct MemoryHistory {
    inner: Mutex<MemoryHistoryInner>,
    fail_completions: AtomicBool,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with one empty chat
    pub fn with_chat(chat_id: i64) -> Self {
        let store = Self::new();
        store.insert_chat(ChatRecord {
            chat_id,
            title: None,
            state: None,
        });
        store
    }

    pub fn insert_chat(&self, chat: ChatRecord) {
        let mut inner = self.lock();
        inner.chats.insert(chat.chat_id, chat);
    }

    /// Seed an already-answered turn, as if a prior stream completed
    pub fn add_answered_turn(&self, chat_id: i64, query: &str, answer: &str) -> i64 {
        let mut inner = self.lock();
        inner.next_turn_id += 1;
        let turn_id = inner.next_turn_id;
        inner.turns.push(MemoryTurn {
            turn_id,
            chat_id,
            query: query.to_string(),
            answer: Some(answer.to_string()),
        });
        turn_id
    }

    /// Make every subsequent `complete_turn` fail
    pub fn fail_completions(&self) {
        self.fail_completions.store(true, Ordering::SeqCst);
    }

    /// Completions recorded so far, in call order
    pub fn completions(&self) -> Vec<TurnCompletion> {
        self.lock().completions.clone()
    }

    /// Chat-state updates recorded so far, in call order
    pub fn state_updates(&self) -> Vec<(i64, String)> {
        self.lock().state_updates.clone()
    }

    /// Total turns inserted, pending or answered
    pub fn turn_count(&self) -> usize {
        self.lock().turns.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryHistoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn find_chat(&self, chat_id: i64) -> Result<Option<ChatRecord>> {
        Ok(self.lock().chats.get(&chat_id).cloned())
    }

    async fn recent_turns(&self, chat_id: i64, limit: usize) -> Result<Vec<ConversationTurn>> {
        let inner = self.lock();
        let mut turns: Vec<ConversationTurn> = inner
            .turns
            .iter()
            .rev()
            .filter(|turn| turn.chat_id == chat_id)
            .filter_map(|turn| {
                turn.answer.as_ref().map(|answer| ConversationTurn {
                    query: turn.query.clone(),
                    answer: answer.clone(),
                })
            })
            .take(limit)
            .collect();
        turns.reverse();
        Ok(turns)
    }

    async fn begin_turn(&self, chat_id: i64, query: &str) -> Result<i64> {
        let mut inner = self.lock();
        if !inner.chats.contains_key(&chat_id) {
            return Err(AppError::ChatNotFound { id: chat_id });
        }
        inner.next_turn_id += 1;
        let turn_id = inner.next_turn_id;
        inner.turns.push(MemoryTurn {
            turn_id,
            chat_id,
            query: query.to_string(),
            answer: None,
        });
        Ok(turn_id)
    }

    async fn complete_turn(&self, completion: TurnCompletion) -> Result<()> {
        if self.fail_completions.load(Ordering::SeqCst) {
            return Err(AppError::Internal {
                message: "mock completion failure".to_string(),
            });
        }
        let mut inner = self.lock();
        let answer = completion.answer.clone();
        if let Some(turn) = inner
            .turns
            .iter_mut()
            .find(|turn| turn.turn_id == completion.turn_id)
        {
            turn.answer = Some(answer);
        }
        inner.completions.push(completion);
        Ok(())
    }

    async fn update_chat_state(&self, chat_id: i64, state: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(chat) = inner.chats.get_mut(&chat_id) {
            chat.state = Some(state.to_string());
        }
        inner.state_updates.push((chat_id, state.to_string()));
        Ok(())
    }
}
