//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations
//! with proper error handling.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::history::{
    ChatRecord, ConversationTurn, HistoryStore, PromptSpec, StoredPassage, TurnCompletion,
};
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Chat Operations
    // ========================================================================

    /// Create a new chat
    pub async fn create_chat(&self, title: Option<String>) -> Result<Chat> {
        let now = chrono::Utc::now();

        let chat = ChatActiveModel {
            id: NotSet,
            title: Set(title),
            state: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        chat.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find chat by ID
    pub async fn find_chat_by_id(&self, id: i64) -> Result<Option<Chat>> {
        ChatEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Replace the chat's rolling summary state
    pub async fn update_chat_state(&self, chat_id: i64, state: &str) -> Result<Chat> {
        let now = chrono::Utc::now();

        let mut chat: ChatActiveModel = ChatEntity::find_by_id(chat_id)
            .one(self.write_conn())
            .await?
            .ok_or(AppError::ChatNotFound { id: chat_id })?
            .into();

        chat.state = Set(Some(state.to_string()));
        chat.updated_at = Set(now.into());

        chat.update(self.write_conn()).await.map_err(Into::into)
    }

    // ========================================================================
    // Turn Operations
    // ========================================================================

    /// Insert a pending turn (answer filled in after the stream completes)
    pub async fn create_turn(&self, chat_id: i64, query: &str) -> Result<Turn> {
        let now = chrono::Utc::now();

        let turn = TurnActiveModel {
            id: NotSet,
            chat_id: Set(chat_id),
            query: Set(query.to_string()),
            rewritten_query: Set(None),
            answer: Set(None),
            created_at: Set(now.into()),
        };

        turn.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Finalize a pending turn and attach its evidence passages
    pub async fn complete_turn_with_passages(
        &self,
        turn_id: i64,
        rewritten_query: String,
        answer: String,
        passages: Vec<StoredPassage>,
    ) -> Result<Turn> {
        let mut turn: TurnActiveModel = TurnEntity::find_by_id(turn_id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "chat_turn".to_string(),
                id: turn_id.to_string(),
            })?
            .into();

        turn.rewritten_query = Set(Some(rewritten_query));
        turn.answer = Set(Some(answer));

        let turn = turn.update(self.write_conn()).await?;

        if !passages.is_empty() {
            let now = chrono::Utc::now();
            let models: Vec<PassageActiveModel> = passages
                .into_iter()
                .map(|p| PassageActiveModel {
                    id: NotSet,
                    turn_id: Set(turn_id),
                    file_id: Set(p.file_id),
                    category: Set(p.category),
                    title: Set(p.title),
                    content: Set(p.content),
                    created_at: Set(now.into()),
                })
                .collect();

            PassageEntity::insert_many(models)
                .exec(self.write_conn())
                .await?;
        }

        Ok(turn)
    }

    /// List turns for a chat with pagination, newest first
    pub async fn list_turns(
        &self,
        chat_id: i64,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Turn>, u64)> {
        let paginator = TurnEntity::find()
            .filter(TurnColumn::ChatId.eq(chat_id))
            .order_by_desc(TurnColumn::CreatedAt)
            .paginate(self.read_conn(), limit);

        let total = paginator.num_items().await?;
        let turns = paginator.fetch_page(offset / limit).await?;

        Ok((turns, total))
    }

    /// The most recent `limit` answered turns, returned oldest to newest
    pub async fn recent_answered_turns(&self, chat_id: i64, limit: usize) -> Result<Vec<Turn>> {
        let mut turns = TurnEntity::find()
            .filter(TurnColumn::ChatId.eq(chat_id))
            .filter(TurnColumn::Answer.is_not_null())
            .order_by_desc(TurnColumn::Id)
            .limit(limit as u64)
            .all(self.read_conn())
            .await?;

        turns.reverse();
        Ok(turns)
    }

    // ========================================================================
    // Passage Operations
    // ========================================================================

    /// Get the evidence passages stored with a turn
    pub async fn passages_for_turn(&self, turn_id: i64) -> Result<Vec<Passage>> {
        PassageEntity::find()
            .filter(PassageColumn::TurnId.eq(turn_id))
            .order_by_asc(PassageColumn::Id)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Prompt Operations
    // ========================================================================

    /// Create a prompt preset
    pub async fn create_prompt(
        &self,
        name: String,
        content: String,
        temperature: f64,
        top_p: f64,
    ) -> Result<Prompt> {
        let now = chrono::Utc::now();

        let prompt = PromptActiveModel {
            id: NotSet,
            name: Set(name),
            content: Set(content),
            temperature: Set(temperature),
            top_p: Set(top_p),
            created_at: Set(now.into()),
        };

        prompt.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find prompt preset by ID
    pub async fn find_prompt_by_id(&self, id: i64) -> Result<Option<Prompt>> {
        PromptEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Resolve a prompt preset into the spec the pipeline consumes
    pub async fn prompt_spec(&self, id: i64) -> Result<PromptSpec> {
        let prompt = self
            .find_prompt_by_id(id)
            .await?
            .ok_or(AppError::PromptNotFound { id })?;

        Ok(PromptSpec {
            content: prompt.content,
            temperature: prompt.temperature,
            top_p: prompt.top_p,
        })
    }
}

#[async_trait]
impl HistoryStore for Repository {
    async fn find_chat(&self, chat_id: i64) -> Result<Option<ChatRecord>> {
        Ok(self.find_chat_by_id(chat_id).await?.map(|chat| ChatRecord {
            chat_id: chat.id,
            title: chat.title,
            state: chat.state,
        }))
    }

    async fn recent_turns(&self, chat_id: i64, limit: usize) -> Result<Vec<ConversationTurn>> {
        let turns = self.recent_answered_turns(chat_id, limit).await?;

        Ok(turns
            .into_iter()
            .map(|turn| ConversationTurn {
                query: turn.query,
                answer: turn.answer.unwrap_or_default(),
            })
            .collect())
    }

    async fn begin_turn(&self, chat_id: i64, query: &str) -> Result<i64> {
        let turn = self.create_turn(chat_id, query).await?;
        Ok(turn.id)
    }

    async fn complete_turn(&self, completion: TurnCompletion) -> Result<()> {
        self.complete_turn_with_passages(
            completion.turn_id,
            completion.rewritten_query,
            completion.answer,
            completion.passages,
        )
        .await?;
        Ok(())
    }

    async fn update_chat_state(&self, chat_id: i64, state: &str) -> Result<()> {
        Repository::update_chat_state(self, chat_id, state).await?;
        Ok(())
    }
}
