//! Chat, turn, and prompt handlers
//!
//! `ask` is the entry point of the answer pipeline: it resolves the
//! prompt preset, hands the question to the orchestrator, and responds
//! with the pending turn id while tokens stream over the session's SSE
//! connection.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use ragline_common::{
    clients::search::SearchFilters,
    db::Repository,
    errors::{AppError, Result},
    history::PromptSpec,
};
use ragline_engine::{AskMode, AskReceipt, AskRequest};

/// Request to create a chat
#[derive(Debug, Deserialize, Validate)]
pub struct CreateChatRequest {
    #[validate(length(min = 1, max = 200))]
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub chat_id: i64,
    pub title: Option<String>,
    pub created_at: String,
}

/// Turn history pagination
#[derive(Debug, Deserialize)]
pub struct TurnsQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_page_size")]
    pub limit: u64,
}

fn default_page_size() -> u64 {
    20
}

#[derive(Serialize)]
pub struct TurnsResponse {
    pub turns: Vec<TurnItem>,
    pub total: u64,
}

#[derive(Serialize)]
pub struct TurnItem {
    pub turn_id: i64,
    pub answered: bool,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub created_at: String,
}

/// Ask request body
#[derive(Debug, Deserialize, Validate)]
pub struct AskBody {
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,

    #[validate(length(min = 1, max = 4000))]
    pub query: String,

    /// Prompt preset; the configured default prompt when absent
    pub prompt_id: Option<i64>,

    /// Category codes restricting retrieval (empty = all)
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub mode: AskModeParam,
}

/// Wire form of the ask mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskModeParam {
    #[default]
    Rag,
    Direct,
}

impl From<AskModeParam> for AskMode {
    fn from(mode: AskModeParam) -> Self {
        match mode {
            AskModeParam::Rag => AskMode::Retrieval,
            AskModeParam::Direct => AskMode::Direct,
        }
    }
}

/// Request to create a prompt preset
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePromptRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,

    #[validate(length(min = 1, max = 20000))]
    pub content: String,

    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f64>,

    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: Option<f64>,
}

#[derive(Serialize)]
pub struct PromptResponse {
    pub prompt_id: i64,
    pub name: String,
    pub created_at: String,
}

/// Create a new chat
pub async fn create_chat(
    State(state): State<AppState>,
    Json(request): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<ChatResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let repo = Repository::new(state.db.clone());
    let chat = repo.create_chat(request.title).await?;

    tracing::info!(chat_id = chat.id, "Chat created");

    Ok((
        StatusCode::CREATED,
        Json(ChatResponse {
            chat_id: chat.id,
            title: chat.title,
            created_at: chat.created_at.to_rfc3339(),
        }),
    ))
}

/// List a chat's turns, oldest first
pub async fn list_turns(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Query(params): Query<TurnsQuery>,
) -> Result<Json<TurnsResponse>> {
    let repo = Repository::new(state.db.clone());

    // 404 on an unknown chat rather than an empty page
    repo.find_chat_by_id(chat_id)
        .await?
        .ok_or(AppError::ChatNotFound { id: chat_id })?;

    let limit = params.limit.clamp(1, 100);
    let (turns, total) = repo.list_turns(chat_id, params.offset, limit).await?;

    let turns = turns
        .into_iter()
        .map(|turn| TurnItem {
            turn_id: turn.id,
            answered: turn.is_answered(),
            query: turn.query,
            rewritten_query: turn.rewritten_query,
            answer: turn.answer,
            created_at: turn.created_at.to_rfc3339(),
        })
        .collect();

    Ok(Json(TurnsResponse { turns, total }))
}

/// Ask a question over the session's open stream
pub async fn ask(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Json(body): Json<AskBody>,
) -> Result<Json<AskReceipt>> {
    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let repo = Repository::new(state.db.clone());
    let prompt = match body.prompt_id {
        Some(prompt_id) => repo.prompt_spec(prompt_id).await?,
        None => PromptSpec {
            content: state.config.answer.default_prompt.clone(),
            temperature: state.config.answer.default_temperature,
            top_p: state.config.answer.default_top_p,
        },
    };

    let receipt = state
        .orchestrator
        .ask(AskRequest {
            session_id: body.session_id,
            chat_id,
            query: body.query,
            filters: SearchFilters {
                categories: body.categories,
            },
            mode: body.mode.into(),
            prompt,
        })
        .await?;

    Ok(Json(receipt))
}

/// Create a prompt preset
pub async fn create_prompt(
    State(state): State<AppState>,
    Json(request): Json<CreatePromptRequest>,
) -> Result<(StatusCode, Json<PromptResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let repo = Repository::new(state.db.clone());
    let prompt = repo
        .create_prompt(
            request.name,
            request.content,
            request
                .temperature
                .unwrap_or(state.config.answer.default_temperature),
            request
                .top_p
                .unwrap_or(state.config.answer.default_top_p),
        )
        .await?;

    tracing::info!(prompt_id = prompt.id, name = %prompt.name, "Prompt created");

    Ok((
        StatusCode::CREATED,
        Json(PromptResponse {
            prompt_id: prompt.id,
            name: prompt.name,
            created_at: prompt.created_at.to_rfc3339(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_body_defaults() {
        let body: AskBody =
            serde_json::from_str(r#"{"session_id": "s1", "query": "hi"}"#).unwrap();
        assert_eq!(body.mode, AskModeParam::Rag);
        assert!(body.categories.is_empty());
        assert!(body.prompt_id.is_none());
    }

    #[test]
    fn test_ask_mode_parses_lowercase() {
        let body: AskBody =
            serde_json::from_str(r#"{"session_id": "s1", "query": "hi", "mode": "direct"}"#)
                .unwrap();
        assert_eq!(AskMode::from(body.mode), AskMode::Direct);
    }

    #[test]
    fn test_blank_query_fails_validation() {
        let body: AskBody =
            serde_json::from_str(r#"{"session_id": "s1", "query": ""}"#).unwrap();
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_prompt_sampling_bounds() {
        let request: CreatePromptRequest = serde_json::from_str(
            r#"{"name": "concise", "content": "Answer briefly.", "temperature": 3.5}"#,
        )
        .unwrap();
        assert!(request.validate().is_err());
    }
}
