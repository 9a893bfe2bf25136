//! Chat turn entity - one question/answer exchange
//!
//! A turn is inserted with a NULL answer when the question is accepted
//! and filled in after the stream completes. A NULL answer therefore
//! means the turn is still pending (or was cancelled mid-stream).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chat_turns")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub chat_id: i64,

    #[sea_orm(column_type = "Text")]
    pub query: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub rewritten_query: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub answer: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    /// Check whether this turn reached a stored answer
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::chat::Entity",
        from = "Column::ChatId",
        to = "super::chat::Column::Id"
    )]
    Chat,

    #[sea_orm(has_many = "super::passage::Entity")]
    Passage,
}

impl Related<super::chat::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chat.def()
    }
}

impl Related<super::passage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Passage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
