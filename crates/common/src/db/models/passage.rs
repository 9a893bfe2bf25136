//! Passage entity - evidence snapshot stored with a completed turn

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chat_passages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub turn_id: i64,

    pub file_id: i64,

    #[sea_orm(column_type = "Text")]
    pub category: String,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    #[sea_orm(column_type = "Text")]
    pub content: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::turn::Entity",
        from = "Column::TurnId",
        to = "super::turn::Column::Id"
    )]
    Turn,
}

impl Related<super::turn::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Turn.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
