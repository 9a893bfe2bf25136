//! SeaORM entity models
//!
//! Database entities for Ragline

mod chat;
mod passage;
mod prompt;
mod turn;

pub use chat::{
    Entity as ChatEntity,
    Model as Chat,
    ActiveModel as ChatActiveModel,
    Column as ChatColumn,
};

pub use turn::{
    Entity as TurnEntity,
    Model as Turn,
    ActiveModel as TurnActiveModel,
    Column as TurnColumn,
};

pub use passage::{
    Entity as PassageEntity,
    Model as Passage,
    ActiveModel as PassageActiveModel,
    Column as PassageColumn,
};

pub use prompt::{
    Entity as PromptEntity,
    Model as Prompt,
    ActiveModel as PromptActiveModel,
    Column as PromptColumn,
};
