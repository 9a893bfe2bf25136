//! API handlers module

pub mod chat;
pub mod health;
pub mod stream;
