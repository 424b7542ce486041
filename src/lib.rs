//! Parley - streaming chat session core
//!
//! Keeps an ordered, thread-safe ledger of conversation messages and drives
//! one turn at a time against a token-streaming inference backend, routing
//! each fragment into the ledger as it arrives.

use std::sync::Arc;

pub mod config;
pub mod conversation;
pub mod core;
pub mod providers;
pub mod routes;

use crate::core::ChatSession;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<ChatSession>,
}
