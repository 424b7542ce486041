//! Core chat session components
//!
//! This module contains the turn orchestration logic and its collaborators:
//! energy estimates and the per-user history log.

mod controller;
pub mod energy;
pub mod history;
mod session;

pub use controller::{ConversationController, SubmitError, TurnState, TurnTicket};
pub use energy::{EnergyEstimator, PowerProfileEstimator, ENERGY_UNAVAILABLE};
pub use history::{sanitize, HistoryRecord, HistoryStore, HistoryWriter};
pub use session::ChatSession;
