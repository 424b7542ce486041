//! A single user's chat session: one ledger, one controller, one history log

use std::sync::Arc;

use crate::conversation::MessageLedger;
use crate::providers::InferenceBackend;

use super::controller::ConversationController;
use super::energy::EnergyEstimator;
use super::history::{HistoryRecord, HistoryStore, HistoryWriter};

pub struct ChatSession {
    username: String,
    ledger: Arc<MessageLedger>,
    controller: ConversationController,
    history: Option<(HistoryStore, Arc<HistoryWriter>)>,
}

impl ChatSession {
    /// Create a session. Passing a store enables the history log.
    ///
    /// Must be called from within a Tokio runtime when `history` is set.
    pub fn new(
        username: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
        energy: Arc<dyn EnergyEstimator>,
        history: Option<HistoryStore>,
    ) -> Self {
        let username = username.into();
        let ledger = Arc::new(MessageLedger::new());

        let history = history.map(|store| {
            let writer = Arc::new(HistoryWriter::spawn(store.clone(), Arc::clone(&ledger)));
            (store, writer)
        });

        let controller = ConversationController::new(
            Arc::clone(&ledger),
            backend,
            energy,
            history.as_ref().map(|(_, writer)| Arc::clone(writer)),
            username.clone(),
        );

        tracing::info!(
            username = %username,
            history = history.is_some(),
            "chat session started"
        );

        Self {
            username,
            ledger,
            controller,
            history,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn ledger(&self) -> &Arc<MessageLedger> {
        &self.ledger
    }

    pub fn controller(&self) -> &ConversationController {
        &self.controller
    }

    /// Past turns recorded for this session's user
    pub async fn history(&self) -> Vec<HistoryRecord> {
        match &self.history {
            Some((store, _)) => store.load_history(&self.username).await,
            None => Vec::new(),
        }
    }

    /// Cancel any in-flight turn, then flush the history log
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        if let Some((_, writer)) = &self.history {
            writer.close().await;
        }
        tracing::info!(username = %self.username, "chat session closed");
    }
}
