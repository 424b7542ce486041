//! Turn controller
//!
//! The ConversationController drives one conversation turn at a time:
//! 1. Accepts the user's text and locks input
//! 2. Records the user message and a pending placeholder for the reply
//! 3. Streams the backend's fragments into the placeholder, in order
//! 4. Finalizes the reply with metrics, or records the stream's error
//! 5. Hands a history record to the background writer and unlocks input
//!
//! `submit` never waits for the backend; the turn runs on its own task.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::conversation::{Author, MessageId, MessageLedger, Metrics};
use crate::providers::{InferenceBackend, ProviderError};

use super::energy::EnergyEstimator;
use super::history::{HistoryRecord, HistoryWriter, TurnStats};

/// Where the current (or most recent) turn is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingFirstFragment,
    Streaming,
    Finalized,
    Errored,
}

/// Reasons a submission was not started. None of them change any state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Message is blank")]
    BlankInput,

    #[error("A turn is already in progress")]
    TurnInProgress,

    #[error("Conversation has been shut down")]
    ShutDown,
}

/// Ids of the two messages a submission created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnTicket {
    pub user_message_id: MessageId,
    pub reply_id: MessageId,
}

#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    ledger: Arc<MessageLedger>,
    backend: Arc<dyn InferenceBackend>,
    energy: Arc<dyn EnergyEstimator>,
    history: Option<Arc<HistoryWriter>>,
    username: String,
    input_enabled: watch::Sender<bool>,
    state: watch::Sender<TurnState>,
    shutdown: watch::Sender<bool>,
    active_turn: Mutex<Option<JoinHandle<()>>>,
}

struct Turn {
    query: String,
    reply_id: MessageId,
    prompt: String,
}

impl ConversationController {
    pub fn new(
        ledger: Arc<MessageLedger>,
        backend: Arc<dyn InferenceBackend>,
        energy: Arc<dyn EnergyEstimator>,
        history: Option<Arc<HistoryWriter>>,
        username: impl Into<String>,
    ) -> Self {
        let (input_enabled, _) = watch::channel(true);
        let (state, _) = watch::channel(TurnState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(ControllerInner {
                ledger,
                backend,
                energy,
                history,
                username: username.into(),
                input_enabled,
                state,
                shutdown,
                active_turn: Mutex::new(None),
            }),
        }
    }

    /// Start a turn for `text` on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, text: &str) -> Result<TurnTicket, SubmitError> {
        if text.trim().is_empty() {
            tracing::debug!("ignoring blank submission");
            return Err(SubmitError::BlankInput);
        }

        let inner = &self.inner;
        let mut active_turn = inner.active_turn.lock().unwrap_or_else(PoisonError::into_inner);
        if *inner.shutdown.borrow() {
            return Err(SubmitError::ShutDown);
        }

        let claimed = inner.input_enabled.send_if_modified(|enabled| {
            let was_enabled = *enabled;
            *enabled = false;
            was_enabled
        });
        if !claimed {
            return Err(SubmitError::TurnInProgress);
        }

        let user_message_id = inner.ledger.add_message(text, Author::User);
        let reply_id = inner.ledger.create_pending_model_message();
        inner.state.send_replace(TurnState::AwaitingFirstFragment);

        let turn = Turn {
            query: text.to_string(),
            reply_id,
            prompt: inner.ledger.concatenated_prompt(),
        };
        tracing::info!(
            username = %inner.username,
            message_id = %reply_id,
            prompt_len = turn.prompt.len(),
            "processing new message"
        );

        let cancel = inner.shutdown.subscribe();
        *active_turn = Some(tokio::spawn(run_turn(Arc::clone(inner), turn, cancel)));

        Ok(TurnTicket {
            user_message_id,
            reply_id,
        })
    }

    pub fn input_enabled(&self) -> bool {
        *self.inner.input_enabled.borrow()
    }

    pub fn subscribe_input(&self) -> watch::Receiver<bool> {
        self.inner.input_enabled.subscribe()
    }

    /// State of the current turn, or the outcome of the last one
    pub fn turn_state(&self) -> TurnState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.inner.state.subscribe()
    }

    pub fn ledger(&self) -> &Arc<MessageLedger> {
        &self.inner.ledger
    }

    /// Stop the in-flight turn, if any, and refuse new ones.
    ///
    /// Once this returns the cancelled turn will not write to the ledger.
    pub async fn shutdown(&self) {
        let handle = {
            let mut active_turn = self
                .inner
                .active_turn
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.shutdown.send_replace(true);
            active_turn.take()
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "turn task failed");
            }
        }
    }
}

/// Re-enables input when the turn task ends, however it ends
struct InputGate<'a>(&'a watch::Sender<bool>);

impl Drop for InputGate<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn run_turn(inner: Arc<ControllerInner>, turn: Turn, mut cancel: watch::Receiver<bool>) {
    let _gate = InputGate(&inner.input_enabled);
    let started = Instant::now();
    let initial_workers = live_worker_count();
    tracing::debug!(message_id = %turn.reply_id, initial_workers, "starting inference");

    let opened = until_cancelled(&mut cancel, inner.backend.start_stream(&turn.prompt)).await;
    let mut stream = match opened {
        None => return inner.cancelled(&turn),
        Some(Ok(stream)) => stream,
        Some(Err(e)) => return inner.fail(&turn, e),
    };

    let mut response = String::new();
    let mut received_first = false;
    loop {
        let Some(next) = until_cancelled(&mut cancel, stream.next()).await else {
            return inner.cancelled(&turn);
        };

        match next {
            Some(Ok(fragment)) => {
                response.push_str(&fragment.text);
                if !received_first {
                    received_first = true;
                    tracing::debug!(message_id = %turn.reply_id, "received first fragment");
                    inner.ledger.append_fragment(turn.reply_id, &fragment.text, fragment.done);
                    inner.state.send_replace(TurnState::Streaming);
                    if fragment.done {
                        return inner.finish(&turn, "", &response, started, initial_workers);
                    }
                } else if fragment.done {
                    return inner.finish(&turn, &fragment.text, &response, started, initial_workers);
                } else {
                    tracing::trace!(message_id = %turn.reply_id, len = fragment.text.len(), "received fragment");
                    inner.ledger.append_fragment(turn.reply_id, &fragment.text, false);
                }
            }
            Some(Err(e)) => return inner.fail(&turn, e),
            None => {
                tracing::warn!(message_id = %turn.reply_id, "stream ended without a final fragment");
                return inner.finish(&turn, "", &response, started, initial_workers);
            }
        }
    }
}

impl ControllerInner {
    fn finish(&self, turn: &Turn, fragment: &str, response: &str, started: Instant, initial_workers: usize) {
        let execution_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let final_workers = live_worker_count();
        let estimated_energy = self.energy.estimate(execution_time_ms);

        let metrics = Metrics {
            execution_time_ms,
            worker_count: final_workers,
            estimated_energy,
        };
        self.ledger.finalize_with_metrics(turn.reply_id, fragment, metrics, true);
        self.state.send_replace(TurnState::Finalized);

        tracing::info!(
            username = %self.username,
            message_id = %turn.reply_id,
            execution_time_ms,
            initial_workers,
            final_workers,
            estimated_energy,
            response_len = response.len(),
            "inference completed"
        );

        let stats = TurnStats {
            execution_time_ms,
            initial_worker_count: initial_workers,
            final_worker_count: final_workers,
            estimated_energy,
        };
        self.record(HistoryRecord::response(&self.username, &turn.query, response, stats));
    }

    fn fail(&self, turn: &Turn, error: ProviderError) {
        let mut text = error.to_string();
        if text.trim().is_empty() {
            text = "Unknown Error".to_string();
        }
        tracing::error!(username = %self.username, message_id = %turn.reply_id, error = %text, "error processing message");

        // The placeholder stays pending; the error gets its own message.
        self.ledger.add_message(text.as_str(), Author::System);
        self.state.send_replace(TurnState::Errored);
        self.record(HistoryRecord::error(&self.username, &turn.query, &text));
    }

    fn cancelled(&self, turn: &Turn) {
        tracing::debug!(message_id = %turn.reply_id, "turn cancelled");
        self.state.send_replace(TurnState::Idle);
    }

    fn record(&self, record: HistoryRecord) {
        if let Some(history) = &self.history {
            history.record(record);
        }
    }
}

/// Run `fut` unless the shutdown signal fires first
async fn until_cancelled<F: Future>(cancel: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown_signalled(cancel) => None,
        output = fut => Some(output),
    }
}

async fn shutdown_signalled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Live tasks on the current runtime
fn live_worker_count() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::history::HistoryStore;
    use crate::providers::{Fragment, FragmentStream};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    type Item = Result<Fragment, ProviderError>;

    /// Backend whose fragments are pushed by the test through a channel
    struct ScriptedBackend {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Item>>>,
        prompts: Mutex<Vec<String>>,
        open_error: Option<String>,
        hang_on_open: bool,
    }

    impl ScriptedBackend {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Item>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let backend = Arc::new(Self {
                rx: Mutex::new(Some(rx)),
                prompts: Mutex::new(Vec::new()),
                open_error: None,
                hang_on_open: false,
            });
            (backend, tx)
        }

        /// `start_stream` never resolves
        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(None),
                prompts: Mutex::new(Vec::new()),
                open_error: None,
                hang_on_open: true,
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(None),
                prompts: Mutex::new(Vec::new()),
                open_error: Some(message.to_string()),
                hang_on_open: false,
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn start_stream(&self, prompt: &str) -> Result<FragmentStream, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.hang_on_open {
                return std::future::pending().await;
            }
            if let Some(message) = &self.open_error {
                return Err(ProviderError::NotConfigured(message.clone()));
            }
            let mut rx = self.rx.lock().unwrap().take().expect("stream opened twice");
            Ok(Box::pin(async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            }))
        }
    }

    struct FixedEnergy(f64);

    impl EnergyEstimator for FixedEnergy {
        fn estimate(&self, _execution_time_ms: u64) -> f64 {
            self.0
        }
    }

    fn controller_with(backend: Arc<ScriptedBackend>, energy: f64) -> ConversationController {
        ConversationController::new(
            Arc::new(MessageLedger::new()),
            backend,
            Arc::new(FixedEnergy(energy)),
            None,
            "ada",
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_input(controller: &ConversationController) {
        let mut input = controller.subscribe_input();
        tokio::time::timeout(Duration::from_secs(5), input.wait_for(|enabled| *enabled))
            .await
            .expect("input never re-enabled")
            .expect("controller dropped");
    }

    fn fragment(text: &str, done: bool) -> Item {
        Ok(Fragment::new(text, done))
    }

    #[tokio::test]
    async fn test_submit_creates_messages_and_locks_input() {
        let (backend, _tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);

        let ticket = assert_ok!(controller.submit("hello"));

        assert!(!controller.input_enabled());
        assert_eq!(controller.turn_state(), TurnState::AwaitingFirstFragment);

        let ledger = controller.ledger();
        assert_eq!(ledger.len(), 2);
        let user = ledger.get(ticket.user_message_id).unwrap();
        assert_eq!(user.author, Author::User);
        assert_eq!(user.raw_text, "hello");
        let reply = ledger.get(ticket.reply_id).unwrap();
        assert_eq!(reply.author, Author::Model);
        assert!(reply.is_pending);
    }

    #[tokio::test]
    async fn test_stream_finalizes_with_metrics() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(Arc::clone(&backend), 2.5);
        let ticket = controller.submit("hello").unwrap();
        let ledger = Arc::clone(controller.ledger());

        tx.send(fragment("Hi", false)).unwrap();
        wait_until(|| ledger.get(ticket.reply_id).unwrap().raw_text == "Hi").await;
        assert!(!controller.input_enabled());
        assert_eq!(controller.turn_state(), TurnState::Streaming);

        tx.send(fragment(" there", true)).unwrap();
        wait_for_input(&controller).await;

        let reply = ledger.get(ticket.reply_id).unwrap();
        assert_eq!(reply.raw_text, "Hi there");
        assert!(!reply.is_pending);
        let metrics = reply.metrics.expect("metrics attached");
        assert_eq!(metrics.estimated_energy, 2.5);
        assert_eq!(controller.turn_state(), TurnState::Finalized);

        // The placeholder contributes an empty line to the prompt.
        assert_eq!(backend.prompts.lock().unwrap().as_slice(), ["hello\n"]);
    }

    #[tokio::test]
    async fn test_blank_submissions_are_ignored() {
        let (backend, _tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);

        assert_eq!(assert_err!(controller.submit("")), SubmitError::BlankInput);
        assert_eq!(assert_err!(controller.submit("   ")), SubmitError::BlankInput);

        assert!(controller.ledger().is_empty());
        assert!(controller.input_enabled());
        assert_eq!(controller.turn_state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_second_submit_rejected_while_turn_active() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);
        controller.submit("first").unwrap();

        assert_eq!(controller.submit("second"), Err(SubmitError::TurnInProgress));
        assert_eq!(controller.ledger().len(), 2);

        tx.send(fragment("done", true)).unwrap();
        wait_for_input(&controller).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_start_one_turn() {
        const CALLERS: usize = 16;
        let (backend, _tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);
        let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let controller = controller.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    controller.submit(&format!("message {i}"))
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert_eq!(e, SubmitError::TurnInProgress),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(controller.ledger().len(), 2);
        assert!(!controller.input_enabled());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_while_opening_stream() {
        let backend = ScriptedBackend::hanging();
        let controller = controller_with(Arc::clone(&backend), 1.0);
        controller.submit("hello").unwrap();
        let ledger = Arc::clone(controller.ledger());
        let version = ledger.version();

        wait_until(|| !backend.prompts.lock().unwrap().is_empty()).await;
        assert_eq!(controller.turn_state(), TurnState::AwaitingFirstFragment);

        tokio::time::timeout(Duration::from_secs(5), controller.shutdown())
            .await
            .expect("shutdown did not return");

        assert!(controller.input_enabled());
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert_eq!(ledger.version(), version);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_fragment() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(Arc::clone(&backend), 1.0);
        let ticket = controller.submit("hello").unwrap();
        let ledger = Arc::clone(controller.ledger());
        let version = ledger.version();

        wait_until(|| !backend.prompts.lock().unwrap().is_empty()).await;
        tokio::time::timeout(Duration::from_secs(5), controller.shutdown())
            .await
            .expect("shutdown did not return");
        let _ = tx.send(fragment("late", true));
        tokio::task::yield_now().await;

        assert!(controller.input_enabled());
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert_eq!(ledger.version(), version);
        assert_eq!(ledger.get(ticket.reply_id).unwrap().raw_text, "");
    }

    #[tokio::test]
    async fn test_stream_error_keeps_partial_text() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);
        let ticket = controller.submit("hello").unwrap();

        tx.send(fragment("partial", false)).unwrap();
        tx.send(Err(ProviderError::Stream("model crashed".into()))).unwrap();
        wait_for_input(&controller).await;

        let ledger = controller.ledger();
        assert_eq!(ledger.len(), 3);
        let reply = ledger.get(ticket.reply_id).unwrap();
        assert_eq!(reply.raw_text, "partial");
        assert!(reply.is_pending);
        assert!(reply.metrics.is_none());

        let newest = &ledger.ordered_for_display()[0];
        assert_eq!(newest.author, Author::System);
        assert_eq!(newest.text(), "model crashed");
        assert_eq!(controller.turn_state(), TurnState::Errored);
    }

    #[tokio::test]
    async fn test_open_failure_restores_input() {
        let controller = controller_with(ScriptedBackend::failing("no model loaded"), 1.0);
        controller.submit("hello").unwrap();
        wait_for_input(&controller).await;

        let newest = &controller.ledger().ordered_for_display()[0];
        assert_eq!(newest.author, Author::System);
        assert!(newest.text().contains("no model loaded"));
        assert_eq!(controller.turn_state(), TurnState::Errored);
    }

    #[tokio::test]
    async fn test_single_fragment_response() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);
        let ticket = controller.submit("hello").unwrap();

        tx.send(fragment("Whole answer", true)).unwrap();
        wait_for_input(&controller).await;

        let reply = controller.ledger().get(ticket.reply_id).unwrap();
        assert_eq!(reply.raw_text, "Whole answer");
        assert!(!reply.is_pending);
        assert!(reply.metrics.is_some());
    }

    #[tokio::test]
    async fn test_stream_without_final_fragment_still_finalizes() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);
        let ticket = controller.submit("hello").unwrap();

        tx.send(fragment("cut", false)).unwrap();
        drop(tx);
        wait_for_input(&controller).await;

        let reply = controller.ledger().get(ticket.reply_id).unwrap();
        assert_eq!(reply.raw_text, "cut");
        assert!(!reply.is_pending);
        assert!(reply.metrics.is_some());
    }

    #[tokio::test]
    async fn test_energy_sentinel_is_stored() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(backend, -1.0);
        let ticket = controller.submit("hello").unwrap();

        tx.send(fragment("ok", true)).unwrap();
        wait_for_input(&controller).await;

        let metrics = controller.ledger().get(ticket.reply_id).unwrap().metrics.unwrap();
        assert_eq!(metrics.estimated_energy, -1.0);
        assert_eq!(controller.turn_state(), TurnState::Finalized);
    }

    #[tokio::test]
    async fn test_shutdown_stops_turn_without_writes() {
        let (backend, tx) = ScriptedBackend::new();
        let controller = controller_with(backend, 1.0);
        let ticket = controller.submit("hello").unwrap();
        let ledger = Arc::clone(controller.ledger());

        tx.send(fragment("Hi", false)).unwrap();
        wait_until(|| ledger.get(ticket.reply_id).unwrap().raw_text == "Hi").await;

        controller.shutdown().await;
        let version = ledger.version();
        let _ = tx.send(fragment(" late", true));
        tokio::task::yield_now().await;

        assert!(controller.input_enabled());
        assert_eq!(ledger.version(), version);
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(ticket.reply_id).unwrap().is_pending);
        assert_eq!(controller.submit("again"), Err(SubmitError::ShutDown));
    }

    #[tokio::test]
    async fn test_turn_writes_history_record() {
        let dir: PathBuf = std::env::temp_dir().join(format!("parley-turn-{}", uuid::Uuid::new_v4()));
        let ledger = Arc::new(MessageLedger::new());
        let writer = Arc::new(HistoryWriter::spawn(HistoryStore::new(&dir), Arc::clone(&ledger)));
        let (backend, tx) = ScriptedBackend::new();
        let controller = ConversationController::new(
            Arc::clone(&ledger),
            backend,
            Arc::new(FixedEnergy(0.75)),
            Some(Arc::clone(&writer)),
            "ada",
        );

        controller.submit("hello").unwrap();
        tx.send(fragment("Hi", false)).unwrap();
        tx.send(fragment(" there", true)).unwrap();
        wait_for_input(&controller).await;
        writer.close().await;

        let history = HistoryStore::new(&dir).load_history("ada").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "hello");
        assert_eq!(history[0].response.as_deref(), Some("Hi there"));
        assert_eq!(history[0].estimated_energy, Some(0.75));
        assert_eq!(history[0].username, "ada");

        let _ = std::fs::remove_dir_all(dir);
    }
}
