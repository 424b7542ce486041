//! Thread-safe ordered store of conversation messages
//!
//! Every operation runs under a single per-ledger mutex, so a renderer reading
//! the derived views never observes a writer's partial update. The
//! newest-first view is cached and tagged with the ledger version it was built
//! from; any mutation bumps the version, which invalidates the cache before the
//! next read can see it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Author, Message, MessageId, Metrics};

#[derive(Debug, Default)]
pub struct MessageLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    messages: Vec<Message>,
    /// Position of each message in `messages`; entries are never removed
    index: HashMap<MessageId, usize>,
    version: u64,
    display_cache: Option<DisplayCache>,
}

#[derive(Debug)]
struct DisplayCache {
    version: u64,
    messages: Arc<[Message]>,
}

impl LedgerInner {
    fn push(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.index.insert(id, self.messages.len());
        self.messages.push(message);
        self.touch();
        id
    }

    fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let position = *self.index.get(&id)?;
        self.messages.get_mut(position)
    }

    fn touch(&mut self) {
        self.version += 1;
        self.display_cache = None;
    }
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written message:
    // every mutation is a single push or field update.
    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an empty, pending model message and return its id
    pub fn create_pending_model_message(&self) -> MessageId {
        let id = self.lock().push(Message::pending_model());
        tracing::trace!(message_id = %id, "created pending model message");
        id
    }

    /// Append a complete, non-pending message and return its id
    pub fn add_message(&self, text: impl Into<String>, author: Author) -> MessageId {
        self.lock().push(Message::complete(text, author))
    }

    /// Concatenate `fragment` onto the message's text.
    ///
    /// Unknown ids are ignored: a late fragment may target a turn the
    /// controller has already abandoned.
    pub fn append_fragment(&self, id: MessageId, fragment: &str, done: bool) {
        let mut inner = self.lock();
        let Some(message) = inner.get_mut(id) else {
            tracing::debug!(message_id = %id, "fragment for unknown message dropped");
            return;
        };
        message.raw_text.push_str(fragment);
        message.is_pending = !done;
        inner.touch();
    }

    /// Same as [`append_fragment`](Self::append_fragment), additionally
    /// attaching the turn's metrics.
    pub fn finalize_with_metrics(&self, id: MessageId, fragment: &str, metrics: Metrics, done: bool) {
        let mut inner = self.lock();
        let Some(message) = inner.get_mut(id) else {
            tracing::debug!(message_id = %id, "finalize for unknown message dropped");
            return;
        };
        message.raw_text.push_str(fragment);
        message.is_pending = !done;
        message.metrics = Some(metrics);
        inner.touch();
    }

    /// Messages newest first.
    ///
    /// Two calls with no write in between return the same `Arc`.
    pub fn ordered_for_display(&self) -> Arc<[Message]> {
        let mut inner = self.lock();
        if let Some(cache) = &inner.display_cache {
            if cache.version == inner.version {
                return Arc::clone(&cache.messages);
            }
        }

        let version = inner.version;
        let reversed: Arc<[Message]> = inner.messages.iter().rev().cloned().collect();
        inner.display_cache = Some(DisplayCache {
            version,
            messages: Arc::clone(&reversed),
        });
        reversed
    }

    /// Every message's trimmed text joined with newlines, oldest first
    pub fn concatenated_prompt(&self) -> String {
        self.lock()
            .messages
            .iter()
            .map(Message::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        let inner = self.lock();
        let position = *inner.index.get(&id)?;
        inner.messages.get(position).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic counter bumped on every mutation
    pub fn version(&self) -> u64 {
        self.lock().version
    }
}
