//! Change-tracking subscriptions over sets of grants
//!
//! A [`TokenWatch`] fires at most once. It is unregistered when it fires, when
//! it is cancelled and when it is dropped, so a holder that goes away cannot
//! leak a registration.

use crate::identifiers::TokenId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

struct Entry {
    tokens: BTreeSet<TokenId>,
    sender: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

/// Registry of live token watches, owned by a store
#[derive(Clone, Default)]
pub struct WatchRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl WatchRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch a set of grants
    pub fn register(&self, tokens: impl IntoIterator<Item = TokenId>) -> TokenWatch {
        let (sender, receiver) = watch::channel(false);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                tokens: tokens.into_iter().collect(),
                sender,
            },
        );
        TokenWatch {
            id,
            receiver,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Fire and unregister every watch covering `token_id`
    pub fn notify(&self, token_id: &TokenId) {
        let fired: Vec<Entry> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.tokens.contains(token_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.entries.remove(&id))
                .collect()
        };
        for entry in fired {
            tracing::debug!(token_id = %token_id, "token watch invalidated");
            let _ = entry.sender.send(true);
        }
    }

    /// Number of registered, unfired watches
    pub fn active_count(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Cancellable subscription to changes of the grants underpinning a result
#[derive(Debug)]
pub struct TokenWatch {
    id: u64,
    receiver: watch::Receiver<bool>,
    registry: Weak<Mutex<Inner>>,
}

impl TokenWatch {
    /// Whether a watched grant has changed
    pub fn is_invalidated(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until a watched grant changes.
    ///
    /// Also resolves if the owning store is dropped.
    pub async fn invalidated(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop watching
    pub fn cancel(self) {}
}

impl Drop for TokenWatch {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().entries.remove(&self.id);
        }
    }
}
