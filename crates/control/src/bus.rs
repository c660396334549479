use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::protocol::ChangeEvent;
use storage::{ChangeFeed, Storage};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;

/// Consumer side of one queue document.
#[async_trait]
pub trait QueueDispatcher: Send + Sync + 'static {
    /// Shape of one entry in the document's `queue` array.
    type Item: DeserializeOwned + Debug + Send + 'static;

    /// Id of the watched queue document.
    const QUEUE_ID: &'static str;

    async fn dispatch(&self, item: Self::Item) -> Result<Value, DispatchError>;
}

/// Turns writes to a queue document into dispatched items.
///
/// Every observed snapshot with a non-empty `queue` is written back with an
/// empty queue, then each captured item is dispatched in its own task, in
/// array order. The empty-queue write comes back through the feed and
/// dispatches nothing. Items are never requeued.
pub struct QueueDrain<D> {
    store: Storage,
    dispatcher: Arc<D>,
}

impl<D: QueueDispatcher> QueueDrain<D> {
    pub fn new(store: Storage, dispatcher: D) -> Self {
        Self {
            store,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn spawn(self, feed: ChangeFeed) -> JoinHandle<()> {
        tokio::spawn(self.run(feed))
    }

    pub async fn run(self, mut feed: ChangeFeed) {
        info!(queue = D::QUEUE_ID, "queue drain armed");
        while let Some(change) = feed.next().await {
            self.handle_change(&change).await;
        }
        info!(queue = D::QUEUE_ID, "change feed closed; queue drain stopped");
    }

    /// Drain one change event. Returns the handles of the dispatch tasks it
    /// started; callers are free to drop them.
    pub async fn handle_change(&self, change: &ChangeEvent) -> Vec<JoinHandle<()>> {
        if change.id != D::QUEUE_ID || change.deleted {
            return Vec::new();
        }
        let Some(snapshot) = change.doc.as_ref() else {
            return Vec::new();
        };
        let items = snapshot.queue().to_vec();
        if items.is_empty() {
            return Vec::new();
        }

        let mut cleared = snapshot.clone();
        cleared.set_queue(Vec::new());
        match self.store.put(cleared).await {
            Ok(rev) => debug!(queue = D::QUEUE_ID, drained = items.len(), %rev, "queue cleared"),
            Err(err) if err.is_conflict() => warn!(
                queue = D::QUEUE_ID,
                %err,
                "queue was rewritten before it could be cleared"
            ),
            Err(err) => error!(queue = D::QUEUE_ID, %err, "failed to clear queue"),
        }

        items
            .into_iter()
            .enumerate()
            .filter_map(|(index, raw)| match serde_json::from_value::<D::Item>(raw) {
                Ok(item) => Some(self.spawn_dispatch(item)),
                Err(err) => {
                    warn!(queue = D::QUEUE_ID, index, %err, "skipping malformed queue item");
                    None
                }
            })
            .collect()
    }

    fn spawn_dispatch(&self, item: D::Item) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let described = format!("{item:?}");
            debug!(queue = D::QUEUE_ID, item = %described, "dispatching");
            match dispatcher.dispatch(item).await {
                Ok(result) => {
                    debug!(queue = D::QUEUE_ID, item = %described, %result, "dispatch completed")
                }
                Err(err) => error!(queue = D::QUEUE_ID, item = %described, %err, "dispatch failed"),
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
