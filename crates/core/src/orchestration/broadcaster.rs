//! # Status Broadcaster
//!
//! In-process fan-out of lifecycle events. Subscribers are transport handles
//! (WebSocket connections, test sinks) keyed by evaluation. A handle whose
//! send fails is treated as stale and dropped from every evaluation.
//!
//! The registry is process-local: subscribers on another process never see
//! events caused here.

use super::events::StatusEvent;
use crate::state::{Evaluation, EvaluationStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type SinkId = u64;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique handle id
pub fn next_sink_id() -> SinkId {
    NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// A transport handle events can be pushed to
#[async_trait]
pub trait EventSink: Send + Sync {
    fn id(&self) -> SinkId;

    async fn send(&self, event: &StatusEvent) -> Result<()>;
}

/// Sink backed by a bounded channel; the transport drains the receiver.
/// A full or closed channel counts as a failed send.
pub struct ChannelSink {
    id: SinkId,
    tx: mpsc::Sender<StatusEvent>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Arc::new(Self {
                id: next_sink_id(),
                tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn id(&self) -> SinkId {
        self.id
    }

    async fn send(&self, event: &StatusEvent) -> Result<()> {
        self.tx
            .try_send(event.clone())
            .map_err(|e| anyhow::anyhow!("Subscriber {} unavailable: {}", self.id, e))
    }
}

type Subscribers = HashMap<SinkId, Arc<dyn EventSink>>;

#[derive(Default)]
pub struct StatusBroadcaster {
    subscriptions: RwLock<HashMap<i64, Subscribers>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, sink: Arc<dyn EventSink>, evaluation_id: i64) {
        let mut subs = self.subscriptions.write().await;
        tracing::debug!("Sink {} subscribed to evaluation {}", sink.id(), evaluation_id);
        subs.entry(evaluation_id).or_default().insert(sink.id(), sink);
    }

    pub async fn unsubscribe(&self, sink_id: SinkId, evaluation_id: i64) {
        let mut subs = self.subscriptions.write().await;
        if let Some(set) = subs.get_mut(&evaluation_id) {
            set.remove(&sink_id);
            if set.is_empty() {
                subs.remove(&evaluation_id);
            }
        }
    }

    /// Drop a handle from every evaluation (disconnect)
    pub async fn remove(&self, sink_id: SinkId) {
        let mut subs = self.subscriptions.write().await;
        Self::purge(&mut subs, &[sink_id]);
    }

    pub async fn subscriber_count(&self, evaluation_id: i64) -> usize {
        self.subscriptions
            .read()
            .await
            .get(&evaluation_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Send a status event; after a terminal status also send `close` and
    /// forget the evaluation's subscribers. Never fails.
    ///
    /// On a terminal status the subscriber set is taken out of the registry
    /// before anything is sent, so every handle that saw the status also
    /// sees `close`.
    pub async fn publish(
        &self,
        evaluation_id: i64,
        status: EvaluationStatus,
        updated_at: Option<DateTime<Utc>>,
    ) {
        let event = StatusEvent::status(evaluation_id, status, updated_at);

        if !status.is_terminal() {
            let targets: Vec<Arc<dyn EventSink>> = {
                let subs = self.subscriptions.read().await;
                match subs.get(&evaluation_id) {
                    Some(set) => set.values().cloned().collect(),
                    None => return,
                }
            };
            self.deliver(&targets, &event).await;
            return;
        }

        let Some(set) = self.subscriptions.write().await.remove(&evaluation_id) else {
            return;
        };
        let targets: Vec<Arc<dyn EventSink>> = set.into_values().collect();
        let reachable = self.deliver(&targets, &event).await;
        self.deliver(&reachable, &StatusEvent::close(evaluation_id))
            .await;
    }

    pub async fn publish_evaluation(&self, evaluation: &Evaluation) {
        self.publish(evaluation.id, evaluation.status, Some(evaluation.updated_at))
            .await;
    }

    /// Send to each target without holding the registry lock. Failed sinks
    /// are purged everywhere; the ones that accepted the event are returned.
    async fn deliver(
        &self,
        targets: &[Arc<dyn EventSink>],
        event: &StatusEvent,
    ) -> Vec<Arc<dyn EventSink>> {
        let mut reachable = Vec::with_capacity(targets.len());
        let mut stale = Vec::new();
        for sink in targets {
            match sink.send(event).await {
                Ok(()) => reachable.push(Arc::clone(sink)),
                Err(e) => {
                    tracing::debug!("Dropping stale subscriber {}: {}", sink.id(), e);
                    stale.push(sink.id());
                }
            }
        }

        if !stale.is_empty() {
            let mut subs = self.subscriptions.write().await;
            Self::purge(&mut subs, &stale);
        }
        reachable
    }

    fn purge(subs: &mut HashMap<i64, Subscribers>, sink_ids: &[SinkId]) {
        subs.retain(|_, set| {
            for id in sink_ids {
                set.remove(id);
            }
            !set.is_empty()
        });
    }
}
