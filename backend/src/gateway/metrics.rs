//! Batching of per-request node metrics before persistence.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::store::MetricsStore;

/// One metrics delta for a node.
///
/// Counter fields add up when folded. Scalar fields keep the latest value
/// that was actually set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsIncrement {
    pub node_id: String,
    pub requests_served: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
    pub time_to_first_token: Option<f64>,
    pub inference_tokens_per_second: Option<f64>,
    pub rtt: Option<f64>,
    pub uptime: u64,
}

impl MetricsIncrement {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Fold a later increment for the same node into this one.
    pub fn merge(&mut self, later: &MetricsIncrement) {
        self.requests_served += later.requests_served;
        self.requests_successful += later.requests_successful;
        self.requests_failed += later.requests_failed;
        self.uptime += later.uptime;
        if later.time_to_first_token.is_some() {
            self.time_to_first_token = later.time_to_first_token;
        }
        if later.inference_tokens_per_second.is_some() {
            self.inference_tokens_per_second = later.inference_tokens_per_second;
        }
        if later.rtt.is_some() {
            self.rtt = later.rtt;
        }
    }
}

/// Fold increments by node id, keeping first-seen node order.
pub fn fold(increments: Vec<MetricsIncrement>) -> Vec<MetricsIncrement> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut folded: Vec<MetricsIncrement> = Vec::new();
    for increment in increments {
        match index.get(&increment.node_id) {
            Some(&i) => folded[i].merge(&increment),
            None => {
                index.insert(increment.node_id.clone(), folded.len());
                folded.push(increment);
            }
        }
    }
    folded
}

/// Producer handle for the metrics queue.
#[derive(Debug, Clone)]
pub struct MetricsSender {
    tx: mpsc::Sender<MetricsIncrement>,
}

impl MetricsSender {
    /// Enqueue without waiting. A full or closed queue drops the increment.
    pub fn submit(&self, increment: MetricsIncrement) {
        if let Err(e) = self.tx.try_send(increment) {
            let node_id = match &e {
                mpsc::error::TrySendError::Full(i) | mpsc::error::TrySendError::Closed(i) => {
                    i.node_id.clone()
                }
            };
            tracing::warn!(node_id = %node_id, "Metrics increment dropped: {}", e);
        }
    }
}

/// Consumer side: drains the queue in batches and persists folded totals.
pub struct MetricsAggregator {
    store: Arc<dyn MetricsStore>,
    rx: mpsc::Receiver<MetricsIncrement>,
    batch_size: usize,
}

impl MetricsAggregator {
    pub fn channel(
        store: Arc<dyn MetricsStore>,
        batch_size: usize,
        capacity: usize,
    ) -> (Self, MetricsSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let aggregator = Self {
            store,
            rx,
            batch_size: batch_size.max(1),
        };
        (aggregator, MetricsSender { tx })
    }

    /// Wait for one increment, then take whatever else is already queued, up
    /// to the batch size. `None` once every sender is gone.
    pub async fn next_batch(&mut self) -> Option<Vec<MetricsIncrement>> {
        let first = self.rx.recv().await?;
        let mut batch = Vec::with_capacity(self.batch_size);
        batch.push(first);
        while batch.len() < self.batch_size {
            match self.rx.try_recv() {
                Ok(increment) => batch.push(increment),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Fold and persist one batch. Returns how many nodes failed.
    pub async fn flush(&self, batch: Vec<MetricsIncrement>) -> usize {
        let received = batch.len();
        let folded = fold(batch);
        let failures = self.store.increment_bulk(&folded).await;
        for (node_id, e) in &failures {
            tracing::error!(node_id = %node_id, "Failed to persist metrics: {}", e);
        }
        tracing::debug!(
            received,
            nodes = folded.len(),
            failed = failures.len(),
            "Metrics batch flushed"
        );
        failures.len()
    }

    pub async fn run(mut self) {
        tracing::info!(batch_size = self.batch_size, "Metrics aggregator started");
        while let Some(batch) = self.next_batch().await {
            self.flush(batch).await;
        }
        tracing::info!("Metrics aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn served(node_id: &str, ok: u64, failed: u64) -> MetricsIncrement {
        MetricsIncrement {
            requests_served: ok + failed,
            requests_successful: ok,
            requests_failed: failed,
            ..MetricsIncrement::new(node_id)
        }
    }

    #[test]
    fn test_fold_groups_by_node_in_order() {
        let folded = fold(vec![
            served("b", 1, 0),
            served("a", 0, 1),
            served("b", 2, 1),
        ]);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].node_id, "b");
        assert_eq!(folded[0].requests_served, 4);
        assert_eq!(folded[0].requests_successful, 3);
        assert_eq!(folded[0].requests_failed, 1);
        assert_eq!(folded[1].node_id, "a");
    }

    #[test]
    fn test_fold_keeps_latest_non_null_scalar() {
        let mut first = MetricsIncrement::new("n");
        first.rtt = Some(10.0);
        first.time_to_first_token = Some(0.5);
        let mut second = MetricsIncrement::new("n");
        second.rtt = Some(20.0);
        let third = MetricsIncrement::new("n");

        let folded = fold(vec![first, second, third]);
        assert_eq!(folded[0].rtt, Some(20.0));
        assert_eq!(folded[0].time_to_first_token, Some(0.5));
        assert_eq!(folded[0].inference_tokens_per_second, None);
    }

    #[tokio::test]
    async fn test_one_pass_matches_two_passes() {
        let mut a = served("n", 1, 0);
        a.uptime = 5;
        a.rtt = Some(12.0);
        let mut b = served("n", 0, 1);
        b.uptime = 7;
        b.rtt = Some(30.0);

        let together = Arc::new(MemoryStore::new());
        let (agg, _tx) = MetricsAggregator::channel(together.clone(), 100, 16);
        agg.flush(vec![a.clone(), b.clone()]).await;

        let separately = Arc::new(MemoryStore::new());
        let (agg2, _tx2) = MetricsAggregator::channel(separately.clone(), 100, 16);
        agg2.flush(vec![a]).await;
        agg2.flush(vec![b]).await;

        assert_eq!(
            together.metrics_for("n").await,
            separately.metrics_for("n").await
        );
        let totals = together.metrics_for("n").await.unwrap();
        assert_eq!(totals.requests_served, 2);
        assert_eq!(totals.uptime, 12);
        assert_eq!(totals.rtt, Some(30.0));
    }

    #[tokio::test]
    async fn test_failing_node_does_not_discard_batch() {
        let store = Arc::new(MemoryStore::new());
        store.fail_metrics_for("bad").await;
        let (agg, _tx) = MetricsAggregator::channel(store.clone(), 100, 16);

        let failed = agg
            .flush(vec![served("bad", 1, 0), served("good", 1, 0)])
            .await;
        assert_eq!(failed, 1);
        assert_eq!(store.metrics_for("good").await.unwrap().requests_served, 1);
    }

    #[tokio::test]
    async fn test_next_batch_respects_batch_size() {
        let store = Arc::new(MemoryStore::new());
        let (mut agg, tx) = MetricsAggregator::channel(store, 3, 16);
        for _ in 0..5 {
            tx.submit(served("n", 1, 0));
        }
        assert_eq!(agg.next_batch().await.unwrap().len(), 3);
        assert_eq!(agg.next_batch().await.unwrap().len(), 2);
        drop(tx);
        assert!(agg.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_run_persists_until_senders_close() {
        let store = Arc::new(MemoryStore::new());
        let (agg, tx) = MetricsAggregator::channel(store.clone(), 10, 16);
        tx.submit(served("n", 1, 0));
        tx.submit(served("n", 0, 1));
        drop(tx);

        agg.run().await;
        let totals = store.metrics_for("n").await.unwrap();
        assert_eq!(totals.requests_served, 2);
        assert_eq!(totals.requests_failed, 1);
    }

    #[tokio::test]
    async fn test_submit_drops_when_full() {
        let store = Arc::new(MemoryStore::new());
        let (mut agg, tx) = MetricsAggregator::channel(store, 10, 1);
        tx.submit(served("n", 1, 0));
        tx.submit(served("n", 1, 0));
        drop(tx);
        assert_eq!(agg.next_batch().await.unwrap().len(), 1);
        assert!(agg.next_batch().await.is_none());
    }
}
