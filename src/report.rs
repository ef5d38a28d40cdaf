//! Groups drawn edges into transaction trees as they arrive.

use crate::graph::{Grouping, StarForest, StarTree};
use crate::painting::{Edge, Painting, Vertex};
use crate::sizer::{FeeSchedule, SizedTree, TransactionWriter};
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

pub type VertexTree = StarTree<Arc<Vertex>>;

struct Grouped {
    forest: StarForest<Arc<Vertex>>,
    edges_folded: usize,
}

/// Forest of star-trees over the painting's vertices. One writer folds edges
/// in arrival order; readers take snapshots.
#[derive(Clone)]
pub struct TransactionReport {
    inner: Arc<Mutex<Grouped>>,
    transaction_count: Arc<watch::Sender<usize>>,
    following: Arc<watch::Sender<bool>>,
}

impl Default for TransactionReport {
    fn default() -> Self {
        let (transaction_count, _) = watch::channel(0);
        let (following, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Grouped { forest: StarForest::new(), edges_folded: 0 })),
            transaction_count: Arc::new(transaction_count),
            following: Arc::new(following),
        }
    }
}

impl TransactionReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold every existing and future edge of `painting` into a new report.
    /// The follower does not keep the painting alive; it stops once the
    /// painting is dropped.
    pub fn follow(painting: Arc<Painting>) -> Self {
        let report = Self::new();
        let (backlog, mut edge_rx) = painting.watch_edges();
        for e in &backlog {
            report.append(e);
        }
        report.following.send_replace(true);
        let writer = report.clone();
        let painting: Weak<Painting> = Arc::downgrade(&painting);
        tokio::spawn(async move {
            loop {
                match edge_rx.recv().await {
                    Ok(e) => {
                        writer.append(&e);
                    }
                    Err(RecvError::Lagged(n)) => {
                        let Some(painting) = painting.upgrade() else { break };
                        // edges() is in arrival order, so a replay reproduces the same grouping
                        eprintln!("⚠️  Missed {} edge event(s); regrouping from painting", n);
                        writer.rebuild(&painting.edges());
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            writer.following.send_replace(false);
        });
        report
    }

    /// False once a follower has stopped because its painting went away.
    pub fn is_following(&self) -> bool {
        *self.following.borrow()
    }

    pub fn watch_following(&self) -> watch::Receiver<bool> {
        self.following.subscribe()
    }

    fn grouped(&self) -> MutexGuard<'_, Grouped> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, e: &Edge) -> Grouping {
        let mut g = self.grouped();
        let outcome = g.forest.append(&e.to_graph_edge());
        g.edges_folded += 1;
        self.transaction_count.send_replace(g.forest.transaction_count());
        outcome
    }

    fn rebuild(&self, edges: &[Arc<Edge>]) {
        let mut g = self.grouped();
        g.forest = StarForest::new();
        for e in edges {
            g.forest.append(&e.to_graph_edge());
        }
        g.edges_folded = edges.len();
        self.transaction_count.send_replace(g.forest.transaction_count());
    }

    pub fn trees(&self) -> Vec<VertexTree> {
        self.grouped().forest.trees().to_vec()
    }

    pub fn edges_folded(&self) -> usize {
        self.grouped().edges_folded
    }

    pub fn transaction_count(&self) -> usize {
        *self.transaction_count.borrow()
    }

    pub fn watch_transaction_count(&self) -> watch::Receiver<usize> {
        self.transaction_count.subscribe()
    }

    /// Size and price every tree at `fee_per_vbyte`.
    pub fn priced_trees(&self, schedule: FeeSchedule, fee_per_vbyte: u64) -> Result<Vec<SizedTree<Arc<Vertex>>>> {
        self.trees()
            .iter()
            .map(|t| {
                let mut writer = TransactionWriter::new(t, schedule);
                writer.tag_with_vbytes_beneath()?;
                writer.tag_with_amounts(fee_per_vbyte)?;
                Ok(writer.into_tree())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::painting::{Asset, CryptoContext};

    fn painting() -> Painting {
        Painting::new(8, 8, CryptoContext { asset: Asset::Tbtc, xpub: "tpub".into() })
    }

    #[test]
    fn chain_of_edges_is_one_tree() {
        let p = painting();
        let report = TransactionReport::new();
        report.append(&p.new_edge((0, 0), (1, 0)).unwrap());
        report.append(&p.new_edge((1, 0), (2, 0)).unwrap());

        let trees = report.trees();
        assert_eq!(trees.len(), 1);
        let keys: Vec<&str> = trees[0].values().into_iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["(0, 0)", "(1, 0)", "(2, 0)"]);
        assert_eq!(trees[0].tree[0].tree[0].src.key, "(2, 0)");
        assert_eq!(report.transaction_count(), 1);
    }

    #[test]
    fn disjoint_strokes_stay_separate_until_bridged() {
        let p = painting();
        let report = TransactionReport::new();
        report.append(&p.new_edge((0, 0), (0, 1)).unwrap());
        report.append(&p.new_edge((5, 5), (5, 6)).unwrap());
        assert_eq!(report.trees().len(), 2);
        assert_eq!(report.transaction_count(), 2);

        let outcome = report.append(&p.new_edge((0, 1), (5, 5)).unwrap());
        assert_eq!(outcome, Grouping::Merged { into: 0, absorbed: 1 });
        assert_eq!(report.trees().len(), 1);
        assert_eq!(report.trees()[0].len(), 4);
    }

    #[test]
    fn priced_trees_cover_the_forest() {
        let p = painting();
        let report = TransactionReport::new();
        report.append(&p.new_edge((0, 0), (1, 0)).unwrap());
        report.append(&p.new_edge((0, 0), (0, 1)).unwrap());
        let priced = report.priced_trees(FeeSchedule::default(), 2).unwrap();
        assert_eq!(priced.len(), 1);
        assert_eq!(priced[0].bytes_at_and_below, Some(10 + 68 + (151 + 31) * 2));
        assert_eq!(priced[0].amount, Some(2 * (10 + 68 + (151 + 31) * 2)));
    }

    #[test]
    fn priced_trees_reject_overflowing_rates() {
        let p = painting();
        let report = TransactionReport::new();
        report.append(&p.new_edge((0, 0), (1, 0)).unwrap());
        assert!(report.priced_trees(FeeSchedule::default(), u64::MAX).is_err());
    }

    #[tokio::test]
    async fn follower_stops_when_painting_is_dropped() {
        let p = Arc::new(painting());
        p.new_edge((0, 0), (1, 0)).unwrap();
        let report = TransactionReport::follow(p.clone());
        assert!(report.is_following());
        let mut following = report.watch_following();

        let weak = Arc::downgrade(&p);
        drop(p);
        assert!(weak.upgrade().is_none(), "the follower must not keep the painting alive");

        tokio::time::timeout(std::time::Duration::from_secs(2), following.wait_for(|f| !*f))
            .await
            .expect("follower never stopped")
            .unwrap();
        assert!(!report.is_following());
        assert_eq!(report.edges_folded(), 1);
    }
}
