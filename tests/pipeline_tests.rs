// End-to-end pipeline tests
// Painting, grouping and searching wired together against the built-in simulator.

use latticepaint::approximate::PaintingApproximator;
use latticepaint::painting::{Asset, CryptoContext, Painting};
use latticepaint::protocol::Multiplexer;
use latticepaint::report::TransactionReport;
use latticepaint::scaffold::{InputScaffold, ScaffoldAssembler, SpendableOutput, TransactionAssembler};
use latticepaint::simulator;
use latticepaint::sizer::FeeSchedule;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const XPUB: &str = "tpubD6NzVbkrYhZ4XgiXtGrdW5XDAPFCL9h7we1vwNCpn8tGbBcgfVYjXyhWo4E1xkh56hjod1RhGjxbaTLV3X4FyWuejifB9jusQ46QzG87VKp";

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

#[tokio::test]
async fn painted_chain_is_searched_grouped_and_planned() {
    println!("🧪 Testing the full paint → search → plan pipeline...");
    let painting = Arc::new(Painting::new(8, 8, CryptoContext { asset: Asset::Tbtc, xpub: XPUB.into() }));
    let report = TransactionReport::follow(painting.clone());
    let link = simulator::spawn(Duration::from_millis(5), 1);
    let log = link.log.clone();
    let mux = Multiplexer::spawn(link.outbound, link.inbound, 1);
    let approximator = PaintingApproximator::spawn(painting.clone(), mux.clone());

    painting.new_edge((0, 0), (1, 0)).unwrap();
    painting.new_edge((1, 0), (2, 0)).unwrap();

    eventually("every vertex matched", || painting.vertices().iter().all(|v| v.is_perfect())).await;
    eventually("every edge grouped", || report.edges_folded() == 2).await;
    eventually("every matched stream cancelled", || log.lock().unwrap().cancels.len() == 3).await;

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.requests.len(), 3);
    let unique: HashSet<&String> = seen.cancels.iter().collect();
    assert_eq!(unique.len(), 3, "one cancel per topic");
    for (topic, req) in &seen.requests {
        assert!(seen.cancels.contains(topic));
        let (path, _) = simulator::plan_for(req);
        let v = painting.vertex_at((req.vertex[0], req.vertex[1])).unwrap();
        assert!(v.best_approximation().unwrap().derivation_path.starts_with(&path));
    }
    assert_eq!(mux.open_topics(), 0);

    let trees = report.trees();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].src.key, "(0, 0)");
    assert_eq!(report.transaction_count(), 1);

    let priced = report.priced_trees(FeeSchedule::default(), 3).unwrap();
    assert_eq!(priced[0].bytes_at_and_below, Some(374));
    assert_eq!(priced[0].amount, Some(3 * 374));

    let funding = SpendableOutput { txid: "ab".repeat(32), vout: 1, value: 10_000 };
    let plan = ScaffoldAssembler.assemble(Asset::Tbtc, XPUB, &priced[0], &[funding]).unwrap();
    assert_eq!(plan.len(), 2);
    assert!(matches!(&plan[0].input, InputScaffold::Init { outpoint, .. } if outpoint.vout == 1));
    assert!(matches!(&plan[1].input, InputScaffold::Prev { prev_scaffold_id, .. } if *prev_scaffold_id == plan[0].id));

    approximator.shutdown();
    println!("✅ Pipeline verified");
}

#[tokio::test]
async fn empty_xpub_fails_every_vertex() {
    let painting = Arc::new(Painting::new(8, 8, CryptoContext { asset: Asset::Btc, xpub: String::new() }));
    let link = simulator::spawn(Duration::from_millis(5), 1);
    let mux = Multiplexer::spawn(link.outbound, link.inbound, 1);
    let approximator = PaintingApproximator::spawn(painting.clone(), mux);
    let mut failures = approximator.subscribe_failures();

    painting.new_edge((4, 4), (4, 5)).unwrap();
    let mut failed = HashSet::new();
    while failed.len() < 2 {
        let f = timeout(Duration::from_secs(2), failures.recv()).await.unwrap().unwrap();
        assert!(f.reason.contains("400"), "unexpected reason {}", f.reason);
        failed.insert(f.vertex);
    }
    assert!(painting.vertices().iter().all(|v| v.best_approximation().is_none()));

    // a usable context brings them back
    painting.set_crypto_context(CryptoContext { asset: Asset::Btc, xpub: XPUB.into() });
    eventually("vertices match after context fix", || painting.vertices().iter().all(|v| v.is_perfect())).await;
    approximator.shutdown();
}

#[tokio::test]
async fn report_follows_edges_painted_before_and_after() {
    let painting = Arc::new(Painting::new(8, 8, CryptoContext { asset: Asset::Tbtc, xpub: XPUB.into() }));
    painting.new_edge((0, 0), (0, 1)).unwrap();
    let report = TransactionReport::follow(painting.clone());
    assert_eq!(report.edges_folded(), 1);

    let mut count = report.watch_transaction_count();
    painting.new_edge((6, 6), (6, 7)).unwrap();
    timeout(Duration::from_secs(2), count.changed()).await.unwrap().unwrap();
    assert_eq!(*count.borrow(), 2);

    painting.new_edge((0, 1), (6, 6)).unwrap();
    eventually("bridge folded", || report.edges_folded() == 3).await;
    assert_eq!(report.transaction_count(), 1);
    assert_eq!(report.trees()[0].len(), 4);

    // repainting an existing edge is not a new event
    painting.new_edge((0, 1), (0, 0)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(report.edges_folded(), 3);
}
