use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;

use latticepaint::{
    approximate::{self, PaintingApproximator},
    config, graph, metrics,
    painting::{self, Coordinate, MatchStatus, Painting},
    protocol::{self, Multiplexer},
    report::TransactionReport,
    scaffold::{ScaffoldAssembler, SpendableOutput, TransactionAssembler},
    simulator,
};

#[derive(Parser)]
#[command(author, version, about = "latticepaint: vanity paths for painted grid graphs")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Suppress routine frame and per-vertex progress logs
    #[arg(long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Paint edges, search every vertex against the built-in simulator, then plan transactions
    Demo {
        /// Whitespace-separated edges, e.g. "0,0-1,0 1,0-2,0"
        #[arg(long)]
        edges: String,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
        /// Value of the funding output handed to the planner (sat)
        #[arg(long, default_value_t = 1_000_000)]
        fund: u64,
    },
    /// Group edges into trees and print vbyte / amount annotations
    Size {
        #[arg(long)]
        edges: String,
        /// Overrides fees.fee_per_vbyte
        #[arg(long)]
        fee_rate: Option<u64>,
    },
    /// Print connected components and a spanning tree of each
    Components {
        #[arg(long)]
        edges: String,
    },
}

fn load_config(path: &str) -> anyhow::Result<config::Config> {
    match config::load(path) {
        Ok(c) => Ok(c),
        Err(e1) => {
            // Embedded default keeps one-shot commands usable without a config file
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            eprintln!("⚠️  Could not read config from '{}': {}; using built-in defaults", path, e1);
            config::load_from_str(EMBEDDED_CONFIG)
                .map_err(|e2| anyhow::anyhow!("failed to load configuration: {} / {}", e1, e2))
        }
    }
}

fn paint(painting: &Painting, edges: &[(Coordinate, Coordinate)]) -> anyhow::Result<()> {
    for (a, b) in edges {
        painting
            .new_edge(*a, *b)
            .with_context(|| format!("cannot draw {:?}-{:?}", a, b))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.quiet {
        protocol::set_quiet_logging(true);
        approximate::set_quiet_logging(true);
    }
    let cfg = load_config(&cli.config)?;
    if cfg.metrics.enabled {
        metrics::serve(cfg.metrics.clone())?;
    }

    match &cli.cmd {
        Cmd::Size { edges, fee_rate } => {
            let edges = painting::parse_edge_list(edges)?;
            let painting = Painting::new(cfg.painting.rows, cfg.painting.columns, cfg.crypto_context());
            paint(&painting, &edges)?;
            let report = TransactionReport::new();
            for e in painting.edges() {
                report.append(&e);
            }
            let rate = fee_rate.unwrap_or(cfg.fees.fee_per_vbyte);
            let priced = report.priced_trees(cfg.fees.schedule(), rate)?;
            println!("🌳 {} tree(s), {} payment(s) at {} sat/vB", priced.len(), report.transaction_count(), rate);
            for tree in &priced {
                print!("{}", tree);
            }
        }
        Cmd::Components { edges } => {
            let edges = painting::parse_edge_list(edges)?;
            let g = graph::Graph::new(edges.iter().map(|(a, b)| graph::Edge::new(*a, *b)).collect());
            let components = graph::connected_components(&g);
            println!("🧩 {} component(s)", components.len());
            for (i, c) in components.iter().enumerate() {
                let Some(root) = c.vertices().first().copied() else { continue };
                let st = graph::spanning_tree(c, &root);
                println!("#{} ({} edge(s), spanning {} vertex(es))", i, c.len(), st.tree.len());
                let shown = st.tree.values().into_iter().map(|(x, y)| painting::vertex_key(*x, *y)).collect::<Vec<_>>();
                println!("   {}", shown.join(" "));
            }
        }
        Cmd::Demo { edges, timeout_secs, fund } => {
            let edges = painting::parse_edge_list(edges)?;
            let painting = Arc::new(Painting::new(cfg.painting.rows, cfg.painting.columns, cfg.crypto_context()));
            let report = TransactionReport::follow(painting.clone());
            let link = simulator::spawn(Duration::from_millis(cfg.search.step_millis), cfg.search.protocol_version);
            let mux = Multiplexer::spawn(link.outbound, link.inbound, cfg.search.protocol_version);
            let approximator = PaintingApproximator::spawn(painting.clone(), mux);

            paint(&painting, &edges)?;
            println!("🎨 Painted {} edge(s) over {} vertex(es)", painting.edge_count(), painting.vertex_count());

            let deadline = tokio::time::Instant::now() + Duration::from_secs(*timeout_secs);
            loop {
                let settled = painting.vertices().iter().all(|v| v.is_perfect())
                    && report.edges_folded() == painting.edge_count();
                if settled || tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            for v in approximator.snapshot().await? {
                let status = painting.vertex(&v.key).map(|x| x.status()).unwrap_or(MatchStatus::Unmatched);
                let path = v.approximation.map(|a| a.derivation_path).unwrap_or_else(|| "-".into());
                println!("   {:<10} {:?}/{:?}  {}", v.key, v.state, status, path);
            }

            let cc = painting.crypto_context();
            let funding = SpendableOutput {
                txid: hex::encode(blake3::hash(cc.xpub.as_bytes()).as_bytes()),
                vout: 0,
                value: *fund,
            };
            for tree in report.priced_trees(cfg.fees.schedule(), cfg.fees.fee_per_vbyte)? {
                print!("{}", tree);
                match ScaffoldAssembler.assemble(cc.asset, &cc.xpub, &tree, std::slice::from_ref(&funding)) {
                    Ok(plan) => {
                        for tx in plan {
                            let outs: Vec<String> = tx.outs.iter().map(|o| format!("{}:{}", o.to, o.amount)).collect();
                            println!("   tx#{} ← {} → [{}]", tx.id, input_label(&tx.input), outs.join(", "));
                        }
                    }
                    Err(e) => eprintln!("❌ Could not plan transactions: {}", e),
                }
            }
            approximator.shutdown();
        }
    }
    Ok(())
}

fn input_label<T: std::fmt::Display>(input: &latticepaint::scaffold::InputScaffold<T>) -> String {
    match input {
        latticepaint::scaffold::InputScaffold::Init { from, outpoint } => format!("{} @ {}:{}", from, &outpoint.txid[..8], outpoint.vout),
        latticepaint::scaffold::InputScaffold::Prev { prev_scaffold_id, vout, from } => format!("{} @ tx#{}:{}", from, prev_scaffold_id, vout),
    }
}
