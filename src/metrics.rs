use anyhow::Result;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::thread;

use crate::approximate::SearchState;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    // Prefix metrics with `latticepaint_` for better namespacing.
    pub static ref STREAMS_OPENED: IntCounter =
        counter("latticepaint_streams_opened_total", "Approximation streams opened");
    pub static ref STREAMS_CANCELLED: IntCounter =
        counter("latticepaint_streams_cancelled_total", "Approximation streams torn down");
    pub static ref STREAM_FAILURES: IntCounter =
        counter("latticepaint_stream_failures_total", "Streams that failed or ended without a match");
    pub static ref VERTICES_SEARCHING: IntGauge =
        gauge("latticepaint_vertices_searching", "Vertices with a live search");
    pub static ref VERTICES_MATCHED: IntGauge =
        gauge("latticepaint_vertices_matched", "Vertices with an exact derivation path");
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("valid metric name");
    // a second registration only happens if the name is reused; keep the metric usable either way
    let _ = REGISTRY.register(Box::new(c.clone()));
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("valid metric name");
    let _ = REGISTRY.register(Box::new(g.clone()));
    g
}

/// Keep the state gauges in step with one vertex moving `from` → `to`.
pub fn record_transition(from: SearchState, to: SearchState) {
    if from == to {
        return;
    }
    match from {
        SearchState::Searching => VERTICES_SEARCHING.dec(),
        SearchState::Matched => VERTICES_MATCHED.dec(),
        _ => {}
    }
    match to {
        SearchState::Searching => VERTICES_SEARCHING.inc(),
        SearchState::Matched => VERTICES_MATCHED.inc(),
        SearchState::Failed => STREAM_FAILURES.inc(),
        _ => {}
    }
}

/// Text exposition of every registered metric.
pub fn gather_text() -> Result<String> {
    let mut buffer = vec![];
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    // force registration before the first scrape
    lazy_static::initialize(&STREAMS_OPENED);
    lazy_static::initialize(&STREAMS_CANCELLED);
    lazy_static::initialize(&STREAM_FAILURES);
    lazy_static::initialize(&VERTICES_SEARCHING);
    lazy_static::initialize(&VERTICES_MATCHED);

    let header: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("bad metrics content-type header"))?;
    let bind_addr = cfg.bind.clone();
    thread::spawn(move || {
        let server = match tiny_http::Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("🔥 Could not start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };
        println!("📈 Metrics on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let body = match gather_text() {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("🔥 Could not encode metrics: {}", e);
                    continue;
                }
            };
            let response = tiny_http::Response::from_string(body).with_header(header.clone());
            let _ = request.respond(response);
        }
    });

    Ok(())
}
