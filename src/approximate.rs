//! Approximation coordinator: one search stream per vertex, restarted whenever
//! the crypto context changes or a re-approximation is requested.
//!
//! The coordinator task exclusively owns every [`VertexApproximator`]; vertices
//! hold no reference back to their search. Results are written to the vertex's
//! `best_approximation` cell, last write wins, and an exact match (distance 0)
//! cancels the stream and ends the search for that vertex.

use crate::metrics;
use crate::painting::{CryptoContext, Painting, Vertex};
use crate::protocol::{ApproximationRequest, Multiplexer};
use anyhow::{anyhow, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

static QUIET_APPROX: AtomicBool = AtomicBool::new(false);
/// Toggle routine per-vertex progress logs. Failures still log.
pub fn set_quiet_logging(quiet: bool) {
    QUIET_APPROX.store(quiet, Ordering::Relaxed);
}

macro_rules! approx_log {
    ($($arg:tt)*) => {
        if !QUIET_APPROX.load(Ordering::Relaxed) {
            println!($($arg)*);
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Searching,
    Matched,
    Cancelled,
    Failed,
}

/// One-shot notice that a vertex's search stopped without a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproximationFailure {
    pub vertex: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct VertexReport {
    pub key: String,
    pub state: SearchState,
    pub approximation: Option<crate::protocol::Approximation>,
}

enum Command {
    ReApproximateAll,
    ReApproximate(String),
    Snapshot(oneshot::Sender<Vec<VertexReport>>),
    Shutdown,
}

fn transition(state: &watch::Sender<SearchState>, next: SearchState) {
    let prev = state.send_replace(next);
    metrics::record_transition(prev, next);
}

fn lock_generation(g: &Mutex<u64>) -> MutexGuard<'_, u64> {
    g.lock().unwrap_or_else(PoisonError::into_inner)
}

struct VertexApproximator {
    vertex: Arc<Vertex>,
    dimensions: [u32; 2],
    state: Arc<watch::Sender<SearchState>>,
    // Bumped under the lock before every restart; a task only writes while its
    // generation is current.
    generation: Arc<Mutex<u64>>,
    task: Option<JoinHandle<()>>,
}

impl VertexApproximator {
    fn new(vertex: Arc<Vertex>, dimensions: [u32; 2]) -> Self {
        let (state, _) = watch::channel(SearchState::Idle);
        Self { vertex, dimensions, state: Arc::new(state), generation: Arc::new(Mutex::new(0)), task: None }
    }

    fn state(&self) -> SearchState {
        *self.state.borrow()
    }

    /// Invalidate the running search. Dropping its stream sends the cancel frame.
    fn stop(&mut self) -> u64 {
        let generation = {
            let mut g = lock_generation(&self.generation);
            *g += 1;
            *g
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }
        generation
    }

    fn cancel(&mut self) {
        self.stop();
        if self.state() == SearchState::Searching {
            transition(&self.state, SearchState::Cancelled);
        }
    }

    /// Forget results found under a previous context.
    fn reset(&mut self) {
        self.stop();
        self.vertex.next_approximation(None);
        transition(&self.state, SearchState::Idle);
    }

    fn approximate(&mut self, mux: &Multiplexer, cc: &CryptoContext, failures: &broadcast::Sender<ApproximationFailure>) {
        approx_log!("🔭 Approximating {}", self.vertex.key);
        let generation = self.stop();
        let request = ApproximationRequest {
            xpub: cc.xpub.clone(),
            asset: cc.asset,
            dimensions: self.dimensions,
            vertex: [self.vertex.x, self.vertex.y],
        };
        let mut stream = match mux.approximate(&request) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("❌ Failed to approximate {}: {}", self.vertex.key, e);
                transition(&self.state, SearchState::Failed);
                let _ = failures.send(ApproximationFailure { vertex: self.vertex.key.clone(), reason: e.to_string() });
                return;
            }
        };
        transition(&self.state, SearchState::Searching);

        let vertex = self.vertex.clone();
        let state = self.state.clone();
        let live = self.generation.clone();
        let failures = failures.clone();
        self.task = Some(tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(approximation)) => {
                        let live = lock_generation(&live);
                        if *live != generation {
                            return;
                        }
                        let exact = approximation.is_exact();
                        if exact {
                            stream.cancel();
                        }
                        approx_log!("🎯 {} → {} (distance {})", vertex.key, approximation.derivation_path, approximation.distance_from_target);
                        vertex.next_approximation(Some(approximation));
                        if exact {
                            transition(&state, SearchState::Matched);
                            approx_log!("✅ {} matched exactly", vertex.key);
                            return;
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended without a result".to_string(),
                }
            };
            let live = lock_generation(&live);
            if *live != generation {
                return;
            }
            eprintln!("❌ Failed to approximate {}: {}", vertex.key, reason);
            transition(&state, SearchState::Failed);
            let _ = failures.send(ApproximationFailure { vertex: vertex.key.clone(), reason });
        }));
    }
}

/// Handle on a running coordinator. Clones share the same coordinator.
#[derive(Clone)]
pub struct ApproximatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    failures: broadcast::Sender<ApproximationFailure>,
    states: Arc<Mutex<HashMap<String, watch::Receiver<SearchState>>>>,
}

impl ApproximatorHandle {
    /// Restart every vertex that has not matched exactly.
    pub fn re_approximate_all(&self) {
        let _ = self.commands.send(Command::ReApproximateAll);
    }

    /// Restart one vertex, whatever its state.
    pub fn re_approximate(&self, key: &str) {
        let _ = self.commands.send(Command::ReApproximate(key.to_string()));
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<ApproximationFailure> {
        self.failures.subscribe()
    }

    /// Search state of `key`, once the coordinator has seen that vertex.
    pub fn watch_state(&self, key: &str) -> Option<watch::Receiver<SearchState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub async fn snapshot(&self) -> Result<Vec<VertexReport>> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).map_err(|_| anyhow!("approximator has shut down"))?;
        rx.await.map_err(|_| anyhow!("approximator has shut down"))
    }

    /// Cancel every search and stop the coordinator.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct PaintingApproximator {
    painting: Arc<Painting>,
    mux: Multiplexer,
    crypto_context: CryptoContext,
    approximators: HashMap<String, VertexApproximator>,
    order: Vec<String>,
    failures: broadcast::Sender<ApproximationFailure>,
    states: Arc<Mutex<HashMap<String, watch::Receiver<SearchState>>>>,
}

impl PaintingApproximator {
    /// Start following `painting`: every existing and future vertex gets a
    /// search under the painting's current crypto context.
    pub fn spawn(painting: Arc<Painting>, mux: Multiplexer) -> ApproximatorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(256);
        let states = Arc::new(Mutex::new(HashMap::new()));
        let handle = ApproximatorHandle { commands: command_tx, failures: failures.clone(), states: states.clone() };

        let (backlog, vertex_rx) = painting.watch_vertices();
        let mut cc_rx = painting.watch_crypto_context();
        let crypto_context = cc_rx.borrow_and_update().clone();
        let coordinator = PaintingApproximator {
            painting,
            mux,
            crypto_context,
            approximators: HashMap::new(),
            order: Vec::new(),
            failures,
            states,
        };
        tokio::spawn(coordinator.run(backlog, vertex_rx, cc_rx, command_rx));
        handle
    }

    async fn run(
        mut self,
        backlog: Vec<Arc<Vertex>>,
        mut vertex_rx: broadcast::Receiver<Arc<Vertex>>,
        mut cc_rx: watch::Receiver<CryptoContext>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        for v in backlog {
            self.add_vertex(v);
        }
        let mut vertices_open = true;
        loop {
            tokio::select! {
                changed = cc_rx.changed() => {
                    if changed.is_err() { break; }
                    self.crypto_context = cc_rx.borrow_and_update().clone();
                    println!("🔑 Crypto context changed ({:?}); restarting {} search(es)", self.crypto_context.asset, self.approximators.len());
                    for a in self.approximators.values_mut() {
                        a.reset();
                    }
                    self.re_approximate_all();
                }
                received = vertex_rx.recv(), if vertices_open => match received {
                    Ok(v) => self.add_vertex(v),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("⚠️  Missed {} vertex event(s); resyncing from painting", n);
                        for v in self.painting.vertices() {
                            self.add_vertex(v);
                        }
                    }
                    Err(RecvError::Closed) => vertices_open = false,
                },
                command = command_rx.recv() => match command {
                    Some(Command::ReApproximateAll) => self.re_approximate_all(),
                    Some(Command::ReApproximate(key)) => self.re_approximate(&key),
                    Some(Command::Snapshot(reply)) => { let _ = reply.send(self.snapshot()); }
                    Some(Command::Shutdown) | None => break,
                },
            }
        }
        for a in self.approximators.values_mut() {
            a.cancel();
        }
        println!("🛑 Approximator stopped");
    }

    fn add_vertex(&mut self, v: Arc<Vertex>) {
        if self.approximators.contains_key(&v.key) {
            return;
        }
        let key = v.key.clone();
        let mut approximator = VertexApproximator::new(v, self.painting.dimensions());
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), approximator.state.subscribe());
        approximator.approximate(&self.mux, &self.crypto_context, &self.failures);
        self.approximators.insert(key.clone(), approximator);
        self.order.push(key);
    }

    fn re_approximate_all(&mut self) {
        for key in &self.order {
            if let Some(a) = self.approximators.get_mut(key) {
                if a.state() != SearchState::Matched {
                    a.approximate(&self.mux, &self.crypto_context, &self.failures);
                }
            }
        }
    }

    fn re_approximate(&mut self, key: &str) {
        match self.approximators.get_mut(key) {
            Some(a) => a.approximate(&self.mux, &self.crypto_context, &self.failures),
            None => eprintln!("⚠️  No vertex {} to re-approximate", key),
        }
    }

    fn snapshot(&self) -> Vec<VertexReport> {
        self.order
            .iter()
            .filter_map(|k| self.approximators.get(k))
            .map(|a| VertexReport {
                key: a.vertex.key.clone(),
                state: a.state(),
                approximation: a.vertex.best_approximation(),
            })
            .collect()
    }
}
