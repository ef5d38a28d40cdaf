//! The grid painting: vertices and edges the user has drawn, the crypto context
//! every search runs under, and the creation events other components follow.

use crate::graph;
use crate::protocol::Approximation;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 1024;

pub type Coordinate = (i64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    #[serde(rename = "BTC")]
    Btc,
    #[serde(rename = "TBTC")]
    Tbtc,
}

/// Asset and extended public key in effect for every search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoContext {
    pub asset: Asset,
    pub xpub: String,
}

/// What a renderer shows for a vertex, derived from its best approximation alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Unmatched,
    Approximate,
    Exact,
}

pub fn vertex_key(x: i64, y: i64) -> String {
    format!("({}, {})", x, y)
}

/// Order-independent: both keys are sorted before joining.
pub fn edge_key(k1: &str, k2: &str) -> String {
    let (first, second) = if k1 <= k2 { (k1, k2) } else { (k2, k1) };
    format!("{}-{}", first, second)
}

pub struct Vertex {
    pub x: i64,
    pub y: i64,
    pub key: String,
    best: watch::Sender<Option<Approximation>>,
}

impl Vertex {
    pub fn new(x: i64, y: i64) -> Self {
        let (best, _) = watch::channel(None);
        Self { x, y, key: vertex_key(x, y), best }
    }

    pub fn coordinate(&self) -> Coordinate {
        (self.x, self.y)
    }

    pub fn best_approximation(&self) -> Option<Approximation> {
        self.best.borrow().clone()
    }

    pub fn watch_approximation(&self) -> watch::Receiver<Option<Approximation>> {
        self.best.subscribe()
    }

    pub fn status(&self) -> MatchStatus {
        match &*self.best.borrow() {
            None => MatchStatus::Unmatched,
            Some(a) if a.is_exact() => MatchStatus::Exact,
            Some(_) => MatchStatus::Approximate,
        }
    }

    pub fn is_perfect(&self) -> bool {
        self.status() == MatchStatus::Exact
    }

    // Only the approximation coordinator writes this.
    pub(crate) fn next_approximation(&self, approximation: Option<Approximation>) {
        self.best.send_replace(approximation);
    }
}

impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl fmt::Debug for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex").field("key", &self.key).field("best", &*self.best.borrow()).finish()
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(Debug)]
pub struct Edge {
    pub v1: Arc<Vertex>,
    pub v2: Arc<Vertex>,
    pub key: String,
}

impl Edge {
    pub fn new(v1: Arc<Vertex>, v2: Arc<Vertex>) -> Result<Self> {
        if v1.key == v2.key {
            bail!("refusing self-loop edge at {}", v1.key);
        }
        let key = edge_key(&v1.key, &v2.key);
        Ok(Self { v1, v2, key })
    }

    /// Oriented the way it was drawn: `v1` is the source.
    pub fn to_graph_edge(&self) -> graph::Edge<Arc<Vertex>> {
        graph::Edge::new(self.v1.clone(), self.v2.clone())
    }
}

#[derive(Default)]
struct Canvas {
    vertices: HashMap<String, Arc<Vertex>>,
    vertex_order: Vec<String>,
    edges: HashMap<String, Arc<Edge>>,
    edge_order: Vec<String>,
}

pub struct Painting {
    rows: u32,
    columns: u32,
    canvas: Mutex<Canvas>,
    crypto_context: watch::Sender<CryptoContext>,
    vertex_tx: broadcast::Sender<Arc<Vertex>>,
    edge_tx: broadcast::Sender<Arc<Edge>>,
}

impl Painting {
    pub fn new(rows: u32, columns: u32, crypto_context: CryptoContext) -> Self {
        let (crypto_context, _) = watch::channel(crypto_context);
        let (vertex_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (edge_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { rows, columns, canvas: Mutex::new(Canvas::default()), crypto_context, vertex_tx, edge_tx }
    }

    fn canvas(&self) -> MutexGuard<'_, Canvas> {
        self.canvas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `[rows, columns]`, as sent to the search service.
    pub fn dimensions(&self) -> [u32; 2] {
        [self.rows, self.columns]
    }

    fn check_bounds(&self, (x, y): Coordinate) -> Result<()> {
        // x runs over dimensions()[0], y over dimensions()[1]
        if x < 0 || y < 0 || x >= i64::from(self.rows) || y >= i64::from(self.columns) {
            bail!("{} lies outside the {}x{} painting", vertex_key(x, y), self.rows, self.columns);
        }
        Ok(())
    }

    // Events go out under the canvas lock so subscribers see creation order.
    fn vertex_locked(&self, canvas: &mut Canvas, (x, y): Coordinate) -> Arc<Vertex> {
        let key = vertex_key(x, y);
        if let Some(v) = canvas.vertices.get(&key) {
            return v.clone();
        }
        let v = Arc::new(Vertex::new(x, y));
        canvas.vertices.insert(key.clone(), v.clone());
        canvas.vertex_order.push(key);
        let _ = self.vertex_tx.send(v.clone());
        v
    }

    /// The vertex at `c`, created (and announced) on first reference.
    pub fn touch_vertex(&self, c: Coordinate) -> Result<Arc<Vertex>> {
        self.check_bounds(c)?;
        let mut canvas = self.canvas();
        Ok(self.vertex_locked(&mut canvas, c))
    }

    /// Connect two coordinates. Re-adding a known edge returns it without
    /// announcing anything.
    pub fn new_edge(&self, a: Coordinate, b: Coordinate) -> Result<Arc<Edge>> {
        self.check_bounds(a)?;
        self.check_bounds(b)?;
        if a == b {
            bail!("refusing self-loop edge at {}", vertex_key(a.0, a.1));
        }
        let mut canvas = self.canvas();
        let key = edge_key(&vertex_key(a.0, a.1), &vertex_key(b.0, b.1));
        if let Some(existing) = canvas.edges.get(&key) {
            return Ok(existing.clone());
        }
        let v1 = self.vertex_locked(&mut canvas, a);
        let v2 = self.vertex_locked(&mut canvas, b);
        let edge = Arc::new(Edge::new(v1, v2)?);
        canvas.edges.insert(key.clone(), edge.clone());
        canvas.edge_order.push(key);
        let _ = self.edge_tx.send(edge.clone());
        Ok(edge)
    }

    pub fn vertex(&self, key: &str) -> Option<Arc<Vertex>> {
        self.canvas().vertices.get(key).cloned()
    }

    pub fn vertex_at(&self, (x, y): Coordinate) -> Option<Arc<Vertex>> {
        self.vertex(&vertex_key(x, y))
    }

    /// All vertices in creation order.
    pub fn vertices(&self) -> Vec<Arc<Vertex>> {
        let canvas = self.canvas();
        canvas.vertex_order.iter().filter_map(|k| canvas.vertices.get(k).cloned()).collect()
    }

    /// All edges in creation order.
    pub fn edges(&self) -> Vec<Arc<Edge>> {
        let canvas = self.canvas();
        canvas.edge_order.iter().filter_map(|k| canvas.edges.get(k).cloned()).collect()
    }

    pub fn vertex_count(&self) -> usize {
        self.canvas().vertex_order.len()
    }

    pub fn edge_count(&self) -> usize {
        self.canvas().edge_order.len()
    }

    /// Existing vertices plus a receiver for every later one, with no gap or
    /// overlap between the two.
    pub fn watch_vertices(&self) -> (Vec<Arc<Vertex>>, broadcast::Receiver<Arc<Vertex>>) {
        let canvas = self.canvas();
        let rx = self.vertex_tx.subscribe();
        let backlog = canvas.vertex_order.iter().filter_map(|k| canvas.vertices.get(k).cloned()).collect();
        (backlog, rx)
    }

    /// Edge counterpart of [`Painting::watch_vertices`].
    pub fn watch_edges(&self) -> (Vec<Arc<Edge>>, broadcast::Receiver<Arc<Edge>>) {
        let canvas = self.canvas();
        let rx = self.edge_tx.subscribe();
        let backlog = canvas.edge_order.iter().filter_map(|k| canvas.edges.get(k).cloned()).collect();
        (backlog, rx)
    }

    pub fn crypto_context(&self) -> CryptoContext {
        self.crypto_context.borrow().clone()
    }

    pub fn watch_crypto_context(&self) -> watch::Receiver<CryptoContext> {
        self.crypto_context.subscribe()
    }

    /// Publish a new context. Setting the current value again is not a change.
    pub fn set_crypto_context(&self, cc: CryptoContext) {
        self.crypto_context.send_if_modified(|current| {
            if *current == cc {
                return false;
            }
            *current = cc;
            true
        });
    }
}

/// Parse `"x,y-x,y"` into a coordinate pair. The separating `-` is the one
/// that follows a digit, so signed coordinates parse too.
pub fn parse_edge(text: &str) -> Result<(Coordinate, Coordinate)> {
    let split = text
        .char_indices()
        .find(|&(i, c)| c == '-' && text[..i].trim_end().ends_with(|p: char| p.is_ascii_digit()))
        .map(|(i, _)| i)
        .with_context(|| format!("edge '{}' must look like x,y-x,y", text))?;
    let (a, b) = (&text[..split], &text[split + 1..]);
    Ok((parse_coordinate(a)?, parse_coordinate(b)?))
}

fn parse_coordinate(text: &str) -> Result<Coordinate> {
    let (x, y) = text
        .trim()
        .split_once(',')
        .with_context(|| format!("coordinate '{}' must look like x,y", text))?;
    let x = x.trim().parse().with_context(|| format!("bad x in '{}'", text))?;
    let y = y.trim().parse().with_context(|| format!("bad y in '{}'", text))?;
    Ok((x, y))
}

/// Whitespace-separated list of edges.
pub fn parse_edge_list(text: &str) -> Result<Vec<(Coordinate, Coordinate)>> {
    text.split_whitespace().map(parse_edge).collect()
}
