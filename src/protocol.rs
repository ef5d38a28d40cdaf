//! Multiplexed approximate/cancel/exception protocol spoken with the remote
//! search service over a single duplex channel.
//!
//! Every logical stream is keyed by a caller-generated `topicId`. A router task
//! reads the shared inbound channel and hands each frame to the stream that owns
//! its topic. Tearing a stream down (explicitly or by dropping it) unregisters the
//! topic and sends exactly one `cancel` frame.

use crate::{metrics, painting::Asset};
use anyhow::{Context, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

static QUIET_WS: AtomicBool = AtomicBool::new(false);
/// Toggle routine frame logging. Errors/warnings still log.
pub fn set_quiet_logging(quiet: bool) {
    QUIET_WS.store(quiet, Ordering::Relaxed);
}

macro_rules! ws_log {
    ($($arg:tt)*) => {
        if !QUIET_WS.load(Ordering::Relaxed) {
            println!($($arg)*);
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsAction {
    Approximate,
    Cancel,
    Exception,
}

/// Wire envelope. Field names are part of the contract with the search service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage {
    pub topic_id: String,
    pub msg_id: String,
    pub version: u32,
    pub action: WsAction,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproximationRequest {
    pub xpub: String,
    pub asset: Asset,
    pub dimensions: [u32; 2],
    pub vertex: [i64; 2],
}

/// A candidate derivation path and how far its address is from the target.
/// Distance 0 is an exact match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approximation {
    pub derivation_path: String,
    pub distance_from_target: u64,
}

impl Approximation {
    pub fn is_exact(&self) -> bool {
        self.distance_from_target == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolException {
    pub message: String,
    pub code: i64,
}

impl WsMessage {
    fn new(topic_id: &str, version: u32, action: WsAction, content: Value) -> Self {
        Self {
            topic_id: topic_id.to_string(),
            msg_id: Uuid::new_v4().to_string(),
            version,
            action,
            content,
        }
    }

    pub fn approximate(topic_id: &str, version: u32, request: &ApproximationRequest) -> Result<Self> {
        let content = serde_json::to_value(request).context("encoding approximation request")?;
        Ok(Self::new(topic_id, version, WsAction::Approximate, content))
    }

    /// Response frame carrying one approximation for `topic_id`.
    pub fn reply(topic_id: &str, version: u32, approximation: &Approximation) -> Result<Self> {
        let content = serde_json::to_value(approximation).context("encoding approximation")?;
        Ok(Self::new(topic_id, version, WsAction::Approximate, content))
    }

    pub fn cancel(topic_id: &str, version: u32) -> Self {
        Self::new(topic_id, version, WsAction::Cancel, json!({}))
    }

    pub fn exception(topic_id: &str, version: u32, exception: &ProtocolException) -> Result<Self> {
        let content = serde_json::to_value(exception).context("encoding exception")?;
        Ok(Self::new(topic_id, version, WsAction::Exception, content))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("encoding frame")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).with_context(|| format!("malformed frame: {}", text))
    }
}

/// Terminal failure of one stream. Other streams are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    Remote(ProtocolException),
    Malformed(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Remote(e) => write!(f, "search service exception {}: {}", e.code, e.message),
            StreamError::Malformed(e) => write!(f, "malformed approximation: {}", e),
        }
    }
}

impl std::error::Error for StreamError {}

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>>;

fn lock(routes: &Routes) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<WsMessage>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on the shared channel. Cheap to clone; all clones share one router.
#[derive(Clone)]
pub struct Multiplexer {
    outbound: mpsc::UnboundedSender<WsMessage>,
    routes: Routes,
    version: u32,
}

impl Multiplexer {
    /// Start routing `inbound` frames. `outbound` is where frames for the remote
    /// go; framing and transport belong to whoever drains it.
    pub fn spawn(
        outbound: mpsc::UnboundedSender<WsMessage>,
        mut inbound: mpsc::UnboundedReceiver<WsMessage>,
        version: u32,
    ) -> Self {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let table = routes.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let route = lock(&table).get(&msg.topic_id).cloned();
                match route {
                    Some(tx) => {
                        if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
                            // receiver went away without tearing down
                            lock(&table).remove(&msg.topic_id);
                        }
                    }
                    None => ws_log!("🗑️  Dropping {:?} frame for closed topic {}", msg.action, msg.topic_id),
                }
            }
            let open = {
                let mut routes = lock(&table);
                let n = routes.len();
                routes.clear();
                n
            };
            eprintln!("⚠️  Search channel closed; ending {} open stream(s)", open);
        });
        Self { outbound, routes, version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Topics currently registered with the router.
    pub fn open_topics(&self) -> usize {
        lock(&self.routes).len()
    }

    /// Open one logical stream: register a fresh topic, then send the
    /// initiating `approximate` frame.
    pub fn approximate(&self, request: &ApproximationRequest) -> Result<ApproximationStream> {
        let topic_id = Uuid::new_v4().to_string();
        let frame = WsMessage::approximate(&topic_id, self.version, request)?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).insert(topic_id.clone(), tx);
        if self.outbound.send(frame).is_err() {
            lock(&self.routes).remove(&topic_id);
            anyhow::bail!("search channel is closed");
        }
        metrics::STREAMS_OPENED.inc();
        ws_log!("📨 Opened topic {} for vertex {:?}", topic_id, request.vertex);
        Ok(ApproximationStream {
            topic_id,
            rx,
            outbound: self.outbound.clone(),
            routes: self.routes.clone(),
            version: self.version,
            torn_down: false,
            finished: false,
        })
    }
}

/// Responses for one topic, in the order the remote sent them.
pub struct ApproximationStream {
    topic_id: String,
    rx: mpsc::UnboundedReceiver<WsMessage>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    routes: Routes,
    version: u32,
    torn_down: bool,
    finished: bool,
}

impl ApproximationStream {
    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Stop delivery and tell the remote. Idempotent; the cancel frame goes out once.
    pub fn cancel(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        lock(&self.routes).remove(&self.topic_id);
        self.rx.close();
        // fire-and-forget: a closed channel has nobody left to tell
        let _ = self.outbound.send(WsMessage::cancel(&self.topic_id, self.version));
        metrics::STREAMS_CANCELLED.inc();
        ws_log!("✋ Cancelled topic {}", self.topic_id);
    }
}

impl Stream for ApproximationStream {
    type Item = Result<Approximation, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.torn_down || this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(msg)) => match msg.action {
                WsAction::Exception => {
                    this.finished = true;
                    let exception = serde_json::from_value::<ProtocolException>(msg.content.clone())
                        .unwrap_or_else(|_| ProtocolException { message: msg.content.to_string(), code: -1 });
                    Poll::Ready(Some(Err(StreamError::Remote(exception))))
                }
                WsAction::Cancel => {
                    // remote closed the topic on its side
                    this.finished = true;
                    Poll::Ready(None)
                }
                WsAction::Approximate => match serde_json::from_value::<Approximation>(msg.content) {
                    Ok(a) => Poll::Ready(Some(Ok(a))),
                    Err(e) => {
                        this.finished = true;
                        Poll::Ready(Some(Err(StreamError::Malformed(e.to_string()))))
                    }
                },
            },
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ApproximationStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_wire_field_names() {
        let req = ApproximationRequest {
            xpub: "xpub6C".into(),
            asset: Asset::Btc,
            dimensions: [16, 16],
            vertex: [3, 4],
        };
        let msg = WsMessage::approximate("topic-1", 1, &req).unwrap();
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["topicId"], "topic-1");
        assert_eq!(v["version"], 1);
        assert_eq!(v["action"], "approximate");
        assert!(v["msgId"].as_str().is_some());
        assert_eq!(v["content"], json!({"xpub": "xpub6C", "asset": "BTC", "dimensions": [16, 16], "vertex": [3, 4]}));
    }

    #[test]
    fn cancel_content_is_empty_object() {
        let msg = WsMessage::cancel("t", 2);
        assert_eq!(msg.action, WsAction::Cancel);
        assert_eq!(msg.content, json!({}));
    }

    #[test]
    fn response_and_exception_decode() {
        let reply = WsMessage::from_json(
            r#"{"topicId":"t","msgId":"m","version":1,"action":"approximate","content":{"derivationPath":"m/84'/0'/0'/0/7","distanceFromTarget":3}}"#,
        ).unwrap();
        let a: Approximation = serde_json::from_value(reply.content).unwrap();
        assert_eq!(a.distance_from_target, 3);
        assert!(!a.is_exact());

        let exc = WsMessage::from_json(
            r#"{"topicId":"t","msgId":"m2","version":1,"action":"exception","content":{"message":"bad xpub","code":400}}"#,
        ).unwrap();
        assert_eq!(exc.action, WsAction::Exception);
        let e: ProtocolException = serde_json::from_value(exc.content).unwrap();
        assert_eq!(e.code, 400);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = WsMessage::cancel("t", 1);
        let b = WsMessage::cancel("t", 1);
        assert_ne!(a.msg_id, b.msg_id);
    }
}
