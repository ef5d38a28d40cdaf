//! In-process stand-in for the remote search service.
//!
//! It speaks the same frames over the same duplex shape a real transport would
//! hand to [`crate::protocol::Multiplexer`]. Each `approximate` request gets a
//! short run of improving approximations ending in an exact match. Paths and
//! distances are derived from a blake3 digest of the request, so a given request
//! always plays out the same way. An empty xpub is answered with an `exception`.

use crate::painting::Asset;
use crate::protocol::{Approximation, ApproximationRequest, ProtocolException, WsAction, WsMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames the simulator has seen, for inspection.
#[derive(Debug, Default, Clone)]
pub struct SimulatorLog {
    pub requests: Vec<(String, ApproximationRequest)>,
    pub cancels: Vec<String>,
}

/// Client side of the simulated channel.
pub struct SimulatorLink {
    /// Give this to the multiplexer as its outbound channel.
    pub outbound: mpsc::UnboundedSender<WsMessage>,
    /// Give this to the multiplexer as its inbound channel.
    pub inbound: mpsc::UnboundedReceiver<WsMessage>,
    pub log: Arc<Mutex<SimulatorLog>>,
}

impl SimulatorLink {
    pub fn log(&self) -> SimulatorLog {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Derivation path and starting distance for a request.
pub fn plan_for(request: &ApproximationRequest) -> (String, u64) {
    let mut hasher = blake3::Hasher::new();
    hasher.update(request.xpub.as_bytes());
    hasher.update(&request.dimensions[0].to_le_bytes());
    hasher.update(&request.dimensions[1].to_le_bytes());
    hasher.update(&request.vertex[0].to_le_bytes());
    hasher.update(&request.vertex[1].to_le_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    let coin = match request.asset {
        Asset::Btc => 0,
        Asset::Tbtc => 1,
    };
    let account = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) % 100_000;
    (format!("m/84'/{}'/0'/0/{}", coin, account), 1 + u64::from(bytes[0] % 4))
}

pub fn spawn(step: Duration, version: u32) -> SimulatorLink {
    let (client_tx, mut service_rx) = mpsc::unbounded_channel::<WsMessage>();
    let (service_tx, client_rx) = mpsc::unbounded_channel::<WsMessage>();
    let log = Arc::new(Mutex::new(SimulatorLog::default()));
    let record = log.clone();

    tokio::spawn(async move {
        let mut jobs: HashMap<String, JoinHandle<()>> = HashMap::new();
        while let Some(msg) = service_rx.recv().await {
            match msg.action {
                WsAction::Approximate => {
                    let request = match serde_json::from_value::<ApproximationRequest>(msg.content) {
                        Ok(r) => r,
                        Err(e) => {
                            let exc = ProtocolException { message: format!("bad request: {}", e), code: 422 };
                            if let Ok(frame) = WsMessage::exception(&msg.topic_id, version, &exc) {
                                let _ = service_tx.send(frame);
                            }
                            continue;
                        }
                    };
                    record
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .requests
                        .push((msg.topic_id.clone(), request.clone()));
                    let job = tokio::spawn(search(msg.topic_id.clone(), request, service_tx.clone(), step, version));
                    jobs.insert(msg.topic_id, job);
                }
                WsAction::Cancel => {
                    record.lock().unwrap_or_else(PoisonError::into_inner).cancels.push(msg.topic_id.clone());
                    if let Some(job) = jobs.remove(&msg.topic_id) {
                        job.abort();
                    }
                }
                WsAction::Exception => {}
            }
            jobs.retain(|_, job| !job.is_finished());
        }
        for (_, job) in jobs {
            job.abort();
        }
    });

    SimulatorLink { outbound: client_tx, inbound: client_rx, log }
}

async fn search(topic_id: String, request: ApproximationRequest, tx: mpsc::UnboundedSender<WsMessage>, step: Duration, version: u32) {
    if request.xpub.is_empty() {
        let exc = ProtocolException { message: "xpub must not be empty".into(), code: 400 };
        if let Ok(frame) = WsMessage::exception(&topic_id, version, &exc) {
            let _ = tx.send(frame);
        }
        return;
    }
    let (path, start) = plan_for(&request);
    for distance in (0..=start).rev() {
        tokio::time::sleep(step).await;
        let approximation = Approximation {
            derivation_path: format!("{}/{}", path, start - distance),
            distance_from_target: distance,
        };
        match WsMessage::reply(&topic_id, version, &approximation) {
            Ok(frame) => {
                if tx.send(frame).is_err() {
                    return;
                }
            }
            Err(e) => {
                eprintln!("🔥 Simulator could not encode reply: {}", e);
                return;
            }
        }
    }
}
