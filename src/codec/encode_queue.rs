/// `encode_queue.rs` — bounded encode work queue
///
/// Mirrors the decode queue: named worker threads serialise native encoder
/// access, outcomes flow back over a channel. Results keep the original
/// request so downstream timing code can read `time_since_slot_start_ms`.
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::audio::PLAYBACK_SAMPLE_RATE;
use crate::codec::DigiModeCodec;
use crate::error::{EngineError, Result};
use crate::mode::ModeDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub operator_id: String,
    pub message: String,
    pub audio_freq_hz: f32,
    pub mode: ModeDescriptor,
    pub slot_start_ms: i64,
    /// `now - slot_start_ms` at dispatch; the transmit pipeline derives
    /// mid-slot handling from it.
    pub time_since_slot_start_ms: i64,
}

#[derive(Debug, Clone)]
pub struct EncodeResult {
    pub operator_id: String,
    pub pcm: Vec<f32>,
    pub sample_rate: u32,
    pub duration_sec: f64,
    pub request: EncodeRequest,
}

#[derive(Debug, Clone)]
pub enum EncodeOutcome {
    Complete(EncodeResult),
    Error {
        operator_id: String,
        message: String,
        request: EncodeRequest,
    },
}

pub struct EncodeQueue {
    tx: mpsc::Sender<EncodeRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl EncodeQueue {
    pub fn new(
        codec: Arc<dyn DigiModeCodec>,
        concurrency: usize,
        out: UnboundedSender<EncodeOutcome>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel::<EncodeRequest>(concurrency * 2);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let codec = Arc::clone(&codec);
            let rx = Arc::clone(&rx);
            let out = out.clone();
            let handle = thread::Builder::new()
                .name(format!("encode-{i}"))
                .spawn(move || worker_loop(codec, rx, out))
                .expect("spawn encode worker");
            workers.push(handle);
        }
        Self { tx, workers }
    }

    pub async fn push(&self, request: EncodeRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::QueueClosed("encode"))
    }

    pub fn shutdown(self) {
        drop(self.tx);
        for w in self.workers {
            let _ = w.join();
        }
    }
}

fn worker_loop(
    codec: Arc<dyn DigiModeCodec>,
    rx: Arc<Mutex<mpsc::Receiver<EncodeRequest>>>,
    out: UnboundedSender<EncodeOutcome>,
) {
    loop {
        let request = {
            let mut guard = rx.lock().unwrap();
            guard.blocking_recv()
        };
        let Some(request) = request else { return };

        let started = std::time::Instant::now();
        let outcome = match codec.encode(&request.mode, &request.message, request.audio_freq_hz) {
            Ok(mut pcm) => {
                let cap = request.mode.max_encoded_samples(PLAYBACK_SAMPLE_RATE);
                if pcm.len() > cap {
                    log::warn!(
                        "encoder produced {} samples for {}, truncating to {cap}",
                        pcm.len(),
                        request.mode.name
                    );
                    pcm.truncate(cap);
                }
                let duration_sec = pcm.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;
                log::debug!(
                    "encode '{}' for {}: {:.2} s in {} ms",
                    request.message,
                    request.operator_id,
                    duration_sec,
                    started.elapsed().as_millis()
                );
                EncodeOutcome::Complete(EncodeResult {
                    operator_id: request.operator_id.clone(),
                    pcm,
                    sample_rate: PLAYBACK_SAMPLE_RATE,
                    duration_sec,
                    request,
                })
            }
            Err(e) => {
                log::warn!("encode failed for {}: {e}", request.operator_id);
                EncodeOutcome::Error {
                    operator_id: request.operator_id.clone(),
                    message: e,
                    request,
                }
            }
        };
        if out.send(outcome).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ScriptedCodec;
    use crate::mode::FT8;
    use tokio::sync::mpsc::unbounded_channel;

    fn request(message: &str) -> EncodeRequest {
        EncodeRequest {
            operator_id: "op1".into(),
            message: message.into(),
            audio_freq_hz: 1_500.0,
            mode: FT8.clone(),
            slot_start_ms: 1_700_000_000_000,
            time_since_slot_start_ms: 0,
        }
    }

    #[tokio::test]
    async fn encode_result_preserves_request() {
        let codec = Arc::new(ScriptedCodec::new());
        let (out_tx, mut out_rx) = unbounded_channel();
        let queue = EncodeQueue::new(codec, 1, out_tx);
        queue.push(request("CQ AA1AA FN42")).await.unwrap();

        match out_rx.recv().await.unwrap() {
            EncodeOutcome::Complete(result) => {
                assert_eq!(result.sample_rate, 48_000);
                assert!((result.duration_sec - 12.64).abs() < 0.01);
                assert_eq!(result.request.message, "CQ AA1AA FN42");
                assert_eq!(result.request.slot_start_ms, 1_700_000_000_000);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        queue.shutdown();
    }

    #[tokio::test]
    async fn encode_error_carries_request_and_queue_survives() {
        let codec = Arc::new(ScriptedCodec::new());
        codec.fail_next_encode("tone table busted");
        let (out_tx, mut out_rx) = unbounded_channel();
        let queue = EncodeQueue::new(codec, 1, out_tx);
        queue.push(request("CQ AA1AA FN42")).await.unwrap();
        queue.push(request("BB2BB AA1AA 73")).await.unwrap();

        match out_rx.recv().await.unwrap() {
            EncodeOutcome::Error {
                message, request, ..
            } => {
                assert_eq!(message, "tone table busted");
                assert_eq!(request.message, "CQ AA1AA FN42");
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            EncodeOutcome::Complete(_)
        ));
        queue.shutdown();
    }
}
