/// `decode_queue.rs` — bounded decode work queue
///
/// Requests are pulled by a small pool of named worker threads (default 1,
/// which serialises native-library access). `push` resolves once the queue
/// accepts the request; completion and failure travel back over the outcome
/// channel so the dispatcher never blocks on a decode.
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, UnboundedSender};

use crate::codec::{f32_to_i16, DigiModeCodec};
use crate::error::{EngineError, Result};
use crate::mode::ModeDescriptor;
use crate::slots::FrameMessage;

#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub slot_id: String,
    pub slot_start_ms: i64,
    pub window_idx: usize,
    /// Mono f32 at the 12 kHz decode rate.
    pub pcm: Vec<f32>,
    /// `window_timing[idx] - slot_ms`; the pack manager folds this back
    /// into each frame's dt.
    pub window_offset_ms: i64,
    pub base_freq_hz: f32,
    pub mode: ModeDescriptor,
}

#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub slot_id: String,
    pub slot_start_ms: i64,
    pub window_idx: usize,
    pub window_offset_ms: i64,
    pub mode: ModeDescriptor,
    /// Raw frames; dt is still relative to the decoded window.
    pub frames: Vec<FrameMessage>,
    pub processing_time_ms: i64,
}

#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    Complete(DecodeResult),
    Error {
        slot_id: String,
        window_idx: usize,
        message: String,
    },
}

pub struct DecodeQueue {
    tx: mpsc::Sender<DecodeRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl DecodeQueue {
    pub fn new(
        codec: Arc<dyn DigiModeCodec>,
        concurrency: usize,
        out: UnboundedSender<DecodeOutcome>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel::<DecodeRequest>(concurrency * 2);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let codec = Arc::clone(&codec);
            let rx = Arc::clone(&rx);
            let out = out.clone();
            let handle = thread::Builder::new()
                .name(format!("decode-{i}"))
                .spawn(move || worker_loop(codec, rx, out))
                .expect("spawn decode worker");
            workers.push(handle);
        }
        Self { tx, workers }
    }

    /// Accepts the request, waiting if the queue is at capacity.
    pub async fn push(&self, request: DecodeRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::QueueClosed("decode"))
    }

    /// Drop the intake and join the workers.
    pub fn shutdown(self) {
        drop(self.tx);
        for w in self.workers {
            let _ = w.join();
        }
    }
}

fn worker_loop(
    codec: Arc<dyn DigiModeCodec>,
    rx: Arc<Mutex<mpsc::Receiver<DecodeRequest>>>,
    out: UnboundedSender<DecodeOutcome>,
) {
    loop {
        let request = {
            let mut guard = rx.lock().unwrap();
            guard.blocking_recv()
        };
        let Some(request) = request else { return };

        let started = std::time::Instant::now();
        let pcm = f32_to_i16(&request.pcm);
        let outcome = match codec.decode(&request.mode, &pcm, request.base_freq_hz) {
            Ok(raw) => {
                let frames = raw
                    .into_iter()
                    .map(|r| FrameMessage {
                        message: r.text,
                        snr: r.snr_db,
                        dt: r.delta_time_s,
                        freq: request.base_freq_hz + r.delta_freq_hz,
                        confidence: r.confidence,
                    })
                    .collect::<Vec<_>>();
                log::debug!(
                    "decode {} window {}: {} frame(s) in {} ms",
                    request.slot_id,
                    request.window_idx,
                    frames.len(),
                    started.elapsed().as_millis()
                );
                DecodeOutcome::Complete(DecodeResult {
                    slot_id: request.slot_id,
                    slot_start_ms: request.slot_start_ms,
                    window_idx: request.window_idx,
                    window_offset_ms: request.window_offset_ms,
                    mode: request.mode,
                    frames,
                    processing_time_ms: started.elapsed().as_millis() as i64,
                })
            }
            Err(e) => {
                log::warn!(
                    "decode failed for {} window {}: {e}",
                    request.slot_id,
                    request.window_idx
                );
                DecodeOutcome::Error {
                    slot_id: request.slot_id,
                    window_idx: request.window_idx,
                    message: e,
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
    use crate::codec::{RawDecode, ScriptedCodec};
    use crate::mode::FT8;
    use tokio::sync::mpsc::unbounded_channel;

    fn request(slot_start: i64, window_idx: usize) -> DecodeRequest {
        DecodeRequest {
            slot_id: format!("slot-{slot_start}"),
            slot_start_ms: slot_start,
            window_idx,
            pcm: vec![0.0; 12_000],
            window_offset_ms: -10_000,
            base_freq_hz: 0.0,
            mode: FT8.clone(),
        }
    }

    #[tokio::test]
    async fn decode_outcome_carries_frames_and_request_context() {
        let codec = Arc::new(ScriptedCodec::new());
        codec.script_decode(vec![RawDecode {
            text: "AA1AA BB2BB -05".into(),
            snr_db: -5.0,
            delta_time_s: 0.1,
            delta_freq_hz: 1_450.0,
            confidence: 0.8,
        }]);
        let (out_tx, mut out_rx) = unbounded_channel();
        let queue = DecodeQueue::new(codec, 1, out_tx);
        queue.push(request(15_000, 0)).await.unwrap();

        match out_rx.recv().await.unwrap() {
            DecodeOutcome::Complete(result) => {
                assert_eq!(result.slot_id, "slot-15000");
                assert_eq!(result.window_idx, 0);
                assert_eq!(result.window_offset_ms, -10_000);
                assert_eq!(result.frames.len(), 1);
                assert_eq!(result.frames[0].freq, 1_450.0);
                assert_eq!(result.frames[0].message, "AA1AA BB2BB -05");
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        queue.shutdown();
    }

    #[tokio::test]
    async fn decode_error_is_per_request() {
        let codec = Arc::new(ScriptedCodec::new());
        codec.script_decode_error("native fault");
        codec.script_decode(vec![]);
        let (out_tx, mut out_rx) = unbounded_channel();
        let queue = DecodeQueue::new(codec, 1, out_tx);
        queue.push(request(15_000, 0)).await.unwrap();
        queue.push(request(15_000, 1)).await.unwrap();

        match out_rx.recv().await.unwrap() {
            DecodeOutcome::Error { message, .. } => assert_eq!(message, "native fault"),
            other => panic!("expected Error, got {other:?}"),
        }
        // The queue survives and serves the next request.
        match out_rx.recv().await.unwrap() {
            DecodeOutcome::Complete(result) => assert!(result.frames.is_empty()),
            other => panic!("expected Complete, got {other:?}"),
        }
        queue.shutdown();
    }
}
