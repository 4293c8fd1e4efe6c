/// `persistence.rs` — append-only slot-pack archive
///
/// One background task owns the day-keyed `frames-YYYY-MM-DD.jsonl` file and
/// drains a bounded queue of storage records. Each record is one JSON line,
/// fsynced after the write; failures retry three times with exponential
/// backoff and are then dropped with a log line. Callers never block: a full
/// queue drops the record (counted) rather than stalling the decode path.
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::slots::types::SlotPackStorageRecord;

const QUEUE_CAPACITY: usize = 1_024;
const WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 50;

pub struct SlotPackStore {
    tx: mpsc::Sender<SlotPackStorageRecord>,
    task: Option<JoinHandle<()>>,
}

impl SlotPackStore {
    pub fn new(dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(writer_loop(dir, rx));
        Self {
            tx,
            task: Some(task),
        }
    }

    /// Queue a record for the background writer. Never blocks; on a full
    /// queue the record is dropped and logged.
    pub fn append(&self, record: SlotPackStorageRecord) {
        if let Err(e) = self.tx.try_send(record) {
            log::warn!("slot pack archive queue full, dropping record: {e}");
        }
    }

    /// Stop accepting records, flush the queue, and join the writer.
    pub async fn shutdown(mut self) {
        let task = self.task.take();
        drop(self.tx);
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// `frames-YYYY-MM-DD.jsonl` for the UTC day of `stored_at`.
pub fn file_name_for(stored_at_ms: i64) -> String {
    let day = Utc
        .timestamp_millis_opt(stored_at_ms)
        .single()
        .unwrap_or_else(Utc::now);
    format!("frames-{}.jsonl", day.format("%Y-%m-%d"))
}

async fn writer_loop(dir: PathBuf, mut rx: mpsc::Receiver<SlotPackStorageRecord>) {
    let mut open: Option<(String, tokio::fs::File)> = None;

    while let Some(record) = rx.recv().await {
        let name = file_name_for(record.stored_at);
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                log::error!("slot pack record serialisation failed: {e}");
                continue;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match write_line(&dir, &name, &line, &mut open).await {
                Ok(()) => break,
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    let backoff = BACKOFF_BASE_MS * (1 << (attempt - 1));
                    log::warn!(
                        "slot pack write failed (attempt {attempt}/{WRITE_ATTEMPTS}): {e}; retrying in {backoff} ms"
                    );
                    open = None; // reopen on retry
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    log::error!("slot pack record dropped after {attempt} attempts: {e}");
                    break;
                }
            }
        }
    }
}

async fn write_line(
    dir: &PathBuf,
    name: &str,
    line: &str,
    open: &mut Option<(String, tokio::fs::File)>,
) -> std::io::Result<()> {
    // Day rollover closes the old handle.
    if open.as_ref().map(|(n, _)| n.as_str()) != Some(name) {
        tokio::fs::create_dir_all(dir).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
            .await?;
        *open = Some((name.to_string(), file));
    }
    let (_, file) = open.as_mut().unwrap();
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_data().await?;
    Ok(())
}
