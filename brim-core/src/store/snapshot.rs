//! Durable snapshot encoding and the background writer
//!
//! Snapshots are reproducible byte-for-byte: one order per line, keys sorted
//! (serde_json's default map is ordered), compact separators, trailing
//! newline, orders sorted by client order id. Writes go tmp-file + rename so
//! a crash never leaves a torn snapshot, and run on a dedicated thread so
//! store mutations never wait on disk.

use crate::core::errors::StoreError;
use crate::core::types::Order;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{error, info};

pub const ORDERS_FILE: &str = "orders.jsonl";
pub const RECOVER_MARKER: &str = "recover.marker";

/// Encode orders deterministically. Input order does not matter; output is
/// sorted by client order id.
pub fn encode_orders(orders: &[Order]) -> Result<String, StoreError> {
    let mut sorted: Vec<&Order> = orders.iter().collect();
    sorted.sort_by(|a, b| a.client_order_id.cmp(&b.client_order_id));

    let mut out = String::new();
    for order in sorted {
        let value = serde_json::to_value(order)?;
        out.push_str(&serde_json::to_string(&value)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decode a snapshot; a corrupt line is an integrity error naming the line.
pub fn decode_orders(content: &str) -> Result<Vec<Order>, StoreError> {
    let mut orders = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let order: Order = serde_json::from_str(line).map_err(|e| StoreError::SnapshotCorrupt {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        orders.push(order);
    }
    Ok(orders)
}

/// Write `payload` atomically: tmp file in the same directory, fsync, rename.
pub fn write_atomic(path: &Path, payload: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    // Persist the rename itself.
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

struct SnapshotJob {
    path: PathBuf,
    payload: String,
}

/// Hands snapshot payloads to a writer thread over a bounded channel. If the
/// channel is full the snapshot is dropped (a newer one is coming); state
/// mutations are never allowed to stall on disk.
pub struct SnapshotWriter {
    sender: Option<Sender<SnapshotJob>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn() -> Self {
        let (sender, receiver) = bounded(16);
        let handle = thread::Builder::new()
            .name("brim-snapshot".to_string())
            .spawn(move || Self::writer_loop(receiver))
            .expect("spawn snapshot writer thread");
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    fn writer_loop(receiver: Receiver<SnapshotJob>) {
        for job in receiver {
            if let Err(e) = write_atomic(&job.path, &job.payload) {
                error!(path = %job.path.display(), error = %e, "snapshot write failed");
            }
        }
        info!("snapshot writer stopping");
    }

    pub fn enqueue(&self, path: PathBuf, payload: String) {
        if let Some(sender) = &self.sender {
            if sender.try_send(SnapshotJob { path, payload }).is_err() {
                error!("snapshot writer backlogged; dropping snapshot");
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        let _ = self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ClientOrderId, OrderIntent, OrderState, Side, Symbol};
    use rust_decimal_macros::dec;

    fn order(cid: &str) -> Order {
        Order::new(
            OrderIntent {
                client_order_id: ClientOrderId::from(cid),
                symbol: Symbol::from("BTCUSDT"),
                side: Side::Buy,
                price: dec!(99.95),
                qty: dec!(1.0),
            },
            1_000,
        )
    }

    #[test]
    fn encoding_is_deterministic_and_sorted() {
        let a = encode_orders(&[order("b"), order("a")]).unwrap();
        let b = encode_orders(&[order("a"), order("b")]).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with('\n'));
        let first = a.lines().next().unwrap();
        assert!(first.contains("\"a\""));
    }

    #[test]
    fn round_trip_preserves_orders() {
        let mut o = order("a");
        o.state = OrderState::PartiallyFilled;
        o.filled_qty = dec!(0.4);
        o.avg_fill_price = Some(dec!(99.95));
        let encoded = encode_orders(&[o.clone()]).unwrap();
        let decoded = decode_orders(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].client_order_id, o.client_order_id);
        assert_eq!(decoded[0].filled_qty, o.filled_qty);
        assert_eq!(decoded[0].state, o.state);
    }

    #[test]
    fn corrupt_line_is_rejected_with_line_number() {
        let good = encode_orders(&[order("a")]).unwrap();
        let bad = format!("{good}{{not json\n");
        match decode_orders(&bad) {
            Err(StoreError::SnapshotCorrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected SnapshotCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn atomic_write_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ORDERS_FILE);
        write_atomic(&path, "first\n").unwrap();
        write_atomic(&path, "second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn writer_thread_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ORDERS_FILE);
        {
            let writer = SnapshotWriter::spawn();
            writer.enqueue(path.clone(), "payload\n".to_string());
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "payload\n");
    }
}
