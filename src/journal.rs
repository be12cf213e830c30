// =============================================================================
// Trade Journal — append-only, line-delimited event log (spec.md §6)
// =============================================================================
//
// One self-contained JSON record per line. Rotation is external: this writer
// only ever appends, never truncates or rotates. Decimal fields serialize as
// strings (rust_decimal's `serde-with-str` feature) to preserve precision.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::Side;

/// The four lifecycle events a trade-journal line records (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum JournalEventType {
    Placed,
    Filled,
    Canceled,
    Rejected,
}

/// A single self-contained trade-journal record.
#[derive(Debug, Clone, Serialize)]
pub struct JournalRecord {
    pub monotonic_ns: u128,
    pub wall_clock_ms: u128,
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub fill_price: Decimal,
    pub fill_quantity: Decimal,
    pub realized_slippage_fraction: f64,
    pub latency_ms: u64,
    pub event_type: JournalEventType,
}

/// Append-only writer. Internally lock-guarded because the lifecycle
/// manager, strategy loop, and PnL monitor may all emit concurrently.
pub struct TradeJournal {
    path: PathBuf,
    file: Mutex<std::fs::File>,
    started_at: std::time::Instant,
}

impl TradeJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open trade journal at {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            started_at: std::time::Instant::now(),
        })
    }

    /// Appends a single record as one line of JSON. Never truncates.
    pub fn append(&self, record: &JournalRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize journal record")?;
        let mut file = self.file.lock();
        writeln!(file, "{line}").with_context(|| format!("failed to append to {}", self.path.display()))?;
        file.flush().ok();
        Ok(())
    }

    /// Current monotonic offset in nanoseconds since the journal opened,
    /// paired with `wall_clock_ms` for the dual-timestamp requirement.
    pub fn stamp(&self) -> (u128, u128) {
        let monotonic_ns = self.started_at.elapsed().as_nanos();
        let wall_clock_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        (monotonic_ns, wall_clock_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn append_writes_one_line_delimited_json_record() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("journal_test_{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let journal = TradeJournal::open(&path).unwrap();
        let (monotonic_ns, wall_clock_ms) = journal.stamp();
        journal
            .append(&JournalRecord {
                monotonic_ns,
                wall_clock_ms,
                order_id: "1".into(),
                client_order_id: Some("link-1".into()),
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                fill_price: dec!(50000.1),
                fill_quantity: dec!(0.01),
                realized_slippage_fraction: 0.0005,
                latency_ms: 12,
                event_type: JournalEventType::Filled,
            })
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["fill_price"], "50000.1");
        assert_eq!(parsed["order_id"], "1");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn append_is_append_only_across_multiple_calls() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("journal_test_append_{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let journal = TradeJournal::open(&path).unwrap();
        for i in 0..3 {
            let (monotonic_ns, wall_clock_ms) = journal.stamp();
            journal
                .append(&JournalRecord {
                    monotonic_ns,
                    wall_clock_ms,
                    order_id: i.to_string(),
                    client_order_id: None,
                    symbol: "BTCUSDT".into(),
                    side: Side::Sell,
                    fill_price: dec!(100),
                    fill_quantity: dec!(1),
                    realized_slippage_fraction: 0.0,
                    latency_ms: 1,
                    event_type: JournalEventType::Placed,
                })
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let _ = std::fs::remove_file(&path);
    }
}
