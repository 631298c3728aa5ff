//! Leadership-Gated Reporter
//!
//! Every tick, only on the leader: reload the whole store, sort by id
//! and replace the console contents with a fresh status report.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::MissedTickBehavior;

use crate::model::{Record, StatusReport};
use crate::shutdown::{self, ShutdownSignal};
use crate::state::LeadershipWatch;
use crate::store::RecordSource;

/// ANSI clear screen and cursor home
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Destination of rendered reports
pub trait ReportSink: Send + Sync {
    /// Replace the previous report with `frame` in one update
    fn emit(&self, frame: &str);
}

/// Writes reports to stdout, clearing the screen first
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ReportSink for ConsoleSink {
    fn emit(&self, frame: &str) {
        let output = format!("{}{}\n", CLEAR_SCREEN, frame);
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(output.as_bytes()).and_then(|_| stdout.flush()) {
            tracing::warn!("Failed to write status report: {}", e);
        }
    }
}

/// Periodic status reporter, active only while this node leads
pub struct Reporter<R> {
    source: Arc<dyn RecordSource<R>>,
    leadership: LeadershipWatch,
    sink: Arc<dyn ReportSink>,
    interval: Duration,
}

impl<R: Record + StatusReport> Reporter<R> {
    pub fn new(
        source: Arc<dyn RecordSource<R>>,
        leadership: LeadershipWatch,
        sink: Arc<dyn ReportSink>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            leadership,
            sink,
            interval,
        }
    }

    /// One tick. Returns true if a report was emitted.
    pub async fn tick(&self) -> bool {
        if !self.leadership.is_leader() {
            return false;
        }

        let records = self.source.load_all().await;
        let frame = render(Local::now(), records);
        self.sink.emit(&frame);
        true
    }

    /// Tick on a fixed period until shutdown
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown::requested(&mut shutdown) => break,
            }
        }
        tracing::debug!("Reporter stopped");
    }
}

/// Render a full report: time header, then one block per record sorted by id
pub fn render<R: Record + StatusReport>(now: DateTime<Local>, mut records: Vec<R>) -> String {
    records.sort_by(|a, b| a.id().cmp(b.id()));

    let mut frame = format!("[Time {}]\n\n", now.format("%H:%M"));
    if records.is_empty() {
        frame.push_str("No coasters to display");
        return frame;
    }

    for record in &records {
        frame.push_str(&record.status_block());
        frame.push_str("\n\n");
    }
    frame
}
