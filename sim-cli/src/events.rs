use std::{
    fs::File,
    io::{BufWriter, Write as _},
    path::PathBuf,
    sync::mpsc,
};

use anyhow::Result;
use powsim_core::{clock::Timestamp, events::Event};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
struct OutputEvent {
    time_ms: Timestamp,
    message: Event,
}

/// Consumes the simulation's event stream on its own thread, keeping running
/// totals and optionally writing every event out as a line of JSON.
pub struct EventMonitor {
    source: mpsc::Receiver<(Event, Timestamp)>,
    output_path: Option<PathBuf>,
}

impl EventMonitor {
    pub fn new(source: mpsc::Receiver<(Event, Timestamp)>, output_path: Option<PathBuf>) -> Self {
        Self {
            source,
            output_path,
        }
    }

    /// Runs until every sender hangs up, which happens when the simulation
    /// is dropped.
    pub fn run(self) -> Result<()> {
        let mut output = match &self.output_path {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };

        let mut txs_generated = 0u64;
        let mut blocks_mined = 0u64;
        let mut blocks_rejected = 0u64;
        let mut reorgs = 0u64;
        let mut releases = 0u64;
        while let Ok((message, time_ms)) = self.source.recv() {
            match &message {
                Event::TransactionGenerated { .. } => txs_generated += 1,
                Event::BlockMined { .. } => blocks_mined += 1,
                Event::BlockRejected { .. } => blocks_rejected += 1,
                Event::ChainReorged { .. } => reorgs += 1,
                Event::BlocksReleased { .. } => releases += 1,
                _ => {}
            }
            if let Some(writer) = output.as_mut() {
                serde_json::to_writer(&mut *writer, &OutputEvent { time_ms, message })?;
                writer.write_all(b"\n")?;
            }
        }
        if let Some(mut writer) = output {
            writer.flush()?;
        }

        info!(
            txs_generated,
            blocks_mined, blocks_rejected, reorgs, releases, "event stream closed"
        );
        Ok(())
    }
}
