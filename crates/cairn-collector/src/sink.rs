//! JSON-lines event sink.
//!
//! Consumes the collector's event channel and writes one JSON object per
//! line to stdout or a file. Log rotation and richer formats belong to
//! whatever tails this output; the collector's contract ends at the
//! ordered line stream.

use std::{
    fs::OpenOptions,
    io::{self, BufWriter, Write},
    path::Path,
};

use cairn_core::CollectorEvent;
use tokio::sync::mpsc;

/// Line-oriented sink writer.
pub struct JsonLinesSink {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    /// Sink writing to stdout.
    pub fn stdout() -> Self {
        Self { writer: BufWriter::new(Box::new(io::stdout())) }
    }

    /// Sink appending to a file.
    ///
    /// # Errors
    ///
    /// Returns the error from opening the file.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: BufWriter::new(Box::new(file)) })
    }

    /// Write one event as a JSON line and flush, so a crash never loses
    /// acknowledged readings.
    ///
    /// # Errors
    ///
    /// Returns serialization or I/O errors.
    pub fn write(&mut self, event: &CollectorEvent) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Drain the event channel into the sink until all senders hang up.
pub async fn run_sink(mut events: mpsc::Receiver<CollectorEvent>, mut sink: JsonLinesSink) {
    while let Some(event) = events.recv().await {
        if let Err(e) = sink.write(&event) {
            tracing::error!("sink write failed: {}", e);
        }
    }
}
