//! Append-only, size-capped access log with a dedicated writer thread.
//!
//! Request handlers never touch the file: they format a line and push it
//! onto a bounded channel. The writer thread drains the channel through a
//! buffered writer and flushes on a timer; when the channel is full the
//! record is dropped rather than blocking the request path. `set_output`
//! opens the new target before tearing down the old writer, so a failed
//! switch leaves the previous log intact.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Local;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::LogMode;
use crate::error::{Error, Result};

const MAX_LOG_SIZE: u64 = 10 << 20;
const QUEUE_CAPACITY: usize = 4096;
const FLUSH_PERIOD: Duration = Duration::from_millis(250);
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

struct Writer {
    tx: SyncSender<String>,
    handle: JoinHandle<()>,
}

struct Inner {
    mode: LogMode,
    writer: Option<Writer>,
}

pub struct AccessLog {
    inner: RwLock<Inner>,
}

impl Default for AccessLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                mode: LogMode::Off,
                writer: None,
            }),
        }
    }

    /// Point the log at `path` with the given mode, replacing any previous
    /// writer. An oversized existing file is truncated first. `Off` closes
    /// the current writer and writes nothing.
    pub fn set_output(&self, path: &Path, mode: LogMode) -> Result<()> {
        if mode == LogMode::Off {
            let mut inner = self.inner.write();
            shutdown_writer(&mut inner);
            inner.mode = mode;
            return Ok(());
        }

        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > MAX_LOG_SIZE {
                fs::File::create(path)
                    .map_err(|e| Error::config(format!("truncating {}: {e}", path.display())))?;
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::config(format!("opening {}: {e}", path.display())))?;

        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("access-log".to_owned())
            .spawn(move || writer_loop(file, rx))
            .map_err(|e| Error::config(format!("spawning log writer: {e}")))?;

        let mut inner = self.inner.write();
        shutdown_writer(&mut inner);
        inner.mode = mode;
        inner.writer = Some(Writer { tx, handle });
        Ok(())
    }

    /// Drain pending records and close the writer.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        shutdown_writer(&mut inner);
        inner.mode = LogMode::Off;
    }

    /// Enqueue one request record. Never blocks; a full queue drops the
    /// record.
    pub fn record(
        &self,
        host: &str,
        method: &str,
        path: &str,
        upstream_port: u16,
        status: u16,
        duration: Duration,
    ) {
        let inner = self.inner.read();
        let Some(writer) = &inner.writer else {
            return;
        };
        if inner.mode == LogMode::Off {
            return;
        }

        let ts = Local::now().format("%H:%M:%S");
        let dur = format_duration(duration);
        let line = match inner.mode {
            LogMode::Full => {
                format!("{ts}\t{host}\t{method}\t{path}\t{upstream_port}\t{status}\t{dur}\n")
            }
            LogMode::Minimal => format!("{ts}\t{host}\t{status}\t{dur}\n"),
            LogMode::Off => return,
        };

        if let Err(TrySendError::Disconnected(_)) = writer.tx.try_send(line) {
            warn!("access log writer is gone; dropping records");
        }
    }
}

fn shutdown_writer(inner: &mut Inner) {
    if let Some(writer) = inner.writer.take() {
        drop(writer.tx);
        let _ = writer.handle.join();
    }
}

fn writer_loop(file: fs::File, rx: Receiver<String>) {
    let mut out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    loop {
        match rx.recv_timeout(FLUSH_PERIOD) {
            Ok(line) => {
                if out.write_all(line.as_bytes()).is_err() {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = out.flush();
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = out.flush();
                return;
            }
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_millis(1) {
        format!("{}µs", d.as_micros())
    } else if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_micros(250)), "250µs");
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }
}
