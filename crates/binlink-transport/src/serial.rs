//! Newline-framed serial transport.
//!
//! Each frame is one line of text terminated by `\n` (a trailing `\r` from
//! the far side is tolerated). The destination is implicit: whatever is
//! attached to the other end of the line.
//!
//! The transport is generic over any `AsyncRead + AsyncWrite` stream so the
//! same framing drives a real port ([`SerialTransport::open`]) and in-memory
//! pipes.

use crate::transport::{
    PeerAddress, StatsCounters, Transport, TransportError, TransportKind, TransportResult,
    TransportStats,
};
use crate::MAX_FRAME_SIZE;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

struct LineReader<S> {
    reader: BufReader<ReadHalf<S>>,
    // Bytes of a line whose terminator has not arrived yet. Survives a
    // timed-out poll so partial lines are never lost.
    pending: Vec<u8>,
    // Set once `pending` outgrew MAX_FRAME_SIZE; bytes are dropped until
    // the next newline.
    discarding: bool,
}

enum ReadLine {
    Line(Vec<u8>),
    Overflow,
    Eof,
}

impl<S: AsyncRead> LineReader<S> {
    /// Read up to and including the next `\n`.
    ///
    /// Cancel-safe: buffered bytes are only consumed after they have been
    /// moved into `pending`.
    async fn read_line(&mut self) -> std::io::Result<ReadLine> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(ReadLine::Eof);
            }

            let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            let used = chunk.len();
            if !self.discarding {
                self.pending.extend_from_slice(chunk);
            }
            self.reader.consume(used);

            if complete {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                return Ok(ReadLine::Line(std::mem::take(&mut self.pending)));
            }
            if !self.discarding && self.pending.len() > MAX_FRAME_SIZE {
                self.pending = Vec::new();
                self.discarding = true;
                return Ok(ReadLine::Overflow);
            }
        }
    }
}

/// Serial transport over an async byte stream.
pub struct SerialTransport<S> {
    reader: Mutex<LineReader<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl SerialTransport<SerialStream> {
    /// Open a serial device.
    ///
    /// # Arguments
    /// * `path` - Device path, e.g. `/dev/ttyUSB0`
    /// * `baud_rate` - Line speed
    ///
    /// # Errors
    /// Returns `TransportError::OpenFailed` if the device cannot be opened
    pub fn open(path: &str, baud_rate: u32) -> TransportResult<Self> {
        let port = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::OpenFailed(format!("{path}: {e}")))?;
        tracing::info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self::new(port))
    }
}

impl<S> SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an already-open stream.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(LineReader {
                reader: BufReader::new(read_half),
                pending: Vec::new(),
                discarding: false,
            }),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        }
    }
}

fn trim_line(mut line: Vec<u8>) -> Vec<u8> {
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    line
}

#[async_trait]
impl<S> Transport for SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn send(&self, buf: &[u8], to: &PeerAddress) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if *to != PeerAddress::Serial {
            return Err(TransportError::InvalidDestination(*to));
        }
        if buf.contains(&b'\n') {
            return Err(TransportError::InvalidFrame("embedded newline".into()));
        }
        if buf.len() >= MAX_FRAME_SIZE {
            return Err(TransportError::InvalidFrame(format!(
                "{} bytes exceeds {}",
                buf.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(buf.len() + 1);
        frame.extend_from_slice(buf);
        frame.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.stats.record_send(buf.len());
                Ok(buf.len())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn poll(&self, wait: Duration) -> TransportResult<Option<(Vec<u8>, PeerAddress)>> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut reader = self.reader.lock().await;

        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(TransportError::Closed);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let line = match tokio::time::timeout(remaining, reader.read_line()).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    self.stats.record_recv_error();
                    return Err(TransportError::Io(e));
                }
                // Also covers a stream that ended mid-line.
                Ok(Ok(ReadLine::Eof)) => return Err(TransportError::Disconnected),
                Ok(Ok(ReadLine::Overflow)) => {
                    self.stats.record_recv_error();
                    tracing::warn!(
                        "Serial line exceeded {} bytes without a newline, discarding",
                        MAX_FRAME_SIZE
                    );
                    continue;
                }
                Ok(Ok(ReadLine::Line(line))) => line,
            };

            let line = trim_line(line);
            if line.is_empty() {
                if remaining.is_zero() {
                    return Ok(None);
                }
                continue;
            }
            if line.len() > MAX_FRAME_SIZE {
                self.stats.record_recv_error();
                tracing::warn!("Dropped oversized serial line ({} bytes)", line.len());
                continue;
            }

            self.stats.record_recv(line.len());
            return Ok(Some((line, PeerAddress::Serial)));
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        // The far side may already be gone.
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
