//! Byte-level input handling. The framer is the only place where chunked
//! reads, idle deadlines and buffer caps live; everything above it deals
//! in whole lines.

use crate::common::*;
use crate::smtp::SmtpError;
use async_std::future::timeout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long one read poll lasts before deadlines are re-checked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One framed input line, terminator included.
#[derive(Debug)]
pub struct Line {
    pub bytes: Vec<u8>,
    /// True when this line was already buffered while the previous line
    /// was still being processed - the client pipelined.
    pub pipelined: bool,
}

/// Accumulates chunked reads into a bounded buffer and hands out whole
/// lines. Enforces the idle deadline and the buffer cap; both are
/// disabled when `None`.
pub struct LineReader {
    buf: Vec<u8>,
    chunk_size: usize,
    max_size: Option<usize>,
    cmd_timeout: Option<Duration>,
    last_line_at: Instant,
    pipelined_next: bool,
}

impl LineReader {
    pub fn new(chunk_size: usize, max_size: Option<usize>, cmd_timeout: Option<Duration>) -> Self {
        LineReader {
            buf: Vec::new(),
            chunk_size,
            max_size,
            cmd_timeout,
            last_line_at: Instant::now(),
            pipelined_next: false,
        }
    }

    /// Drops buffered plaintext and restarts the idle deadline. Used when
    /// the stream is replaced after a TLS handshake.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pipelined_next = false;
        self.last_line_at = Instant::now();
    }

    /// The next whole line.
    ///
    /// * `Err(CmdTimeout)` - nothing parsed for longer than the deadline
    /// * `Err(BufferOverrun)` - buffer grew past the cap with no line break
    /// * `Err(Disconnected)` - clean EOF from the peer
    /// * `Err(Stopping)` - the service is shutting down, not a fault
    pub async fn read_line<IO>(
        &mut self,
        io: &mut IO,
        stopping: &AtomicBool,
    ) -> crate::common::Result<Line>
    where
        IO: Read + Unpin + ?Sized,
    {
        let mut chunk = vec![0u8; self.chunk_size.max(1)];
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                let bytes = std::mem::replace(&mut self.buf, rest);
                self.last_line_at = Instant::now();
                let pipelined = self.pipelined_next;
                self.pipelined_next = self.buf.contains(&b'\n');
                return Ok(Line { bytes, pipelined });
            }
            if let Some(max) = self.max_size {
                if self.buf.len() > max {
                    return Err(SmtpError::BufferOverrun);
                }
            }
            if let Some(deadline) = self.cmd_timeout {
                if self.last_line_at.elapsed() > deadline {
                    return Err(SmtpError::CmdTimeout);
                }
            }
            if stopping.load(Ordering::Relaxed) {
                return Err(SmtpError::Stopping);
            }
            match timeout(POLL_INTERVAL, io.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(SmtpError::Disconnected),
                Ok(Ok(len)) => self.buf.extend_from_slice(&chunk[..len]),
                Ok(Err(e)) => return Err(e.into()),
                // no data right now, go around and re-check the deadlines
                Err(_) => {}
            }
        }
    }
}
