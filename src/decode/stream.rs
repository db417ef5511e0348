//! Bridges the fetcher's fragment channel into a blocking reader.
//!
//! Symphonia pulls bytes synchronously; the network side produces them
//! asynchronously. [`FragmentReader`] sits between: it blocks the decode
//! thread on the channel until the next fragment arrives, and reports
//! end-of-stream once the sender side is dropped.

use std::io;

use tokio::sync::mpsc;

/// Blocking `io::Read` over a fragment channel.
///
/// Must only be used from a blocking context (e.g. `spawn_blocking`);
/// `blocking_recv` panics inside an async runtime thread.
pub struct FragmentReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl FragmentReader {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl io::Read for FragmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.offset >= self.pending.len() {
            match self.rx.blocking_recv() {
                Some(fragment) => {
                    self.pending = fragment;
                    self.offset = 0;
                }
                // Sender dropped: fragment sequence exhausted.
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
