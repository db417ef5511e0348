//! Bounded, ordered SPSC playback queue.
//!
//! The producer (streaming engine) pushes decoded chunks and suspends when
//! the queue reaches its high watermark, resuming once the consumer has
//! drained it below the low watermark. The consumer (device drain loop)
//! never waits: an empty queue is an underrun, tolerated and counted, not
//! fatal. Chunks carry monotonically increasing sequence numbers; the
//! consumer verifies them and treats any gap or reorder as a fatal
//! protocol violation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use tracing::debug;

use crate::error::SpeechError;

/// One decoded audio chunk.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonically increasing sequence number, assigned at enqueue.
    pub seq: u64,
    /// Mono f32 samples at the pipeline rate. Empty for the end-of-stream
    /// marker.
    pub samples: Vec<f32>,
    /// Sentinel: no further chunks will be produced for this session.
    pub end_of_stream: bool,
}

/// The consumer half has been dropped; no more chunks can be delivered.
#[derive(Debug)]
pub struct QueueClosed;

/// Result of one non-blocking consumer poll.
pub enum QueuePoll {
    /// The next chunk, in sequence order.
    Chunk(AudioChunk),
    /// Nothing buffered yet; emit silence for this period.
    Empty,
    /// End-of-stream consumed and queue empty. Playback is complete.
    Drained,
}

/// Create a bounded chunk queue with watermarks derived from `capacity`
/// (high: 75 %, low: 25 %). `poll` is the suspension re-check interval.
pub fn chunk_queue(capacity: usize, poll: Duration) -> (ChunkProducer, ChunkConsumer) {
    let capacity = capacity.max(2);
    let rb = HeapRb::<AudioChunk>::new(capacity);
    let (prod, cons) = rb.split();
    let closed = Arc::new(AtomicBool::new(false));

    let producer = ChunkProducer {
        inner: prod,
        next_seq: 0,
        high: (capacity * 3 / 4).max(1),
        low: capacity / 4,
        poll,
        closed: Arc::clone(&closed),
    };
    let consumer = ChunkConsumer {
        inner: cons,
        expected_seq: 0,
        eos_consumed: false,
        started: false,
        underruns: 0,
        closed,
    };
    (producer, consumer)
}

/// Producer half. Lives in the work context.
pub struct ChunkProducer {
    inner: ringbuf::HeapProd<AudioChunk>,
    next_seq: u64,
    high: usize,
    low: usize,
    poll: Duration,
    closed: Arc<AtomicBool>,
}

impl ChunkProducer {
    /// Enqueue one chunk, assigning its sequence number.
    ///
    /// Suspends while the queue sits at or above the high watermark, until
    /// the consumer drains it below the low watermark. Returns
    /// `Err(QueueClosed)` once the consumer is gone.
    pub async fn push(&mut self, samples: Vec<f32>, end_of_stream: bool) -> Result<(), QueueClosed> {
        if self.inner.occupied_len() >= self.high {
            debug!(
                occupied = self.inner.occupied_len(),
                high = self.high,
                "Queue at high watermark, suspending producer"
            );
            while self.inner.occupied_len() > self.low {
                if self.closed.load(Ordering::Acquire) {
                    return Err(QueueClosed);
                }
                tokio::time::sleep(self.poll).await;
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }

        let chunk = AudioChunk {
            seq: self.next_seq,
            samples,
            end_of_stream,
        };
        self.next_seq += 1;
        self.inner.try_push(chunk).map_err(|_| QueueClosed)
    }

    /// Enqueue the end-of-stream marker.
    pub async fn finish(&mut self) -> Result<(), QueueClosed> {
        self.push(Vec::new(), true).await
    }
}

/// Consumer half. Lives in the drain loop; never blocks.
pub struct ChunkConsumer {
    inner: ringbuf::HeapCons<AudioChunk>,
    expected_seq: u64,
    eos_consumed: bool,
    started: bool,
    underruns: u64,
    closed: Arc<AtomicBool>,
}

impl ChunkConsumer {
    /// Non-blocking poll for the next chunk.
    ///
    /// Sequence numbers are verified on every pop; a mismatch means the
    /// single-producer contract was broken somewhere upstream and the
    /// session cannot safely continue.
    pub fn poll(&mut self) -> Result<QueuePoll, SpeechError> {
        if self.eos_consumed {
            return Ok(QueuePoll::Drained);
        }
        match self.inner.try_pop() {
            Some(chunk) => {
                if chunk.seq != self.expected_seq {
                    return Err(SpeechError::Protocol(format!(
                        "chunk out of order: expected seq {}, got {}",
                        self.expected_seq, chunk.seq
                    )));
                }
                self.expected_seq += 1;
                self.started = true;
                if chunk.end_of_stream {
                    self.eos_consumed = true;
                }
                Ok(QueuePoll::Chunk(chunk))
            }
            None => {
                // Underruns before the first chunk are expected fill time.
                if self.started {
                    self.underruns += 1;
                }
                Ok(QueuePoll::Empty)
            }
        }
    }

    /// Discard everything still buffered. Used on cancellation, where the
    /// backlog must not be played out.
    pub fn discard_pending(&mut self) -> usize {
        let mut n = 0;
        while self.inner.try_pop().is_some() {
            n += 1;
        }
        n
    }

    /// Underruns observed after playback started.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

impl Drop for ChunkConsumer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_available(cons: &mut ChunkConsumer) -> Vec<AudioChunk> {
        let mut out = Vec::new();
        while let Ok(QueuePoll::Chunk(c)) = cons.poll() {
            out.push(c);
        }
        out
    }

    #[tokio::test]
    async fn test_fifo_order_exactly_once() {
        let (mut prod, mut cons) = chunk_queue(8, Duration::from_millis(5));
        for i in 0..3 {
            prod.push(vec![i as f32], false).await.unwrap();
        }
        let chunks = drain_available(&mut cons);
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as u64);
            assert_eq!(chunk.samples, vec![i as f32]);
        }
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Empty));
    }

    #[tokio::test]
    async fn test_eos_then_drained() {
        let (mut prod, mut cons) = chunk_queue(8, Duration::from_millis(5));
        prod.push(vec![0.1; 4], false).await.unwrap();
        prod.finish().await.unwrap();

        assert!(matches!(cons.poll().unwrap(), QueuePoll::Chunk(_)));
        match cons.poll().unwrap() {
            QueuePoll::Chunk(c) => assert!(c.end_of_stream),
            _ => panic!("expected end-of-stream chunk"),
        }
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Drained));
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Drained));
    }

    #[tokio::test]
    async fn test_producer_suspends_at_high_watermark() {
        // capacity 8: high = 6, low = 2
        let (mut prod, mut cons) = chunk_queue(8, Duration::from_millis(5));
        for _ in 0..6 {
            prod.push(vec![0.0; 4], false).await.unwrap();
        }

        // Seventh push must suspend.
        let push = prod.push(vec![0.0; 4], false);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), push)
                .await
                .is_err(),
            "push should suspend at high watermark"
        );

        // Drain below the low watermark; the producer resumes.
        for _ in 0..5 {
            assert!(matches!(cons.poll().unwrap(), QueuePoll::Chunk(_)));
        }
        tokio::time::timeout(Duration::from_millis(500), prod.push(vec![0.0; 4], false))
            .await
            .expect("push should resume after drain")
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_fails_after_consumer_dropped() {
        let (mut prod, cons) = chunk_queue(4, Duration::from_millis(5));
        drop(cons);
        assert!(prod.push(vec![0.0], false).await.is_err());
    }

    #[tokio::test]
    async fn test_underruns_counted_only_after_start() {
        let (mut prod, mut cons) = chunk_queue(8, Duration::from_millis(5));

        // Pre-start polls are fill time, not underruns.
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Empty));
        assert_eq!(cons.underruns(), 0);

        prod.push(vec![0.5; 4], false).await.unwrap();
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Chunk(_)));
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Empty));
        assert_eq!(cons.underruns(), 1);
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let (mut prod, mut cons) = chunk_queue(8, Duration::from_millis(5));
        for _ in 0..4 {
            prod.push(vec![0.0; 4], false).await.unwrap();
        }
        assert_eq!(cons.discard_pending(), 4);
        assert!(matches!(cons.poll().unwrap(), QueuePoll::Empty));
    }
}
