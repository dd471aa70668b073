//! Byte-stream ring buffer.
//!
//! A bounded single-producer / single-consumer FIFO that decouples an
//! external byte source (or sink) from the fixed-cadence packetizer.
//!
//! - The producer never blocks and never overwrites: bytes that do not fit
//!   are dropped, and the caller learns how many were accepted.
//! - The consumer never blocks: on underrun it receives fewer bytes than
//!   requested.
//!
//! The two halves are `Send` and are meant to live on different execution
//! contexts (e.g. a serial reader task and the cadence task).

/// Create a ring buffer holding up to `capacity` bytes.
pub fn byte_ring(capacity: usize) -> (ByteProducer, ByteConsumer) {
    let (tx, rx) = rtrb::RingBuffer::<u8>::new(capacity);
    (ByteProducer { tx }, ByteConsumer { rx })
}

/// Writing half of the byte ring.
#[derive(Debug)]
pub struct ByteProducer {
    tx: rtrb::Producer<u8>,
}

impl ByteProducer {
    /// Push as many bytes of `bytes` as fit.
    ///
    /// Returns the number of bytes accepted; the rest are dropped.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.tx.slots());
        if n == 0 {
            return 0;
        }
        match self.tx.write_chunk_uninit(n) {
            Ok(chunk) => chunk.fill_from_iter(bytes[..n].iter().copied()),
            Err(_) => 0,
        }
    }

    /// Free space in bytes.
    pub fn free(&self) -> usize {
        self.tx.slots()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.tx.buffer().capacity()
    }

    /// Whether the consumer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_abandoned()
    }
}

/// Reading half of the byte ring.
#[derive(Debug)]
pub struct ByteConsumer {
    rx: rtrb::Consumer<u8>,
}

impl ByteConsumer {
    /// Move up to `out.len()` bytes into `out`.
    ///
    /// Returns the number of bytes written to the front of `out`.
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.rx.slots());
        if n == 0 {
            return 0;
        }
        let Ok(chunk) = self.rx.read_chunk(n) else {
            return 0;
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..n].copy_from_slice(second);
        chunk.commit_all();
        n
    }

    /// Bytes currently buffered.
    pub fn occupied(&self) -> usize {
        self.rx.slots()
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.rx.buffer().capacity()
    }

    /// Whether the producer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.rx.is_abandoned()
    }
}
