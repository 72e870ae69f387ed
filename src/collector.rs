//! Interrupt-side byte collection.
//!
//! [`ByteCollector::poll`] plays the role of a receive interrupt: drain
//! whatever the serial peripheral has buffered, push it into the SPSC ring,
//! and raise a binary "data available" signal for the decoder thread. The
//! poll path never blocks and never allocates.

use std::io::{self, Read};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;
use serialport::SerialPort;

use crate::ring::RingProducer;

/// A non-blocking byte source. `read_available` must return immediately with
/// however many bytes the peripheral has ready, possibly zero.
pub trait ByteSource {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl ByteSource for Box<dyn SerialPort> {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.bytes_to_read().map_err(io::Error::from)? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        match self.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

/// Binary signal bridging the collector and the decoder thread.
///
/// `raise` is idempotent: raising an already-raised signal is a no-op. The
/// waiter consumes the signal, with a bounded timeout so it can perform idle
/// bookkeeping even when the link is silent.
#[derive(Default)]
pub struct DataSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl DataSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut raised = self.raised.lock().unwrap();
        if !*raised {
            *raised = true;
            self.cond.notify_one();
        }
    }

    /// Wait until the signal is raised or `timeout` elapses. Returns `true`
    /// (and lowers the signal) if it was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let raised = self.raised.lock().unwrap();
        let (mut raised, _) = self
            .cond
            .wait_timeout_while(raised, timeout, |raised| !*raised)
            .unwrap();
        if *raised {
            *raised = false;
            true
        } else {
            false
        }
    }
}

/// Drains a [`ByteSource`] into the ring buffer.
pub struct ByteCollector<S: ByteSource> {
    source: S,
    producer: RingProducer,
    signal: std::sync::Arc<DataSignal>,
    scratch: [u8; 64],
}

impl<S: ByteSource> ByteCollector<S> {
    pub fn new(source: S, producer: RingProducer, signal: std::sync::Arc<DataSignal>) -> Self {
        Self {
            source,
            producer,
            signal,
            scratch: [0u8; 64],
        }
    }

    /// Drain all currently-available bytes into the ring. Raises the data
    /// signal if at least one byte was collected. Returns the number of
    /// bytes read from the source (full-ring drops are counted by the ring
    /// itself, not reported here).
    pub fn poll(&mut self) -> usize {
        let mut collected = 0usize;
        loop {
            let n = match self.source.read_available(&mut self.scratch) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("serial read failed: {e}");
                    break;
                }
            };
            for &byte in &self.scratch[..n] {
                self.producer.push(byte);
            }
            collected += n;
        }
        if collected > 0 {
            self.signal.raise();
        }
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_buffer;
    use std::sync::Arc;

    struct ScriptedSource {
        chunks: Vec<Vec<u8>>,
    }

    impl ByteSource for ScriptedSource {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.first_mut() {
                None => Ok(0),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.remove(0);
                    }
                    Ok(n)
                }
            }
        }
    }

    #[test]
    fn collects_and_signals() {
        let (producer, mut consumer) = ring_buffer(64);
        let signal = Arc::new(DataSignal::new());
        let source = ScriptedSource {
            chunks: vec![vec![1, 2, 3], vec![4, 5]],
        };
        let mut collector = ByteCollector::new(source, producer, Arc::clone(&signal));

        assert_eq!(collector.poll(), 5);
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        for b in 1..=5u8 {
            assert_eq!(consumer.pop(), Some(b));
        }

        // Nothing available: no signal raised.
        assert_eq!(collector.poll(), 0);
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn signal_raise_is_idempotent() {
        let signal = DataSignal::new();
        signal.raise();
        signal.raise();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        // Consumed: second wait times out.
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }
}
