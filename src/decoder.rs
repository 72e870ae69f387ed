//! Packet framing state machine.
//!
//! Consumes ring-buffer bytes one at a time and turns complete frames into
//! dispatched protocol events: acknowledgements to the [`AckRegistry`],
//! frequency samples onto the bounded sample channel, DUT boundaries into
//! [`SweepProgress`] updates and [`SweepEvent`]s. Malformed frames (bad end
//! byte, unknown type) are discarded and the machine resyncs on the next
//! start byte; framing damage is self-healing, never fatal.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, warn};

use crate::command::AckRegistry;
use crate::protocol::{
    self, DecodedPacket, FrequencySample, ACK_PACKET_LEN, DUT_END_LEN, DUT_START_LEN,
    FREQUENCY_LEN, MAX_FRAME_LEN, START_BYTE, TYPE_DUT_END, TYPE_DUT_START, TYPE_FREQUENCY,
};

/// Completion signals raised by the decoder for presentation/transport
/// layers to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepEvent {
    /// One DUT finished streaming (`DUT_END` received).
    DutComplete { dut_id: u8 },
    /// Every expected DUT has finished.
    SweepComplete,
}

/// Sweep-scoped protocol counters.
///
/// Written by the decoder on DUT boundary packets and reset by the
/// orchestrator when a new sweep command is issued; everything else only
/// reads.
#[derive(Debug, Default)]
pub struct SweepProgress {
    current_dut: AtomicU8,
    expected_freq_count: AtomicU8,
    total_duts: AtomicU8,
    completed_duts: AtomicU8,
}

impl SweepProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new sweep expecting `total_duts` devices.
    pub fn reset(&self, total_duts: u8) {
        self.current_dut.store(0, Ordering::Relaxed);
        self.expected_freq_count.store(0, Ordering::Relaxed);
        self.completed_duts.store(0, Ordering::Relaxed);
        self.total_duts.store(total_duts, Ordering::Relaxed);
    }

    fn begin_dut(&self, dut_id: u8, freq_count: u8) {
        self.current_dut.store(dut_id, Ordering::Relaxed);
        self.expected_freq_count.store(freq_count, Ordering::Relaxed);
    }

    /// Count one completed DUT; returns `true` when that was the last one.
    fn complete_dut(&self) -> bool {
        let done = self.completed_duts.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total_duts.load(Ordering::Relaxed);
        total > 0 && done == total
    }

    /// DUT currently streaming, 1-based; 0 before the first `DUT_START`.
    pub fn current_dut(&self) -> u8 {
        self.current_dut.load(Ordering::Relaxed)
    }

    pub fn expected_freq_count(&self) -> u8 {
        self.expected_freq_count.load(Ordering::Relaxed)
    }

    pub fn total_duts(&self) -> u8 {
        self.total_duts.load(Ordering::Relaxed)
    }

    pub fn completed_duts(&self) -> u8 {
        self.completed_duts.load(Ordering::Relaxed)
    }

    /// Whether the announced sweep ran to completion.
    pub fn sweep_complete(&self) -> bool {
        let total = self.total_duts.load(Ordering::Relaxed);
        total > 0 && self.completed_duts.load(Ordering::Relaxed) >= total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    WaitStart,
    ReadType,
    ReadPayload,
}

/// The packet state machine. Sole owner of the in-flight frame; lives on the
/// decoder worker thread and is fed one byte at a time.
pub struct FrameDecoder {
    state: DecodeState,
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
    expected: usize,
    progress: Arc<SweepProgress>,
    samples: Sender<FrequencySample>,
    acks: Arc<AckRegistry>,
    events: Sender<SweepEvent>,
    dropped_samples: Arc<AtomicU64>,
}

impl FrameDecoder {
    pub fn new(
        progress: Arc<SweepProgress>,
        samples: Sender<FrequencySample>,
        acks: Arc<AckRegistry>,
        events: Sender<SweepEvent>,
        dropped_samples: Arc<AtomicU64>,
    ) -> Self {
        Self {
            state: DecodeState::WaitStart,
            buf: [0u8; MAX_FRAME_LEN],
            len: 0,
            expected: 0,
            progress,
            samples,
            acks,
            events,
            dropped_samples,
        }
    }

    /// True when no frame is under construction.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::WaitStart
    }

    /// Advance the state machine by one byte.
    pub fn feed(&mut self, byte: u8) {
        match self.state {
            DecodeState::WaitStart => {
                if byte == START_BYTE {
                    self.buf[0] = byte;
                    self.len = 1;
                    self.state = DecodeState::ReadType;
                }
            }
            DecodeState::ReadType => {
                self.buf[1] = byte;
                self.len = 2;
                self.expected = match byte {
                    TYPE_DUT_START => DUT_START_LEN,
                    TYPE_FREQUENCY => FREQUENCY_LEN,
                    TYPE_DUT_END => DUT_END_LEN,
                    b if protocol::CommandType::from_byte(b).is_some() => ACK_PACKET_LEN,
                    other => {
                        debug!("unknown packet type 0x{other:02X}, resyncing");
                        self.state = DecodeState::WaitStart;
                        return;
                    }
                };
                self.state = DecodeState::ReadPayload;
            }
            DecodeState::ReadPayload => {
                self.buf[self.len] = byte;
                self.len += 1;
                if self.len >= self.expected {
                    self.finish_frame();
                }
            }
        }
    }

    fn finish_frame(&mut self) {
        let len = self.len;
        self.state = DecodeState::WaitStart;
        self.len = 0;

        match protocol::decode_frame(&self.buf[..len]) {
            Some(DecodedPacket::Ack { command }) => {
                debug!("ack received for {command:?}");
                self.acks.publish(command);
            }
            Some(DecodedPacket::DutStart { dut_id, freq_count }) => {
                debug!("DUT {dut_id} start, expecting {freq_count} frequencies");
                self.progress.begin_dut(dut_id, freq_count);
            }
            Some(DecodedPacket::Frequency(mut sample)) => {
                sample.dut_id = self.progress.current_dut();
                match self.samples.try_send(sample) {
                    Ok(()) => {}
                    Err(TrySendError::Full(sample)) => {
                        self.dropped_samples.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "sample channel full, dropping {} Hz sample for DUT {}",
                            sample.freq_hz, sample.dut_id
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("sample channel disconnected");
                    }
                }
            }
            Some(DecodedPacket::DutEnd { dut_id }) => {
                debug!("DUT {dut_id} end");
                let all_done = self.progress.complete_dut();
                let _ = self.events.send(SweepEvent::DutComplete { dut_id });
                if all_done {
                    let _ = self.events.send(SweepEvent::SweepComplete);
                }
            }
            None => {
                debug!("malformed frame discarded ({len} bytes)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        encode_ack, encode_dut_end, encode_dut_start, encode_frequency, CommandType, TiaMode,
    };
    use crossbeam_channel::{bounded, unbounded, Receiver};

    struct Harness {
        decoder: FrameDecoder,
        samples: Receiver<FrequencySample>,
        events: Receiver<SweepEvent>,
        progress: Arc<SweepProgress>,
        acks: Arc<AckRegistry>,
        dropped: Arc<AtomicU64>,
    }

    fn harness(channel_capacity: usize) -> Harness {
        let progress = Arc::new(SweepProgress::new());
        let acks = Arc::new(AckRegistry::new());
        let dropped = Arc::new(AtomicU64::new(0));
        let (sample_tx, sample_rx) = bounded(channel_capacity);
        let (event_tx, event_rx) = unbounded();
        let decoder = FrameDecoder::new(
            Arc::clone(&progress),
            sample_tx,
            Arc::clone(&acks),
            event_tx,
            Arc::clone(&dropped),
        );
        Harness {
            decoder,
            samples: sample_rx,
            events: event_rx,
            progress,
            acks,
            dropped,
        }
    }

    fn sample(freq_hz: u32) -> FrequencySample {
        FrequencySample {
            dut_id: 0,
            freq_hz,
            v_magnitude: 2.0,
            v_phase_deg: 30.0,
            i_magnitude: 1.0,
            i_phase_deg: 10.0,
            pga_gain: 2,
            tia_mode: TiaMode::High,
            valid: true,
        }
    }

    fn feed(decoder: &mut FrameDecoder, bytes: &[u8]) {
        for &b in bytes {
            decoder.feed(b);
        }
    }

    #[test]
    fn full_dut_sequence() {
        let mut h = harness(16);
        h.progress.reset(1);

        feed(&mut h.decoder, &encode_dut_start(1, 3));
        for freq in [100, 1_000, 10_000] {
            feed(&mut h.decoder, &encode_frequency(&sample(freq)));
        }
        feed(&mut h.decoder, &encode_dut_end(1));

        let received: Vec<_> = h.samples.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|s| s.dut_id == 1));
        assert_eq!(received[0].freq_hz, 100);
        assert_eq!(received[2].freq_hz, 10_000);

        assert_eq!(
            h.events.try_recv(),
            Ok(SweepEvent::DutComplete { dut_id: 1 })
        );
        assert_eq!(h.events.try_recv(), Ok(SweepEvent::SweepComplete));
        assert!(h.decoder.is_idle());
    }

    #[test]
    fn corrupted_frame_resyncs() {
        let mut h = harness(16);
        h.progress.reset(1);
        feed(&mut h.decoder, &encode_dut_start(1, 2));

        let mut corrupted = encode_frequency(&sample(100));
        *corrupted.last_mut().unwrap() = 0x00;
        feed(&mut h.decoder, &corrupted);
        feed(&mut h.decoder, &encode_frequency(&sample(200)));

        let received: Vec<_> = h.samples.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].freq_hz, 200);
        assert!(h.decoder.is_idle());
    }

    #[test]
    fn unknown_type_resyncs() {
        let mut h = harness(16);
        h.decoder.feed(START_BYTE);
        h.decoder.feed(0x7F);
        assert!(h.decoder.is_idle());

        // Stream still decodes afterwards.
        feed(&mut h.decoder, &encode_dut_start(2, 1));
        assert_eq!(h.progress.current_dut(), 2);
    }

    #[test]
    fn ack_reaches_registry() {
        let mut h = harness(16);
        feed(&mut h.decoder, &encode_ack(CommandType::StartMeasurement));
        assert!(h
            .acks
            .wait_for(CommandType::StartMeasurement, std::time::Duration::ZERO));
    }

    #[test]
    fn channel_overflow_drops_newest() {
        let mut h = harness(1);
        h.progress.reset(1);
        feed(&mut h.decoder, &encode_dut_start(1, 3));
        for freq in [100, 200, 300] {
            feed(&mut h.decoder, &encode_frequency(&sample(freq)));
        }

        let received: Vec<_> = h.samples.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].freq_hz, 100);
        assert_eq!(h.dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn two_dut_sweep_completes_once() {
        let mut h = harness(16);
        h.progress.reset(2);

        for dut in 1..=2u8 {
            feed(&mut h.decoder, &encode_dut_start(dut, 1));
            feed(&mut h.decoder, &encode_frequency(&sample(500)));
            feed(&mut h.decoder, &encode_dut_end(dut));
        }

        let events: Vec<_> = h.events.try_iter().collect();
        assert_eq!(
            events,
            vec![
                SweepEvent::DutComplete { dut_id: 1 },
                SweepEvent::DutComplete { dut_id: 2 },
                SweepEvent::SweepComplete,
            ]
        );
    }
}
