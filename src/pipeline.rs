//! Pipeline orchestration.
//!
//! Wires the decoded sample stream into calibration, impedance derivation
//! and the measurement store, and owns the two worker threads:
//!
//! - the decoder worker wakes on the collector's data signal (with a bounded
//!   timeout for idle bookkeeping) and drains the ring buffer through the
//!   frame decoder;
//! - the pipeline worker blocks on the bounded sample channel and is the
//!   sole mutator of the measurement store.
//!
//! Sweep control (`start_sweep`/`stop_sweep`) delegates to the command
//! channel. The first completed sweep of a session is the baseline; once it
//! completes, the next `start_sweep` writes into the final set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver};
use log::{debug, info, warn};

use crate::calibration::{self, CalibratedSample, CalibrationStrategy};
use crate::command::{AckRegistry, CommandChannel};
use crate::config::CommandSettings;
use crate::decoder::{FrameDecoder, SweepEvent, SweepProgress};
use crate::errors::{AcquisitionError, Result};
use crate::impedance;
use crate::protocol::FrequencySample;
use crate::ring::{RingConsumer, RingMonitor};
use crate::store::{MeasurementStore, SweepKind, MAX_DUT_COUNT, MAX_FREQUENCIES};

/// Tuning knobs for the worker threads.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Capacity of the bounded decoded-sample channel.
    pub sample_channel_capacity: usize,
    /// How long the decoder worker sleeps on the data signal before doing an
    /// idle pass.
    pub idle_wait: Duration,
    pub command: CommandSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sample_channel_capacity: 32,
            idle_wait: Duration::from_millis(100),
            command: CommandSettings::default(),
        }
    }
}

/// Snapshot of the pipeline's loss/rejection counters. All drops are
/// counted, never silent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Bytes dropped because the ring buffer was full.
    pub ring_overflow: u64,
    /// Samples dropped because the sample channel was full.
    pub samples_dropped: u64,
    /// Samples forwarded uncalibrated because the table had no entry.
    pub calibration_misses: u64,
    /// Points rejected for an out-of-range DUT or a full result set.
    pub rejected_points: u64,
}

#[derive(Default)]
struct WorkerCounters {
    calibration_misses: AtomicU64,
    rejected_points: AtomicU64,
}

/// The acquisition pipeline. See the module docs for the thread layout.
pub struct Pipeline {
    command: CommandChannel,
    progress: Arc<SweepProgress>,
    store: Arc<Mutex<MeasurementStore>>,
    baseline_done: Arc<AtomicBool>,
    events: Receiver<SweepEvent>,
    counters: Arc<WorkerCounters>,
    dropped_samples: Arc<AtomicU64>,
    ring_monitor: RingMonitor,
    signal: Arc<crate::collector::DataSignal>,
    running: Arc<AtomicBool>,
    decoder_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the pipeline over an already-split ring buffer.
    ///
    /// `consumer`/`signal` are the read side of the byte collector's ring;
    /// `link` is the serial write half used for commands; `strategy` is the
    /// calibration built at configuration time.
    pub fn spawn(
        consumer: RingConsumer,
        signal: Arc<crate::collector::DataSignal>,
        link: Box<dyn std::io::Write + Send>,
        strategy: Box<dyn CalibrationStrategy>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let progress = Arc::new(SweepProgress::new());
        let acks = Arc::new(AckRegistry::new());
        let store = Arc::new(Mutex::new(MeasurementStore::new()));
        let baseline_done = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(WorkerCounters::default());
        let dropped_samples = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let ring_monitor = consumer.monitor();

        let (sample_tx, sample_rx) = bounded::<FrequencySample>(settings.sample_channel_capacity);
        let (event_tx, event_rx) = unbounded::<SweepEvent>();

        let command = CommandChannel::new(link, Arc::clone(&acks), &settings.command);

        let decoder_thread = {
            let mut decoder = FrameDecoder::new(
                Arc::clone(&progress),
                sample_tx,
                acks,
                event_tx,
                Arc::clone(&dropped_samples),
            );
            let mut consumer = consumer;
            let signal = Arc::clone(&signal);
            let running = Arc::clone(&running);
            let idle_wait = settings.idle_wait;
            thread::Builder::new()
                .name("bioz-decoder".into())
                .spawn(move || {
                    debug!("decoder worker started");
                    while running.load(Ordering::Acquire) {
                        let _ = signal.wait_timeout(idle_wait);
                        while let Some(byte) = consumer.pop() {
                            decoder.feed(byte);
                        }
                    }
                    debug!("decoder worker stopped");
                })?
        };

        let worker_thread = {
            let store = Arc::clone(&store);
            let baseline_done = Arc::clone(&baseline_done);
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name("bioz-pipeline".into())
                .spawn(move || {
                    debug!("pipeline worker started");
                    // Ends when the decoder (the only sender) is dropped.
                    for sample in sample_rx.iter() {
                        process_sample(&sample, &*strategy, &store, &baseline_done, &counters);
                    }
                    debug!("pipeline worker stopped");
                })?
        };

        Ok(Self {
            command,
            progress,
            store,
            baseline_done,
            events: event_rx,
            counters,
            dropped_samples,
            ring_monitor,
            signal,
            running,
            decoder_thread: Some(decoder_thread),
            worker_thread: Some(worker_thread),
        })
    }

    /// Which result set the next samples land in.
    pub fn active_sweep(&self) -> SweepKind {
        if self.baseline_done.load(Ordering::Acquire) {
            SweepKind::Final
        } else {
            SweepKind::Baseline
        }
    }

    /// Start a sweep of `num_duts` devices over the inclusive frequency
    /// index range. Clears the active result set, resets the sweep counters
    /// and sends the start command; `Ok(false)` means the controller never
    /// acknowledged.
    pub fn start_sweep(&self, num_duts: u8, start_index: u8, end_index: u8) -> Result<bool> {
        if num_duts == 0 || num_duts as usize > MAX_DUT_COUNT {
            return Err(AcquisitionError::Sweep(format!(
                "num_duts must be 1..={MAX_DUT_COUNT}, got {num_duts}"
            )));
        }
        if start_index > end_index || end_index as usize >= MAX_FREQUENCIES {
            return Err(AcquisitionError::Sweep(format!(
                "frequency index range {start_index}..={end_index} is invalid"
            )));
        }

        // A completed baseline promotes subsequent sweeps to the final set.
        if !self.baseline_done.load(Ordering::Acquire) && self.progress.sweep_complete() {
            self.baseline_done.store(true, Ordering::Release);
            info!("baseline sweep complete, next sweep records final results");
        }

        let kind = self.active_sweep();
        self.store.lock().unwrap().clear(kind);
        self.progress.reset(num_duts);
        info!(
            "starting {kind:?} sweep: {num_duts} DUT(s), frequency indices {start_index}..={end_index}"
        );
        self.command
            .start_measurement(num_duts, start_index, end_index)
    }

    /// Ask the controller to halt the sweep. Frames already in flight keep
    /// decoding; nothing is cancelled locally.
    pub fn stop_sweep(&self) -> Result<bool> {
        self.command.stop_measurement()
    }

    /// Subscribe to DUT-complete / sweep-complete signals.
    pub fn events(&self) -> Receiver<SweepEvent> {
        self.events.clone()
    }

    /// Shared read access to the measurement results.
    pub fn store(&self) -> Arc<Mutex<MeasurementStore>> {
        Arc::clone(&self.store)
    }

    pub fn progress(&self) -> Arc<SweepProgress> {
        Arc::clone(&self.progress)
    }

    /// The command channel, for gain/mux configuration outside a sweep.
    pub fn command(&self) -> &CommandChannel {
        &self.command
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ring_overflow: self.ring_monitor.dropped(),
            samples_dropped: self.dropped_samples.load(Ordering::Relaxed),
            calibration_misses: self.counters.calibration_misses.load(Ordering::Relaxed),
            rejected_points: self.counters.rejected_points.load(Ordering::Relaxed),
        }
    }

    /// Forget both result sets and start the session over (next sweep is a
    /// baseline again).
    pub fn reset(&self) {
        self.store.lock().unwrap().clear_all();
        self.baseline_done.store(false, Ordering::Release);
        self.progress.reset(0);
    }

    /// Stop and join both workers.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        self.running.store(false, Ordering::Release);
        self.signal.raise();
        if let Some(handle) = self.decoder_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn process_sample(
    sample: &FrequencySample,
    strategy: &dyn CalibrationStrategy,
    store: &Mutex<MeasurementStore>,
    baseline_done: &AtomicBool,
    counters: &WorkerCounters,
) {
    if sample.dut_id == 0 || sample.dut_id as usize > MAX_DUT_COUNT {
        warn!("dropping sample with out-of-range DUT id {}", sample.dut_id);
        counters.rejected_points.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let dut_index = (sample.dut_id - 1) as usize;

    let calibrated = match strategy.correction(sample.freq_hz, sample.tia_mode, sample.pga_gain) {
        Some(correction) => calibration::apply(sample, &correction),
        None => {
            warn!(
                "no calibration for {} Hz (tia {:?}, pga {}), forwarding uncalibrated",
                sample.freq_hz, sample.tia_mode, sample.pga_gain
            );
            counters.calibration_misses.fetch_add(1, Ordering::Relaxed);
            CalibratedSample::from(sample)
        }
    };

    let point = impedance::derive_impedance(sample, &calibrated);
    debug!(
        "DUT {}: {} Hz -> |Z| = {:.2} ohm, phase = {:.2} deg (valid: {})",
        sample.dut_id, point.freq_hz, point.magnitude_ohm, point.phase_deg, point.valid
    );

    let kind = if baseline_done.load(Ordering::Acquire) {
        SweepKind::Final
    } else {
        SweepKind::Baseline
    };
    let stored = store.lock().unwrap().set_mut(kind).push(dut_index, point);
    if !stored {
        warn!(
            "result set full for DUT {}, dropping {} Hz point",
            sample.dut_id, point.freq_hz
        );
        counters.rejected_points.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Correction;
    use crate::protocol::TiaMode;

    struct Unity;

    impl CalibrationStrategy for Unity {
        fn correction(&self, _: u32, _: TiaMode, _: u8) -> Option<Correction> {
            Some(Correction::identity())
        }
    }

    struct Missing;

    impl CalibrationStrategy for Missing {
        fn correction(&self, _: u32, _: TiaMode, _: u8) -> Option<Correction> {
            None
        }
    }

    fn sample(dut_id: u8, freq_hz: u32) -> FrequencySample {
        FrequencySample {
            dut_id,
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

    #[test]
    fn processes_into_baseline_set() {
        let store = Mutex::new(MeasurementStore::new());
        let baseline_done = AtomicBool::new(false);
        let counters = WorkerCounters::default();

        process_sample(&sample(1, 1000), &Unity, &store, &baseline_done, &counters);

        let store = store.lock().unwrap();
        let points = store.baseline().dut_points(0);
        assert_eq!(points.len(), 1);
        assert!(points[0].valid);
        assert!((points[0].magnitude_ohm - 2.0).abs() < 1e-5);
        assert!((points[0].phase_deg - 20.0).abs() < 1e-4);
    }

    #[test]
    fn final_set_after_baseline_done() {
        let store = Mutex::new(MeasurementStore::new());
        let baseline_done = AtomicBool::new(true);
        let counters = WorkerCounters::default();

        process_sample(&sample(2, 500), &Unity, &store, &baseline_done, &counters);

        let store = store.lock().unwrap();
        assert_eq!(store.baseline().count(1), 0);
        assert_eq!(store.final_sweep().count(1), 1);
    }

    #[test]
    fn out_of_range_dut_is_rejected() {
        let store = Mutex::new(MeasurementStore::new());
        let baseline_done = AtomicBool::new(false);
        let counters = WorkerCounters::default();

        process_sample(&sample(0, 1000), &Unity, &store, &baseline_done, &counters);
        process_sample(&sample(5, 1000), &Unity, &store, &baseline_done, &counters);

        assert_eq!(counters.rejected_points.load(Ordering::Relaxed), 2);
        assert_eq!(store.lock().unwrap().baseline().count(0), 0);
    }

    #[test]
    fn calibration_miss_forwards_uncalibrated() {
        let store = Mutex::new(MeasurementStore::new());
        let baseline_done = AtomicBool::new(false);
        let counters = WorkerCounters::default();

        process_sample(&sample(1, 1000), &Missing, &store, &baseline_done, &counters);

        assert_eq!(counters.calibration_misses.load(Ordering::Relaxed), 1);
        let store = store.lock().unwrap();
        let points = store.baseline().dut_points(0);
        assert_eq!(points.len(), 1);
        // Raw V/I ratio survives untouched.
        assert!((points[0].magnitude_ohm - 2.0).abs() < 1e-5);
    }
}
