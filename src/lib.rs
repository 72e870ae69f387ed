//! Acquisition core for a bio-impedance measurement instrument.
//!
//! A companion measurement controller performs the analog sweeps and streams
//! results over a byte-oriented serial link; this crate decodes that stream,
//! calibrates the raw readings, derives complex impedance, and organizes the
//! results into baseline and final sweeps per device under test.
//!
//! # Architecture
//!
//! Data flows one direction through three execution contexts:
//!
//! 1. the byte collector ([`collector`]) drains the serial peripheral into a
//!    lock-free SPSC ring buffer ([`ring`]) and raises a data signal; this
//!    is the interrupt side of the design and never blocks;
//! 2. the decoder worker runs the packet state machine ([`decoder`]) and
//!    produces typed protocol events: acknowledgements for the command
//!    channel ([`command`]), frequency samples onto a bounded channel, and
//!    DUT completion signals;
//! 3. the pipeline worker ([`pipeline`]) applies calibration
//!    ([`calibration`]) and impedance derivation ([`impedance`]) and fills
//!    the measurement store ([`store`]).
//!
//! Commands flow the opposite way: the command channel encodes fixed-length
//! packets, transmits them, and waits with bounded retry for the matching
//! acknowledgement to come back through the decoder.
//!
//! Framing damage on the link is survived by silent resynchronization, and
//! every capacity-related drop (ring overflow, channel overflow, store full)
//! is counted and observable via [`pipeline::PipelineStats`].

pub mod calibration;
pub mod collector;
pub mod command;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod impedance;
pub mod logging;
pub mod pipeline;
pub mod protocol;
pub mod ring;
pub mod store;

pub use calibration::{
    normalize_phase_deg, AnalyticCalibration, CalibratedSample, CalibrationStrategy, Correction,
    TableCalibration,
};
pub use collector::{ByteCollector, ByteSource, DataSignal};
pub use command::{AckRegistry, CommandChannel};
pub use config::{AcquisitionConfig, CalibrationKind, CommandSettings};
pub use decoder::{FrameDecoder, SweepEvent, SweepProgress};
pub use errors::{AcquisitionError, Result};
pub use impedance::{derive_impedance, derive_impedance_scalar, ImpedancePoint};
pub use pipeline::{Pipeline, PipelineSettings, PipelineStats};
pub use protocol::{CommandType, DecodedPacket, FrequencySample, TiaMode};
pub use ring::{ring_buffer, RingConsumer, RingMonitor, RingProducer};
pub use store::{MeasurementStore, ResultSet, SweepKind, MAX_DUT_COUNT, MAX_FREQUENCIES};
