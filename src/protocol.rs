//! Wire protocol shared with the measurement controller.
//!
//! Every packet on the link is framed the same way: a fixed start byte, a
//! type byte, a type-specific payload, and a fixed end byte. All multi-byte
//! integers and floats are little-endian. Two families share the channel:
//!
//! - command acknowledgements, whose type byte is the echoed command code
//!   (the small closed set in [`CommandType`]), and
//! - data packets (`DUT_START`, `FREQUENCY`, `DUT_END`) carrying sweep
//!   results from the controller.
//!
//! The layout rules live here and nowhere else; the decoder hands complete
//! frames to [`decode_frame`] and transmitters build packets with the
//! `encode_*` functions.

/// First byte of every packet on the link.
pub const START_BYTE: u8 = 0xAA;
/// Last byte of every packet on the link.
pub const END_BYTE: u8 = 0x55;
/// Fixed marker carried in the payload of an acknowledgement.
pub const ACK_MARKER: u8 = 0x01;

/// Total length of a command packet, start/end bytes included.
pub const CMD_PACKET_LEN: usize = 15;
/// Total length of an acknowledgement packet.
pub const ACK_PACKET_LEN: usize = 4;
/// Total length of a `DUT_START` packet.
pub const DUT_START_LEN: usize = 5;
/// Total length of a `FREQUENCY` packet.
pub const FREQUENCY_LEN: usize = 26;
/// Total length of a `DUT_END` packet.
pub const DUT_END_LEN: usize = 4;
/// Longest frame the decoder ever has to buffer.
pub const MAX_FRAME_LEN: usize = FREQUENCY_LEN;

/// Type byte of a `DUT_START` data packet.
pub const TYPE_DUT_START: u8 = 0x10;
/// Type byte of a `FREQUENCY` data packet.
pub const TYPE_FREQUENCY: u8 = 0x11;
/// Type byte of a `DUT_END` data packet.
pub const TYPE_DUT_END: u8 = 0x12;

/// Number of selectable PGA gain settings.
pub const PGA_STEPS: usize = 8;

/// Commands understood by the measurement controller.
///
/// The discriminants are the on-wire command codes. They double as the type
/// byte of the matching acknowledgement packet, which is why the code space
/// is disjoint from the data packet types above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    SetPgaGain = 0x01,
    SetMuxChannel = 0x02,
    StartMeasurement = 0x03,
    EndMeasurement = 0x04,
    SetTiaGain = 0x05,
}

impl CommandType {
    /// Parse a wire byte into a command code, `None` for anything outside
    /// the reserved command range.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CommandType::SetPgaGain),
            0x02 => Some(CommandType::SetMuxChannel),
            0x03 => Some(CommandType::StartMeasurement),
            0x04 => Some(CommandType::EndMeasurement),
            0x05 => Some(CommandType::SetTiaGain),
            _ => None,
        }
    }
}

/// Transimpedance amplifier gain mode.
///
/// The discriminant matches the wire encoding (0 = low, 1 = high) and is
/// used directly as an index into per-mode calibration tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TiaMode {
    #[default]
    Low = 0,
    High = 1,
}

impl TiaMode {
    pub fn from_wire(byte: u8) -> Self {
        if byte == 1 {
            TiaMode::High
        } else {
            TiaMode::Low
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// One raw voltage/current reading at a single sweep frequency.
///
/// Produced by the decoder for every well-formed `FREQUENCY` packet and
/// consumed exactly once by the pipeline worker. `dut_id` is not part of the
/// wire payload; the decoder tags the sample with the DUT announced by the
/// most recent `DUT_START`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencySample {
    pub dut_id: u8,
    pub freq_hz: u32,
    pub v_magnitude: f32,
    pub v_phase_deg: f32,
    pub i_magnitude: f32,
    pub i_phase_deg: f32,
    pub pga_gain: u8,
    pub tia_mode: TiaMode,
    pub valid: bool,
}

/// A fully validated frame, dispatched by type.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPacket {
    Ack { command: CommandType },
    DutStart { dut_id: u8, freq_count: u8 },
    Frequency(FrequencySample),
    DutEnd { dut_id: u8 },
}

fn le_u32(frame: &[u8], offset: usize) -> Option<u32> {
    frame
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn le_f32(frame: &[u8], offset: usize) -> Option<f32> {
    le_u32(frame, offset).map(f32::from_bits)
}

/// Decode a complete frame (start byte through end byte).
///
/// Returns `None` for any malformed frame: wrong framing bytes, wrong length
/// for the declared type, unknown type byte, or a missing ack marker. The
/// caller treats `None` as a silent resync, never an error.
pub fn decode_frame(frame: &[u8]) -> Option<DecodedPacket> {
    if frame.len() < ACK_PACKET_LEN
        || frame[0] != START_BYTE
        || frame[frame.len() - 1] != END_BYTE
    {
        return None;
    }

    match frame[1] {
        TYPE_DUT_START if frame.len() == DUT_START_LEN => Some(DecodedPacket::DutStart {
            dut_id: frame[2],
            freq_count: frame[3],
        }),
        TYPE_FREQUENCY if frame.len() == FREQUENCY_LEN => {
            Some(DecodedPacket::Frequency(FrequencySample {
                dut_id: 0,
                freq_hz: le_u32(frame, 2)?,
                v_magnitude: le_f32(frame, 6)?,
                v_phase_deg: le_f32(frame, 10)?,
                i_magnitude: le_f32(frame, 14)?,
                i_phase_deg: le_f32(frame, 18)?,
                pga_gain: frame[22],
                tia_mode: TiaMode::from_wire(frame[23]),
                valid: frame[24] == 1,
            }))
        }
        TYPE_DUT_END if frame.len() == DUT_END_LEN => Some(DecodedPacket::DutEnd {
            dut_id: frame[2],
        }),
        byte => {
            let command = CommandType::from_byte(byte)?;
            if frame.len() == ACK_PACKET_LEN && frame[2] == ACK_MARKER {
                Some(DecodedPacket::Ack { command })
            } else {
                None
            }
        }
    }
}

/// Build a 15-byte command packet.
pub fn encode_command(cmd: CommandType, data1: u32, data2: u32, data3: u32) -> [u8; CMD_PACKET_LEN] {
    let mut packet = [0u8; CMD_PACKET_LEN];
    packet[0] = START_BYTE;
    packet[1] = cmd as u8;
    packet[2..6].copy_from_slice(&data1.to_le_bytes());
    packet[6..10].copy_from_slice(&data2.to_le_bytes());
    packet[10..14].copy_from_slice(&data3.to_le_bytes());
    packet[14] = END_BYTE;
    packet
}

/// Build the acknowledgement the controller sends for `cmd`.
pub fn encode_ack(cmd: CommandType) -> [u8; ACK_PACKET_LEN] {
    [START_BYTE, cmd as u8, ACK_MARKER, END_BYTE]
}

/// Build a `DUT_START` data packet.
pub fn encode_dut_start(dut_id: u8, freq_count: u8) -> [u8; DUT_START_LEN] {
    [START_BYTE, TYPE_DUT_START, dut_id, freq_count, END_BYTE]
}

/// Build a `FREQUENCY` data packet from a sample (the `dut_id` tag is not
/// part of the wire layout and is ignored).
pub fn encode_frequency(sample: &FrequencySample) -> [u8; FREQUENCY_LEN] {
    let mut packet = [0u8; FREQUENCY_LEN];
    packet[0] = START_BYTE;
    packet[1] = TYPE_FREQUENCY;
    packet[2..6].copy_from_slice(&sample.freq_hz.to_le_bytes());
    packet[6..10].copy_from_slice(&sample.v_magnitude.to_le_bytes());
    packet[10..14].copy_from_slice(&sample.v_phase_deg.to_le_bytes());
    packet[14..18].copy_from_slice(&sample.i_magnitude.to_le_bytes());
    packet[18..22].copy_from_slice(&sample.i_phase_deg.to_le_bytes());
    packet[22] = sample.pga_gain;
    packet[23] = sample.tia_mode.to_wire();
    packet[24] = sample.valid as u8;
    packet[25] = END_BYTE;
    packet
}

/// Build a `DUT_END` data packet.
pub fn encode_dut_end(dut_id: u8) -> [u8; DUT_END_LEN] {
    [START_BYTE, TYPE_DUT_END, dut_id, END_BYTE]
}
