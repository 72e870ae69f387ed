//! Command transmission with acknowledgement tracking.
//!
//! Commands and acknowledgements share the serial link with data packets:
//! the decoder publishes every ack it sees into the [`AckRegistry`], and
//! [`CommandChannel::send`] blocks on that registry with a per-attempt
//! timeout, retrying a fixed number of times before reporting failure.

use std::io::Write;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::CommandSettings;
use crate::errors::Result;
use crate::protocol::{self, CommandType, TiaMode};

/// Single-slot mailbox for the most recent acknowledgement.
///
/// Written by the decoder thread, consumed by whichever thread is blocked in
/// [`CommandChannel::send`]. A newer ack overwrites an unconsumed older one;
/// the waiter only ever cares about the command it just transmitted.
#[derive(Default)]
pub struct AckRegistry {
    slot: Mutex<Option<CommandType>>,
    cond: Condvar,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledgement observed on the wire.
    pub fn publish(&self, command: CommandType) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(command);
        self.cond.notify_all();
    }

    /// Forget any pending acknowledgement (called before each transmission
    /// so a stale ack cannot satisfy a new command).
    pub fn clear(&self) {
        let mut slot = self.slot.lock().unwrap();
        *slot = None;
    }

    /// Block until an ack for `command` arrives or `timeout` elapses.
    pub fn wait_for(&self, command: CommandType, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if *slot == Some(command) {
                *slot = None;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

/// Encodes and transmits command packets, waiting for the matching
/// acknowledgement with bounded retry.
pub struct CommandChannel {
    link: Mutex<Box<dyn Write + Send>>,
    acks: std::sync::Arc<AckRegistry>,
    ack_timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl CommandChannel {
    pub fn new(
        link: Box<dyn Write + Send>,
        acks: std::sync::Arc<AckRegistry>,
        settings: &CommandSettings,
    ) -> Self {
        Self {
            link: Mutex::new(link),
            acks,
            ack_timeout: settings.ack_timeout(),
            attempts: settings.attempts.max(1),
            retry_delay: settings.retry_delay(),
        }
    }

    /// Transmit `cmd` and wait for its acknowledgement.
    ///
    /// Returns `Ok(true)` as soon as a matching ack is observed, `Ok(false)`
    /// after every attempt timed out, `Err` only for link I/O failures.
    pub fn send(&self, cmd: CommandType, data1: u32, data2: u32, data3: u32) -> Result<bool> {
        let packet = protocol::encode_command(cmd, data1, data2, data3);
        for attempt in 1..=self.attempts {
            self.acks.clear();
            {
                let mut link = self.link.lock().unwrap();
                link.write_all(&packet)?;
                link.flush()?;
            }
            debug!("sent {cmd:?} (data1={data1}, attempt {attempt}/{})", self.attempts);

            if self.acks.wait_for(cmd, self.ack_timeout) {
                return Ok(true);
            }
            warn!(
                "no ack for {cmd:?} within {:?} (attempt {attempt}/{})",
                self.ack_timeout, self.attempts
            );
            if attempt < self.attempts {
                thread::sleep(self.retry_delay);
            }
        }
        Ok(false)
    }

    /// Ask the controller to sweep `num_duts` devices over the frequency
    /// index range `[start_index, end_index]`.
    pub fn start_measurement(&self, num_duts: u8, start_index: u8, end_index: u8) -> Result<bool> {
        self.send(
            CommandType::StartMeasurement,
            num_duts as u32,
            start_index as u32,
            end_index as u32,
        )
    }

    /// Ask the controller to halt an in-progress sweep. Bytes already in
    /// flight keep arriving; the decoder just resyncs over them.
    pub fn stop_measurement(&self) -> Result<bool> {
        self.send(CommandType::EndMeasurement, 0, 0, 0)
    }

    pub fn set_pga_gain(&self, gain: u8) -> Result<bool> {
        self.send(CommandType::SetPgaGain, gain as u32, 0, 0)
    }

    pub fn set_tia_gain(&self, mode: TiaMode) -> Result<bool> {
        self.send(CommandType::SetTiaGain, mode.to_wire() as u32, 0, 0)
    }

    pub fn set_mux_channel(&self, channel: u8) -> Result<bool> {
        self.send(CommandType::SetMuxChannel, channel as u32, 0, 0)
    }
}
