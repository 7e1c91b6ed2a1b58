//! Bootloader command set over CAN.
//!
//! Each command is an endpoint on the node. Requests are data frames whose
//! payload is the little-endian packed argument list; commands with a return
//! value answer with a frame on the same identifier:
//!
//! | command            | request              | response |
//! |--------------------|----------------------|----------|
//! | protocol hash      | remote frame         | u32      |
//! | `read_flash_32`    | addr u32             | u32      |
//! | `write_scratch_32` | idx u8, value u32    | -        |
//! | `commit`           | addr u32 [, seed u32]| u32      |
//! | `erase_all`        | [seed u32]           | u8       |
//! | `reset`            | empty                | -        |

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::traits::{DeviceConnector, DeviceSession, SessionError};
use crate::config::{ConfigError, DeviceProfile};
use crate::protocol::constants::SCRATCH_REGISTERS;
use crate::transport::{CanFrame, CanTransport, TransportError};

/// Arbitration ids of every command on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameIds {
    protocol_hash: u32,
    read_flash_32: u32,
    write_scratch_32: u32,
    commit: u32,
    erase_all: u32,
    reset: u32,
}

impl FrameIds {
    /// Fails if any command id of `node_id` does not fit the profile's id
    /// width, so a node is never addressed through a truncated id.
    fn resolve(profile: &DeviceProfile, node_id: u8) -> Result<Self, ConfigError> {
        profile.validate()?;
        let endpoints = &profile.endpoints;
        let id = |endpoint| profile.frame_id(node_id, endpoint);
        Ok(Self {
            protocol_hash: id(endpoints.protocol_hash)?,
            read_flash_32: id(endpoints.read_flash_32)?,
            write_scratch_32: id(endpoints.write_scratch_32)?,
            commit: id(endpoints.commit)?,
            erase_all: id(endpoints.erase_all)?,
            reset: id(endpoints.reset)?,
        })
    }
}

/// A bootloader node reached through a CAN transport.
pub struct CanDevice<T: CanTransport> {
    transport: T,
    profile: DeviceProfile,
    ids: FrameIds,
    node_id: u8,
    timeout: Duration,
    protocol_hash: u32,
}

impl<T: CanTransport> CanDevice<T> {
    /// Address `node_id` by reading its protocol hash.
    ///
    /// A node that stays silent yields `SessionError::NoResponse`; a node id
    /// the profile cannot address yields `SessionError::Addressing` before
    /// anything is sent.
    pub fn connect(
        transport: T,
        profile: DeviceProfile,
        node_id: u8,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let ids = FrameIds::resolve(&profile, node_id)?;
        let mut device = Self {
            transport,
            profile,
            ids,
            node_id,
            timeout,
            protocol_hash: 0,
        };

        let id = device.ids.protocol_hash;
        device
            .transport
            .send(&CanFrame::remote(id, device.profile.extended_id, 4))?;
        let data = device.await_response("protocol_hash", id, 4)?;
        device.protocol_hash = LittleEndian::read_u32(&data);

        debug!(
            node_id,
            adapter = %device.transport.name(),
            hash = %format!("0x{:08X}", device.protocol_hash),
            "Device connected"
        );
        Ok(device)
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Hash reported by the node when it was addressed.
    pub fn protocol_hash(&self) -> u32 {
        self.protocol_hash
    }

    fn send(&mut self, id: u32, payload: &[u8]) -> Result<(), SessionError> {
        let frame = CanFrame::new(id, self.profile.extended_id, payload)?;
        trace!(?frame, "TX");
        self.transport.send(&frame)?;
        Ok(())
    }

    fn request(
        &mut self,
        command: &'static str,
        id: u32,
        payload: &[u8],
        expected: usize,
    ) -> Result<Vec<u8>, SessionError> {
        self.send(id, payload)?;
        self.await_response(command, id, expected)
    }

    /// Wait for a data frame on `id`, skipping unrelated bus traffic.
    fn await_response(
        &mut self,
        command: &'static str,
        id: u32,
        expected: usize,
    ) -> Result<Vec<u8>, SessionError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.transport.recv(remaining) {
                Ok(frame) => frame,
                Err(TransportError::Timeout { .. }) => {
                    return Err(SessionError::NoResponse {
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                Err(e) => return Err(e.into()),
            };

            if frame.id != id || frame.extended != self.profile.extended_id || frame.rtr {
                trace!(?frame, "Ignoring unrelated frame");
                if remaining.is_zero() {
                    return Err(SessionError::NoResponse {
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                continue;
            }

            let data = frame.data();
            if data.len() < expected {
                return Err(SessionError::UnexpectedResponse {
                    command,
                    len: data.len(),
                    expected,
                });
            }
            return Ok(data[..expected].to_vec());
        }
    }
}

impl<T: CanTransport> DeviceSession for CanDevice<T> {
    fn read_flash_32(&mut self, address: u32) -> Result<u32, SessionError> {
        let id = self.ids.read_flash_32;
        let data = self.request("read_flash_32", id, &address.to_le_bytes(), 4)?;
        Ok(LittleEndian::read_u32(&data))
    }

    fn write_scratch_32(&mut self, index: u8, value: u32) -> Result<(), SessionError> {
        if index >= SCRATCH_REGISTERS {
            return Err(SessionError::InvalidScratchIndex(index));
        }
        let mut payload = [0u8; 5];
        payload[0] = index;
        LittleEndian::write_u32(&mut payload[1..], value);
        self.send(self.ids.write_scratch_32, &payload)?;
        Ok(())
    }

    fn commit(&mut self, address: u32, seed: Option<u32>) -> Result<u32, SessionError> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32(&mut payload[..4], address);
        let len = match seed {
            Some(seed) => {
                LittleEndian::write_u32(&mut payload[4..], seed);
                8
            }
            None => 4,
        };
        let id = self.ids.commit;
        let data = self.request("commit", id, &payload[..len], 4)?;
        Ok(LittleEndian::read_u32(&data))
    }

    fn erase_all(&mut self, seed: Option<u32>) -> Result<u8, SessionError> {
        let payload = seed.map(u32::to_le_bytes);
        let id = self.ids.erase_all;
        let data = self.request(
            "erase_all",
            id,
            payload.as_ref().map_or(&[][..], |p| &p[..]),
            1,
        )?;
        Ok(data[0])
    }

    fn reset(&mut self) -> Result<(), SessionError> {
        self.send(self.ids.reset, &[])?;
        Ok(())
    }

    fn command_seed(&self) -> Option<u32> {
        self.profile.seeded_commands.then_some(self.protocol_hash)
    }
}

/// Produces `CanDevice`s for one node, e.g. for the recovery loop.
pub struct CanConnector<T: CanTransport + Clone> {
    transport: T,
    profile: DeviceProfile,
    node_id: u8,
    timeout: Duration,
}

impl<T: CanTransport + Clone> CanConnector<T> {
    pub fn new(transport: T, profile: DeviceProfile, node_id: u8, timeout: Duration) -> Self {
        Self {
            transport,
            profile,
            node_id,
            timeout,
        }
    }
}

impl<T: CanTransport + Clone> DeviceConnector for CanConnector<T> {
    type Device = CanDevice<T>;

    fn connect(&mut self) -> Result<Self::Device, SessionError> {
        CanDevice::connect(
            self.transport.clone(),
            self.profile.clone(),
            self.node_id,
            self.timeout,
        )
    }
}
