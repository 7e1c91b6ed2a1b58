//! gs_usb CAN adapter transport (candleLight, CANine and compatible).
//!
//! The adapter is driven with vendor control requests for setup and 20-byte
//! host frames on the bulk endpoints:
//!
//! ```text
//! [0..4]   echo_id  (u32 LE, 0xFFFFFFFF for received frames)
//! [4..8]   can_id   (u32 LE, bit 31 = extended, bit 30 = RTR)
//! [8]      can_dlc
//! [9]      channel
//! [10]     flags
//! [11]     reserved
//! [12..20] data
//! ```

use std::io::Write;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient, TransferError,
};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace, warn};

use super::traits::{CanFrame, CanTransport, TransportError};
use crate::protocol::constants::{CAN_EFF_MASK, CAN_SFF_MASK};

/// Known gs_usb VID/PID pairs.
pub const GS_USB_IDS: &[(u16, u16)] = &[
    (0x1D50, 0x606F), // candleLight / CANine
    (0x1209, 0x2323), // candleLight (pid.codes)
    (0x1CD2, 0x606F), // CES CANext FD
    (0x16D0, 0x10B8), // ABE CANdebugger FD
];

const GS_USB_BREQ_HOST_FORMAT: u8 = 0;
const GS_USB_BREQ_BITTIMING: u8 = 1;
const GS_USB_BREQ_MODE: u8 = 2;
const GS_USB_BREQ_BT_CONST: u8 = 4;

const GS_CAN_MODE_RESET: u32 = 0;
const GS_CAN_MODE_START: u32 = 1;

const HOST_FORMAT_LITTLE_ENDIAN: u32 = 0x0000_BEEF;

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;

/// echo_id of frames received from the bus (as opposed to TX echoes).
const RX_ECHO_ID: u32 = 0xFFFF_FFFF;
/// echo_id we put on transmitted frames.
const TX_ECHO_ID: u32 = 0;

pub const HOST_FRAME_SIZE: usize = 20;
const BT_CONST_SIZE: usize = 40;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Sample point used for bit timing, per mille.
const SAMPLE_POINT_PERMILLE: u32 = 875;

/// Bit timing limits reported by the adapter (`BT_CONST`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTimingConst {
    pub fclk_can: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl BitTimingConst {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < BT_CONST_SIZE {
            return Err(TransportError::MalformedFrame(format!(
                "BT_CONST response too short: {} < {}",
                bytes.len(),
                BT_CONST_SIZE
            )));
        }
        // [0..4] is the feature bitmap, which we do not use.
        let field = |i: usize| LittleEndian::read_u32(&bytes[4 + i * 4..8 + i * 4]);
        Ok(Self {
            fclk_can: field(0),
            tseg1_min: field(1),
            tseg1_max: field(2),
            tseg2_min: field(3),
            tseg2_max: field(4),
            sjw_max: field(5),
            brp_min: field(6),
            brp_max: field(7),
            brp_inc: field(8).max(1),
        })
    }
}

/// Timing segments sent with `BITTIMING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    pub sjw: u32,
    pub brp: u32,
}

impl BitTiming {
    /// Pick the smallest prescaler that hits `bitrate` exactly with a sample
    /// point close to 87.5 %.
    pub fn for_bitrate(limits: &BitTimingConst, bitrate: u32) -> Result<Self, TransportError> {
        let unsupported = TransportError::UnsupportedBitrate {
            bitrate,
            clock: limits.fclk_can,
        };
        if bitrate == 0 {
            return Err(unsupported);
        }

        let mut brp = limits.brp_min.max(1);
        while brp <= limits.brp_max {
            let divisor = bitrate as u64 * brp as u64;
            if limits.fclk_can as u64 % divisor == 0 {
                let tq = (limits.fclk_can as u64 / divisor) as u32;
                let sample = (tq * SAMPLE_POINT_PERMILLE + 500) / 1000;
                let tseg2 = tq
                    .saturating_sub(sample)
                    .clamp(limits.tseg2_min, limits.tseg2_max);
                let tseg1 = tq.saturating_sub(1 + tseg2);
                if tseg1 >= limits.tseg1_min.max(2) && tseg1 <= limits.tseg1_max {
                    return Ok(Self {
                        prop_seg: 1,
                        phase_seg1: tseg1 - 1,
                        phase_seg2: tseg2,
                        sjw: 1,
                        brp,
                    });
                }
            }
            brp += limits.brp_inc;
        }
        Err(unsupported)
    }

    pub fn to_bytes(&self) -> [u8; 20] {
        let mut bytes = [0u8; 20];
        LittleEndian::write_u32_into(
            &[
                self.prop_seg,
                self.phase_seg1,
                self.phase_seg2,
                self.sjw,
                self.brp,
            ],
            &mut bytes,
        );
        bytes
    }
}

/// Serialize a frame for the bulk OUT endpoint.
pub fn encode_host_frame(frame: &CanFrame, channel: u8) -> [u8; HOST_FRAME_SIZE] {
    let mut can_id = if frame.extended {
        (frame.id & CAN_EFF_MASK) | CAN_EFF_FLAG
    } else {
        frame.id & CAN_SFF_MASK
    };
    if frame.rtr {
        can_id |= CAN_RTR_FLAG;
    }

    let mut bytes = [0u8; HOST_FRAME_SIZE];
    LittleEndian::write_u32(&mut bytes[0..4], TX_ECHO_ID);
    LittleEndian::write_u32(&mut bytes[4..8], can_id);
    bytes[8] = frame.dlc();
    bytes[9] = channel;
    bytes[12..12 + frame.data().len()].copy_from_slice(frame.data());
    bytes
}

/// Parse a frame from the bulk IN endpoint. TX echoes yield `None`.
pub fn decode_host_frame(bytes: &[u8]) -> Result<Option<CanFrame>, TransportError> {
    if bytes.len() < HOST_FRAME_SIZE {
        return Err(TransportError::MalformedFrame(format!(
            "host frame too short: {} < {}",
            bytes.len(),
            HOST_FRAME_SIZE
        )));
    }
    if LittleEndian::read_u32(&bytes[0..4]) != RX_ECHO_ID {
        return Ok(None);
    }

    let can_id = LittleEndian::read_u32(&bytes[4..8]);
    let extended = can_id & CAN_EFF_FLAG != 0;
    let id = if extended {
        can_id & CAN_EFF_MASK
    } else {
        can_id & CAN_SFF_MASK
    };
    let dlc = bytes[8].min(8);

    if can_id & CAN_RTR_FLAG != 0 {
        return Ok(Some(CanFrame::remote(id, extended, dlc)));
    }
    CanFrame::new(id, extended, &bytes[12..12 + dlc as usize]).map(Some)
}

/// gs_usb-based CAN transport.
pub struct GsUsbTransport {
    interface: Interface,
    interface_number: u8,
    in_endpoint: u8,
    out_endpoint: u8,
    channel: u8,
    vid: u16,
    pid: u16,
}

impl GsUsbTransport {
    /// Open the `index`-th gs_usb adapter and start it at `bitrate`.
    #[instrument(level = "info")]
    pub fn open(index: usize, bitrate: u32) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| GS_USB_IDS.contains(&(d.vendor_id(), d.product_id())))
            .nth(index)
            .ok_or(TransportError::DeviceNotFound {
                vid: GS_USB_IDS[0].0,
                pid: GS_USB_IDS[0].1,
            })?;

        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found gs_usb adapter"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface_number = 0u8;
        let interface = device.claim_interface(interface_number).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: interface_number,
                message: e.to_string(),
            }
        })?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == interface_number {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        let transport = Self {
            interface,
            interface_number,
            in_endpoint,
            out_endpoint,
            channel: 0,
            vid,
            pid,
        };
        transport.start(bitrate)?;

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            bitrate,
            "CAN channel started"
        );

        Ok(transport)
    }

    fn start(&self, bitrate: u32) -> Result<(), TransportError> {
        let mut host_format = [0u8; 4];
        LittleEndian::write_u32(&mut host_format, HOST_FORMAT_LITTLE_ENDIAN);
        self.control_out(GS_USB_BREQ_HOST_FORMAT, 1, &host_format)?;

        let limits = BitTimingConst::from_bytes(&self.control_in(
            GS_USB_BREQ_BT_CONST,
            self.channel as u16,
            BT_CONST_SIZE as u16,
        )?)?;
        let timing = BitTiming::for_bitrate(&limits, bitrate)?;
        debug!(?limits, ?timing, "Bit timing");
        self.control_out(GS_USB_BREQ_BITTIMING, self.channel as u16, &timing.to_bytes())?;

        self.set_mode(GS_CAN_MODE_START)
    }

    fn set_mode(&self, mode: u32) -> Result<(), TransportError> {
        let mut payload = [0u8; 8];
        LittleEndian::write_u32_into(&[mode, 0], &mut payload);
        self.control_out(GS_USB_BREQ_MODE, self.channel as u16, &payload)
    }

    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.interface_number as u16,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request,
                message: e.to_string(),
            })
    }

    fn control_in(&self, request: u8, value: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        self.interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.interface_number as u16,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed {
                request,
                message: e.to_string(),
            })
    }
}

impl CanTransport for GsUsbTransport {
    #[instrument(level = "trace", skip(self))]
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(HOST_FRAME_SIZE);
        writer
            .write_all(&encode_host_frame(frame, self.channel))
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let packet_size = ep.max_packet_size().max(HOST_FRAME_SIZE);
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let mut buf = Buffer::new(packet_size);
            buf.set_requested_len(packet_size);
            let data = match ep.transfer_blocking(buf, remaining).into_result() {
                Ok(data) => data,
                Err(TransferError::Cancelled) => continue,
                Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
            };

            match decode_host_frame(&data)? {
                Some(frame) => {
                    trace!(?frame, "RX");
                    return Ok(frame);
                }
                None => trace!("Dropped TX echo"),
            }
        }
    }

    fn name(&self) -> String {
        format!("gs_usb {:04X}:{:04X}", self.vid, self.pid)
    }
}

impl Drop for GsUsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.set_mode(GS_CAN_MODE_RESET) {
            warn!(error = %e, "Failed to stop CAN channel");
        }
    }
}
