//! Acquisition core for the IIT multi-module biosignal sensor.
//!
//! The device exposes two USB serial ports. The **shell** port carries a
//! line-oriented command protocol used to validate the device, connect the
//! remote sensor, initialise modules and start or stop streaming. The **data**
//! port carries framed binary packets, one per block of samples of one channel.
//!
//! ```text
//! data bytes -> FrameAssembler (ChannelRegistry) -> bounded queue
//!            -> codec::decode_payload -> ContinuityMonitor -> FrameSink
//! ```
//!
//! # Timing
//!
//! Packets carry a 16-bit millisecond device timestamp. The continuity monitor
//! uses it to estimate dropped samples; sample times on the host side are
//! reconstructed as `first_sample / rate` from the start of acquisition.
//!
//! # Python
//!
//! With the `python` feature the crate builds the `_core` extension module.

pub mod assembler;
pub mod channels;
pub mod codec;
pub mod continuity;
mod errors;
pub mod handshake;
pub mod logging;
pub mod serial;
pub mod session;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
mod test_support;

pub use assembler::{AssemblerStats, FrameAssembler, RawPacket};
pub use channels::{ChannelDescriptor, ChannelRegistry, ChannelTable};
pub use codec::SampleFrame;
pub use continuity::{ContinuityMonitor, ContinuityReport};
pub use errors::*;
pub use handshake::{Handshake, HandshakeConfig, LinkStatus, Phase, ShellEvents};
pub use serial::{available_ports, PortConfig, PortInfo, SerialLinks};
pub use session::{Acquisition, DecodedBlock, DeviceLinks, FrameSink, SessionConfig};
