//! Frame assembler for the binary data link.
//!
//! Packet layout (all multi-byte fields little-endian):
//!
//! ```text
//! [0x02][length][type][rows][timestamp:u16][payload: length - 4 bytes]
//! ```
//!
//! - `type`: high nibble = channel-type id, low nibble = wire columns per row
//! - `rows`: bit 7 = end-of-stream flag, bits 0-6 = row count
//! - `length` = `rows * wire_columns * 2 + 4`
//!
//! The assembler keeps one growable buffer per link. Anything that does not
//! look like a complete, consistent packet for a registered channel is
//! dropped one byte at a time until the stream lines up again.

use std::sync::Arc;

use log::{debug, warn};

use crate::channels::{ChannelDescriptor, ChannelRegistry};
use crate::codec::{decode_payload, infer_bit_width, wire_columns, SampleFrame};
use crate::errors::{DriverError, Result};

/// First byte of every packet.
pub const START_BYTE: u8 = 0x02;

/// Size of the type/rows/timestamp sub-header counted in `length`.
pub const HEADER_SIZE: usize = 4;

/// Start byte plus length byte.
const PREFIX_SIZE: usize = 2;

const MAX_ROWS: u8 = 0x7F;
const EOF_FLAG: u8 = 0x80;

// ============================================================================
// Data Types
// ============================================================================

/// A synchronised packet, resolved against the channel registry.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Channel-type id from the high nibble of the type byte.
    pub nibble: u8,
    /// Words per row declared by the low nibble of the type byte.
    pub wire_columns: u8,
    pub rows: u8,
    /// End-of-stream flag (bit 7 of the rows byte).
    pub eof: bool,
    /// Device timestamp in ms, wraps every 65536 ms.
    pub timestamp: u16,
    /// Exactly `rows * wire_columns * 2` bytes.
    pub payload: Vec<u8>,
    /// Registry entry at the time the packet was emitted.
    pub descriptor: Arc<ChannelDescriptor>,
    /// Width this packet decodes with. Normally the configured width, or the
    /// width uniquely implied by `wire_columns` when the two disagree.
    pub bit_width: u8,
}

impl RawPacket {
    pub fn channel(&self) -> &str {
        &self.descriptor.name
    }

    /// Unpack the payload into per-channel rows.
    pub fn decode(&self) -> Vec<SampleFrame> {
        decode_payload(
            &self.payload,
            self.descriptor.channels(),
            self.bit_width,
            self.descriptor.signed,
        )
    }
}

/// Counters kept across the life of an assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub packets: u64,
    /// Bytes dropped while resynchronising.
    pub discarded_bytes: u64,
    /// Headers whose declared length did not match rows and columns.
    pub length_mismatches: u64,
    /// Consistent headers carrying an unregistered channel-type id.
    pub unknown_headers: u64,
    /// Packets whose column count disagreed with the configured width.
    pub width_mismatches: u64,
}

/// Build the wire bytes of one packet.
pub fn encode_packet(
    nibble: u8,
    wire_columns: u8,
    rows: u8,
    eof: bool,
    timestamp: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    if nibble > 0x0F || wire_columns > 0x0F || rows > MAX_ROWS {
        return Err(DriverError::Protocol(format!(
            "header out of range: nibble={nibble} columns={wire_columns} rows={rows}"
        )));
    }
    let expected = usize::from(rows) * usize::from(wire_columns) * 2;
    if payload.len() != expected {
        return Err(DriverError::Protocol(format!(
            "payload is {} bytes, header declares {}",
            payload.len(),
            expected
        )));
    }
    let length = u8::try_from(expected + HEADER_SIZE)
        .map_err(|_| DriverError::Protocol(format!("packet too long: {} bytes", expected)))?;

    let mut out = Vec::with_capacity(PREFIX_SIZE + usize::from(length));
    out.push(START_BYTE);
    out.push(length);
    out.push((nibble << 4) | wire_columns);
    out.push(if eof { rows | EOF_FLAG } else { rows });
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

// ============================================================================
// Assembler
// ============================================================================

pub struct FrameAssembler {
    registry: Arc<ChannelRegistry>,
    buffer: Vec<u8>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            buffer: Vec::with_capacity(1024),
            stats: AssemblerStats::default(),
        }
    }

    /// Append bytes received from the link.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append bytes and collect every packet that became complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<RawPacket> {
        self.extend(data);
        std::iter::from_fn(|| self.next_packet()).collect()
    }

    /// Extract the next complete packet, or `None` if more bytes are needed.
    pub fn next_packet(&mut self) -> Option<RawPacket> {
        loop {
            match self.buffer.iter().position(|&b| b == START_BYTE) {
                Some(0) => {}
                Some(skip) => {
                    self.discard(skip);
                    continue;
                }
                None => {
                    let all = self.buffer.len();
                    self.discard(all);
                    return None;
                }
            }

            if self.buffer.len() < PREFIX_SIZE + HEADER_SIZE {
                return None;
            }

            let length = usize::from(self.buffer[1]);
            let type_byte = self.buffer[2];
            let rows_byte = self.buffer[3];
            let timestamp = u16::from_le_bytes([self.buffer[4], self.buffer[5]]);

            let nibble = type_byte >> 4;
            let columns = type_byte & 0x0F;
            let rows = rows_byte & MAX_ROWS;
            let eof = rows_byte & EOF_FLAG != 0;

            let payload_len = usize::from(rows) * usize::from(columns) * 2;
            if length != payload_len + HEADER_SIZE {
                self.stats.length_mismatches += 1;
                self.discard(1);
                continue;
            }

            let total = PREFIX_SIZE + length;
            if self.buffer.len() < total {
                return None;
            }

            let Some(descriptor) = self.registry.resolve(nibble) else {
                self.stats.unknown_headers += 1;
                self.discard(1);
                continue;
            };

            let mut packet: Vec<u8> = self.buffer.drain(..total).collect();
            let payload = packet.split_off(PREFIX_SIZE + HEADER_SIZE);
            let bit_width = self.effective_bit_width(&descriptor, columns);
            self.stats.packets += 1;

            return Some(RawPacket {
                nibble,
                wire_columns: columns,
                rows,
                eof,
                timestamp,
                payload,
                descriptor,
                bit_width,
            });
        }
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Bytes waiting for the rest of a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn discard(&mut self, n: usize) {
        self.buffer.drain(..n);
        self.stats.discarded_bytes += n as u64;
    }

    /// Configured width, unless the header's column count uniquely implies
    /// another one. Never changes the configuration.
    fn effective_bit_width(&mut self, descriptor: &ChannelDescriptor, columns: u8) -> u8 {
        let configured = descriptor.bit_width;
        let channels = descriptor.channels();
        let expected = wire_columns(channels, configured);
        if expected == usize::from(columns) {
            return configured;
        }

        self.stats.width_mismatches += 1;
        match infer_bit_width(channels, usize::from(columns)) {
            Some(bits) => {
                debug!(
                    "{}: header declares {} columns, decoding this packet as {}-bit",
                    descriptor.name, columns, bits
                );
                bits
            }
            None => {
                warn!(
                    "{}: configured nbits={} => tot_cols={}, but header tot_cols={}",
                    descriptor.name, configured, expected, columns
                );
                configured
            }
        }
    }
}
