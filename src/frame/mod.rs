//! The CQL native protocol framing layer: header, opcodes, flags, and the incremental
//! frame reader.

pub(crate) mod codec;
mod reader;
pub(crate) mod request;
pub(crate) mod response;

use bitflags::bitflags;

use crate::{
    compression::Compressor,
    error::{Error, Result},
    options::ProtocolVersion,
};

pub(crate) use reader::FrameReader;

/// The stream id the server uses for pushed EVENT frames.
pub(crate) const EVENT_STREAM_ID: i16 = -1;

/// Bit marking a frame as server-to-client in the version byte.
const DIRECTION_RESPONSE: u8 = 0x80;

/// A header is always 9 bytes: version, flags, stream (i16), opcode, body length (u32).
pub(crate) const HEADER_LENGTH: usize = 9;

/// An upper bound on body length; anything larger is treated as a protocol error
/// rather than an allocation request.
pub(crate) const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

bitflags! {
    /// The flag bits of a frame header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct FrameFlags: u8 {
        const COMPRESSION    = 0x01;
        const TRACING        = 0x02;
        const CUSTOM_PAYLOAD = 0x04;
        const WARNING        = 0x08;
    }
}

/// The opcodes of the native protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    /// Attempt to infer the opcode based on the numeric value.
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(Error::protocol(format!("invalid opcode: 0x{:02x}", other))),
        })
    }
}

/// A complete frame with its body decompressed.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) flags: FrameFlags,
    pub(crate) stream: i16,
    pub(crate) opcode: Opcode,
    pub(crate) body: Vec<u8>,
}

impl Frame {
    pub(crate) fn new(stream: i16, opcode: Opcode, body: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::empty(),
            stream,
            opcode,
            body,
        }
    }

    /// Serializes the frame into a single buffer so the writer can emit it with one
    /// `write_all`, keeping frames atomic on the socket.
    pub(crate) fn encode(
        mut self,
        version: ProtocolVersion,
        compressor: Option<&Compressor>,
    ) -> Result<Vec<u8>> {
        // STARTUP itself is never compressed: compression only takes effect once it
        // has been negotiated by that STARTUP.
        if let Some(compressor) = compressor {
            if self.opcode != Opcode::Startup && !self.body.is_empty() {
                self.body = compressor.compress(&self.body)?;
                self.flags |= FrameFlags::COMPRESSION;
            }
        }

        let mut buf = Vec::with_capacity(HEADER_LENGTH + self.body.len());
        buf.push(version.as_byte());
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.stream.to_be_bytes());
        buf.push(self.opcode as u8);
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decodes a header plus complete body, transparently decompressing.
    pub(crate) fn decode(
        header: &[u8],
        body: Vec<u8>,
        compressor: Option<&Compressor>,
    ) -> Result<Self> {
        debug_assert_eq!(header.len(), HEADER_LENGTH);
        let version_byte = header[0];
        if version_byte & DIRECTION_RESPONSE == 0 {
            return Err(Error::protocol(format!(
                "expected a response frame, got version byte 0x{:02x}",
                version_byte
            )));
        }
        let flags = FrameFlags::from_bits_truncate(header[1]);
        let stream = i16::from_be_bytes([header[2], header[3]]);
        let opcode = Opcode::from_u8(header[4])?;

        let body = if flags.contains(FrameFlags::COMPRESSION) {
            match compressor {
                Some(compressor) => compressor.decompress(&body)?,
                None => {
                    return Err(Error::protocol(
                        "server sent a compressed frame but no compression was negotiated",
                    ))
                }
            }
        } else {
            body
        };

        Ok(Self {
            flags,
            stream,
            opcode,
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_header_big_endian() {
        let frame = Frame::new(0x0102, Opcode::Query, vec![0xAA, 0xBB]);
        let bytes = frame.encode(ProtocolVersion::V4, None).unwrap();
        assert_eq!(
            bytes,
            vec![0x04, 0x00, 0x01, 0x02, 0x07, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB]
        );
    }

    #[test]
    fn rejects_request_direction_on_decode() {
        // Version byte without the response bit set.
        let header = [0x04u8, 0x00, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x00];
        assert!(Frame::decode(&header, Vec::new(), None).is_err());
    }

    #[test]
    fn decodes_negative_stream_id() {
        let header = [0x84u8, 0x00, 0xFF, 0xFF, 0x0C, 0x00, 0x00, 0x00, 0x00];
        let frame = Frame::decode(&header, Vec::new(), None).unwrap();
        assert_eq!(frame.stream, EVENT_STREAM_ID);
        assert_eq!(frame.opcode, Opcode::Event);
    }
}
