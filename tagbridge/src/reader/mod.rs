//! Reader command codec.
//!
//! This module handles the encoding and decoding of command and response
//! frames for the UART-attached RFID reader.
//!
//! # Frame format
//!
//! ```text
//! Command:  [0x50] [0x00]   [PayloadLen:1] [Command:1] [Payload:N] [Checksum:1]
//! Response: [0x50] [Status] [PayloadLen:1] [Command:1] [Payload:N] [Checksum:1]
//! ```
//!
//! The second byte is reserved (always 0x00) in commands; responses reuse it
//! as the outcome: 0x00 is an ACK, any other value is the reader's exception
//! code for the echoed command byte. The checksum is an XOR over every
//! preceding frame byte (see [`checksum`]).
//!
//! The decoder keeps the raw bytes of every frame it yields so the tunnel
//! path can hand responses to the Modbus master without interpreting them.

pub mod checksum;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::time::Duration;
use strum::FromRepr;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::tracing::prelude::*;
use self::checksum::{checksum, checksum_is_valid};

/// First byte of every frame in either direction.
pub const FRAME_START: u8 = 0x50;

/// Start byte + status/reserved byte + payload length byte + command byte.
const HEADER_LEN: usize = 4;

/// Largest payload the reader ever produces (tunnel responses included).
const MAX_PAYLOAD: usize = 64;

/// Reader command bytes.
///
/// The LED (0x03), version (0x04) and continuous-read (0x22) ids are attested
/// by captured frames; the MIFARE ids sit in the same command page.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Login = 0x02,
    Led = 0x03,
    GetVersion = 0x04,
    Authenticate = 0x05,
    ReadBlock = 0x06,
    WriteBlock = 0x07,
    Continuous = 0x22,
}

/// Which MIFARE key slot to authenticate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelect {
    A,
    B,
}

impl KeySelect {
    /// MIFARE Classic authentication code as sent on the wire.
    pub fn key_code(self) -> u8 {
        match self {
            KeySelect::A => 0x60,
            KeySelect::B => 0x61,
        }
    }
}

/// A command frame to be sent to the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Unlock the reader's command set. Sent once per transaction.
    Login,
    /// Drive the external LED ring.
    Led { duration: u8, enable: u8, color: u8 },
    /// Query the reader firmware version string.
    GetVersion,
    /// Authenticate the sector containing `block` with a 6-byte key.
    Authenticate {
        key: KeySelect,
        block: u8,
        secret: [u8; 6],
    },
    /// Read one 16-byte block.
    ReadBlock { block: u8 },
    /// Write one 16-byte block.
    WriteBlock { block: u8, data: [u8; 16] },
    /// Start continuous UID polling.
    StartContinuous,
    /// Stop continuous UID polling.
    StopContinuous,
    /// A pre-framed command forwarded verbatim (tunnel passthrough).
    /// Never inspected, never re-checksummed.
    Raw(Bytes),
}

impl Command {
    /// The command byte this frame carries. For raw passthrough this peeks
    /// at the frame's command position and falls back to 0 on short input.
    pub fn command_byte(&self) -> u8 {
        match self {
            Command::Login => CommandId::Login as u8,
            Command::Led { .. } => CommandId::Led as u8,
            Command::GetVersion => CommandId::GetVersion as u8,
            Command::Authenticate { .. } => CommandId::Authenticate as u8,
            Command::ReadBlock { .. } => CommandId::ReadBlock as u8,
            Command::WriteBlock { .. } => CommandId::WriteBlock as u8,
            Command::StartContinuous | Command::StopContinuous => CommandId::Continuous as u8,
            Command::Raw(frame) => frame.get(3).copied().unwrap_or(0),
        }
    }

    /// Fixed response deadline for this command's class. Not configurable.
    pub fn timeout(&self) -> Duration {
        match self {
            Command::Login
            | Command::Led { .. }
            | Command::GetVersion
            | Command::StartContinuous
            | Command::StopContinuous => Duration::from_millis(100),
            Command::Authenticate { .. } => Duration::from_millis(150),
            Command::ReadBlock { .. } | Command::WriteBlock { .. } => Duration::from_millis(250),
            Command::Raw(_) => Duration::from_millis(500),
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Command::Login | Command::GetVersion => {}
            Command::Led {
                duration,
                enable,
                color,
            } => {
                dst.put_u8(*duration);
                dst.put_u8(*enable);
                dst.put_u8(*color);
            }
            Command::Authenticate { key, block, secret } => {
                dst.put_u8(key.key_code());
                dst.put_u8(*block);
                dst.put_slice(secret);
            }
            Command::ReadBlock { block } => {
                dst.put_u8(*block);
            }
            Command::WriteBlock { block, data } => {
                dst.put_u8(*block);
                dst.put_slice(data);
            }
            Command::StartContinuous => {
                dst.put_slice(&[0x10, 0x26]);
            }
            Command::StopContinuous => {
                dst.put_slice(&[0x00, 0x00]);
            }
            // Raw frames bypass payload encoding entirely.
            Command::Raw(_) => {}
        }
    }

    /// Encode this command as a complete frame.
    pub fn to_frame(&self) -> Bytes {
        if let Command::Raw(frame) = self {
            return frame.clone();
        }

        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + 1);
        frame.put_u8(FRAME_START);
        frame.put_u8(0x00);
        frame.put_u8(payload.len() as u8);
        frame.put_u8(self.command_byte());
        frame.put_slice(&payload);
        frame.put_u8(checksum(&frame));
        frame.freeze()
    }
}

/// Codec-level failures, surfaced when a complete frame is interpreted
/// outside the resynchronizing stream decoder.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("bad start byte: 0x{0:02x}")]
    BadStart(u8),

    #[error("length field {length} does not match frame of {have} bytes")]
    LengthMismatch { length: u8, have: usize },

    #[error("checksum mismatch")]
    BadChecksum,
}

/// A decoded response frame.
///
/// The command byte stays an uninterpreted `u8` at this layer: tunnel
/// responses may carry command bytes this firmware has no notion of, and the
/// controller checks echo/expectation itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Outcome byte: 0x00 = ACK, anything else is a reader exception code.
    pub status: u8,
    /// Echoed command byte.
    pub command: u8,
    /// Payload bytes.
    pub payload: Bytes,
    /// The complete frame as received, checksum included.
    pub raw: Bytes,
}

impl Response {
    /// Parse one complete frame, validating structure and checksum.
    pub fn parse(raw: Bytes) -> Result<Response, CodecError> {
        if raw.len() < HEADER_LEN + 1 {
            return Err(CodecError::TooShort(raw.len()));
        }
        if raw[0] != FRAME_START {
            return Err(CodecError::BadStart(raw[0]));
        }
        let length = raw[2];
        if raw.len() != HEADER_LEN + length as usize + 1 {
            return Err(CodecError::LengthMismatch {
                length,
                have: raw.len(),
            });
        }
        if !checksum_is_valid(&raw) {
            return Err(CodecError::BadChecksum);
        }

        Ok(Response {
            status: raw[1],
            command: raw[3],
            payload: raw.slice(HEADER_LEN..raw.len() - 1),
            raw,
        })
    }

    /// Whether the reader acknowledged the command.
    pub fn is_ack(&self) -> bool {
        self.status == 0x00
    }

    /// The reader's exception code, if this is a NAK.
    pub fn exception(&self) -> Option<u8> {
        (!self.is_ack()).then_some(self.status)
    }

    /// Interpret this frame as an unsolicited tag report, if it is one.
    ///
    /// Continuous-read ACKs carry `[uid_len, uid.., atqa_hi, atqa_lo, sak]`;
    /// a UID length of zero means the tag left the field.
    pub fn tag_report(&self) -> Option<TagReport> {
        if self.command != CommandId::Continuous as u8 || !self.is_ack() {
            return None;
        }
        let p = &self.payload;
        let uid_len = *p.first()? as usize;
        if uid_len == 0 {
            return Some(TagReport::empty());
        }
        if uid_len > TagReport::MAX_UID_LEN || p.len() < 1 + uid_len + 3 {
            return None;
        }
        let mut uid = [0u8; TagReport::MAX_UID_LEN];
        uid[..uid_len].copy_from_slice(&p[1..1 + uid_len]);
        Some(TagReport {
            uid,
            uid_len: uid_len as u8,
            atqa: u16::from_be_bytes([p[1 + uid_len], p[2 + uid_len]]),
            sak: p[3 + uid_len],
        })
    }
}

/// Tag presence as reported by continuous UID polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagReport {
    pub uid: [u8; Self::MAX_UID_LEN],
    pub uid_len: u8,
    pub atqa: u16,
    pub sak: u8,
}

impl TagReport {
    /// ISO14443A allows single, double and triple size UIDs (4/7/10 bytes).
    pub const MAX_UID_LEN: usize = 10;

    /// The "no tag in field" report.
    pub fn empty() -> Self {
        Self {
            uid: [0; Self::MAX_UID_LEN],
            uid_len: 0,
            atqa: 0,
            sak: 0,
        }
    }
}

/// Tokio codec for reader frames.
#[derive(Default)]
pub struct FrameCodec;

impl Encoder<Command> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = command.to_frame();
        trace!("TX: {:?} ({} bytes) => {:02x?}", command, frame.len(), &frame[..]);
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Return Ok(Some) with a valid frame, or Ok(None) to be called again
        // with more data. An invalid prefix consumes one byte and resyncs;
        // returning Err would terminate the stream, so we never do that for
        // line noise.
        const CALL_AGAIN: Result<Option<Response>, io::Error> = Ok(None);

        loop {
            if src.is_empty() {
                return CALL_AGAIN;
            }
            if src[0] != FRAME_START {
                src.advance(1);
                continue;
            }
            if src.len() < 3 {
                return CALL_AGAIN;
            }
            let payload_len = src[2] as usize;
            if payload_len > MAX_PAYLOAD {
                trace!("Frame sync lost: implausible length {}, resyncing", payload_len);
                src.advance(1);
                continue;
            }
            let total = HEADER_LEN + payload_len + 1;
            if src.len() < total {
                return CALL_AGAIN;
            }
            if !checksum_is_valid(&src[..total]) {
                trace!("Frame sync lost: checksum failed, resyncing");
                src.advance(1);
                continue;
            }

            let raw = src.split_to(total).freeze();
            match Response::parse(raw) {
                Ok(response) => {
                    trace!(
                        "RX: cmd=0x{:02x} status=0x{:02x} ({} bytes) => {:02x?}",
                        response.command,
                        response.status,
                        response.raw.len(),
                        &response.raw[..]
                    );
                    return Ok(Some(response));
                }
                // Structure and checksum were already validated; parse
                // failures here mean the constants above disagree.
                Err(err) => {
                    warn!("Dropped frame that failed validation twice: {}", err);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod command_tests {
    use super::*;

    fn assert_frame_eq(cmd: Command, expect: &[u8]) {
        let frame = cmd.to_frame();
        assert_eq!(
            &frame[..],
            expect,
            "\nFrame mismatch!\nExpected: {:02x?}\nActual:   {:02x?}",
            expect,
            &frame[..]
        );
    }

    #[test]
    fn led_blue_from_capture() {
        // Documented worked example: permanent blue.
        assert_frame_eq(
            Command::Led {
                duration: 0xff,
                enable: 0x07,
                color: 0x04,
            },
            &[0x50, 0x00, 0x03, 0x03, 0xff, 0x07, 0x04, 0xac],
        );
    }

    #[test]
    fn led_off_from_capture() {
        assert_frame_eq(
            Command::Led {
                duration: 0xff,
                enable: 0x07,
                color: 0x00,
            },
            &[0x50, 0x00, 0x03, 0x03, 0xff, 0x07, 0x00, 0xa8],
        );
    }

    #[test]
    fn get_version_from_capture() {
        assert_frame_eq(Command::GetVersion, &[0x50, 0x00, 0x00, 0x04, 0x54]);
    }

    #[test]
    fn start_continuous_from_capture() {
        assert_frame_eq(
            Command::StartContinuous,
            &[0x50, 0x00, 0x02, 0x22, 0x10, 0x26, 0x46],
        );
    }

    #[test]
    fn stop_continuous() {
        assert_frame_eq(
            Command::StopContinuous,
            &[0x50, 0x00, 0x02, 0x22, 0x00, 0x00, 0x70],
        );
    }

    #[test]
    fn authenticate_key_a() {
        let frame = Command::Authenticate {
            key: KeySelect::A,
            block: 0x04,
            secret: [0xff; 6],
        }
        .to_frame();

        assert_eq!(frame[2], 0x08); // key code + block + 6 key bytes
        assert_eq!(frame[3], CommandId::Authenticate as u8);
        assert_eq!(frame[4], 0x60);
        assert_eq!(frame[5], 0x04);
        assert_eq!(&frame[6..12], &[0xff; 6]);
        assert!(checksum_is_valid(&frame));
    }

    #[test]
    fn write_block_carries_all_sixteen_bytes() {
        let data: [u8; 16] = core::array::from_fn(|i| i as u8);
        let frame = Command::WriteBlock { block: 9, data }.to_frame();

        assert_eq!(frame[2], 17);
        assert_eq!(frame[3], CommandId::WriteBlock as u8);
        assert_eq!(frame[4], 9);
        assert_eq!(&frame[5..21], &data);
        assert!(checksum_is_valid(&frame));
    }

    #[test]
    fn raw_passthrough_is_verbatim() {
        // Deliberately bogus checksum: tunnel frames are never touched.
        let raw = Bytes::from_static(&[0x50, 0x00, 0x00, 0x04, 0x00]);
        assert_eq!(Command::Raw(raw.clone()).to_frame(), raw);
        assert_eq!(Command::Raw(raw).command_byte(), 0x04);
    }
}

#[cfg(test)]
mod decode_tests {
    use super::*;

    fn frame(status: u8, command: u8, payload: &[u8]) -> Bytes {
        let mut f = BytesMut::new();
        f.put_u8(FRAME_START);
        f.put_u8(status);
        f.put_u8(payload.len() as u8);
        f.put_u8(command);
        f.put_slice(payload);
        f.put_u8(checksum(&f));
        f.freeze()
    }

    #[test]
    fn parse_ack_with_payload() {
        let data: [u8; 16] = [0xaa; 16];
        let response = Response::parse(frame(0x00, 0x06, &data)).unwrap();
        assert!(response.is_ack());
        assert_eq!(response.command, 0x06);
        assert_eq!(&response.payload[..], &data);
    }

    #[test]
    fn parse_nak_exposes_exception() {
        let response = Response::parse(frame(0x16, 0x05, &[])).unwrap();
        assert!(!response.is_ack());
        assert_eq!(response.exception(), Some(0x16));
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let mut bad = BytesMut::from(&frame(0x00, 0x04, &[])[..]);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert_eq!(
            Response::parse(bad.freeze()),
            Err(CodecError::BadChecksum)
        );
    }

    #[test]
    fn decoder_resyncs_over_noise() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x12, 0x34]); // line noise
        buf.put_slice(&frame(0x00, 0x22, &[0x00]));

        let response = codec.decode(&mut buf).unwrap().expect("frame after noise");
        assert_eq!(response.command, 0x22);
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_waits_for_complete_frame() {
        let mut codec = FrameCodec;
        let full = frame(0x00, 0x06, &[0x11; 16]);
        let mut buf = BytesMut::from(&full[..7]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(&full[7..]);
        let response = codec.decode(&mut buf).unwrap().expect("completed frame");
        assert_eq!(response.payload.len(), 16);
    }

    #[test]
    fn tag_report_round_trip() {
        let payload = [0x04, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x04, 0x08];
        let response = Response::parse(frame(0x00, 0x22, &payload)).unwrap();
        let report = response.tag_report().expect("tag report");
        assert_eq!(report.uid_len, 4);
        assert_eq!(&report.uid[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(report.atqa, 0x0004);
        assert_eq!(report.sak, 0x08);
    }

    #[test]
    fn empty_tag_report_means_tag_removed() {
        let response = Response::parse(frame(0x00, 0x22, &[0x00])).unwrap();
        assert_eq!(response.tag_report(), Some(TagReport::empty()));
    }

    #[test]
    fn non_continuous_frames_are_not_tag_reports() {
        let response = Response::parse(frame(0x00, 0x06, &[0xaa; 16])).unwrap();
        assert!(response.tag_report().is_none());
    }
}
