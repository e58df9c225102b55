//! Framing for events carried over a byte stream (the engine's stdio).
//!
//! Two wire formats:
//! - `cbor`: `[4-byte big-endian length][CBOR payload]`
//! - `json`: one JSON document per line

use crate::error::{DeckError, DeckResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;
use std::str::FromStr;

/// Largest frame accepted by the decoder (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Wire format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    #[default]
    Cbor,
    Json,
}

impl FromStr for WireFormat {
    type Err = DeckError;

    fn from_str(s: &str) -> DeckResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cbor" => Ok(WireFormat::Cbor),
            "json" => Ok(WireFormat::Json),
            other => Err(DeckError::Config(format!("unknown wire format: {other}"))),
        }
    }
}

/// Encode a value into one frame of the given format.
pub fn frame_encode<T: Serialize>(format: WireFormat, value: &T) -> DeckResult<Vec<u8>> {
    match format {
        WireFormat::Cbor => {
            let mut payload = Vec::new();
            ciborium::into_writer(value, &mut payload)?;

            let len = u32::try_from(payload.len())
                .map_err(|_| DeckError::Codec("frame too large".into()))?;
            let mut frame = Vec::with_capacity(4 + payload.len());
            frame.extend_from_slice(&len.to_be_bytes());
            frame.extend(payload);
            Ok(frame)
        }
        WireFormat::Json => {
            let mut line = serde_json::to_vec(value)?;
            line.push(b'\n');
            Ok(line)
        }
    }
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: DeserializeOwned>(data: &[u8]) -> DeckResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
///
/// A frame that fails to decode is reported in place and skipped; the
/// decoder keeps going with the next frame. A corrupt CBOR length prefix
/// desynchronizes the stream for good.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    format: WireFormat,
    buffer: Vec<u8>,
    desynchronized: bool,
}

impl FrameDecoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buffer: Vec::new(),
            desynchronized: false,
        }
    }

    /// Feed bytes and return every complete frame, decoded.
    pub fn feed<T: DeserializeOwned>(&mut self, data: &[u8]) -> Vec<DeckResult<T>> {
        if self.desynchronized {
            return Vec::new();
        }
        self.buffer.extend_from_slice(data);
        match self.format {
            WireFormat::Cbor => self.drain_cbor(),
            WireFormat::Json => self.drain_json(),
        }
    }

    fn drain_cbor<T: DeserializeOwned>(&mut self) -> Vec<DeckResult<T>> {
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                    as usize;

            if len > MAX_FRAME_SIZE {
                self.buffer.clear();
                self.desynchronized = true;
                messages.push(Err(DeckError::Codec(format!(
                    "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
                ))));
                break;
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            messages.push(cbor_decode(&self.buffer[4..4 + len]));
            self.buffer.drain(..4 + len);
        }

        messages
    }

    fn drain_json<T: DeserializeOwned>(&mut self) -> Vec<DeckResult<T>> {
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            messages.push(serde_json::from_slice(line).map_err(DeckError::from));
        }

        if self.buffer.len() > MAX_FRAME_SIZE {
            self.buffer.clear();
            messages.push(Err(DeckError::Codec(format!(
                "line exceeds {MAX_FRAME_SIZE} bytes"
            ))));
        }

        messages
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.desynchronized = false;
    }

    /// True once a corrupt length prefix made frame boundaries unknowable.
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Inbound, Outbound, SessionId};

    fn input(id: u64, bytes: &[u8]) -> Inbound {
        Inbound::SessionInput {
            id: SessionId(id),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn cbor_incremental_feed() {
        let msg = input(1, b"ls -la\n");
        let frame = frame_encode(WireFormat::Cbor, &msg).unwrap();
        let mut decoder = FrameDecoder::new(WireFormat::Cbor);

        for i in 0..frame.len() - 1 {
            let decoded: Vec<DeckResult<Inbound>> = decoder.feed(&frame[i..i + 1]);
            assert!(decoded.is_empty());
        }
        let decoded: Vec<DeckResult<Inbound>> = decoder.feed(&frame[frame.len() - 1..]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &msg);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn cbor_outbound_frames_in_order() {
        let events = vec![
            Outbound::SessionOutput {
                id: SessionId(2),
                bytes: b"a".to_vec(),
            },
            Outbound::SessionOpenFailed {
                reason: "nope".into(),
            },
        ];
        let mut combined = Vec::new();
        for e in &events {
            combined.extend(frame_encode(WireFormat::Cbor, e).unwrap());
        }
        let mut decoder = FrameDecoder::new(WireFormat::Cbor);
        let decoded: Vec<Outbound> = decoder
            .feed(&combined)
            .into_iter()
            .collect::<DeckResult<_>>()
            .unwrap();
        assert_eq!(decoded, events);
    }

    #[test]
    fn cbor_oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::new(WireFormat::Cbor);
        let bogus = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let decoded: Vec<DeckResult<Inbound>> = decoder.feed(&bogus);
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], Err(DeckError::Codec(_))));
        assert_eq!(decoder.pending(), 0);
        assert!(decoder.is_desynchronized());
        let after: Vec<DeckResult<Inbound>> = decoder.feed(&[0, 0, 0, 1, 0xf6]);
        assert!(after.is_empty());
    }

    #[test]
    fn json_bad_line_is_skipped() {
        let mut decoder = FrameDecoder::new(WireFormat::Json);
        let mut data = b"{\"type\":\"list_sessions\"}\nnot json\n\n".to_vec();
        data.extend(frame_encode(WireFormat::Json, &Inbound::Shutdown).unwrap());
        data.extend_from_slice(b"{\"type\":\"shut");

        let decoded: Vec<DeckResult<Inbound>> = decoder.feed(&data);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].as_ref().unwrap(), &Inbound::ListSessions);
        assert!(decoded[1].is_err());
        assert_eq!(decoded[2].as_ref().unwrap(), &Inbound::Shutdown);
        assert_eq!(decoder.pending(), b"{\"type\":\"shut".len());

        let rest: Vec<DeckResult<Inbound>> = decoder.feed(b"down\"}\n");
        assert_eq!(rest[0].as_ref().unwrap(), &Inbound::Shutdown);
    }

    #[test]
    fn wire_format_parse() {
        assert_eq!("JSON".parse::<WireFormat>().unwrap(), WireFormat::Json);
        assert_eq!("cbor".parse::<WireFormat>().unwrap(), WireFormat::Cbor);
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
