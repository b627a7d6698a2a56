// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog framings as [`tokio_util::codec::Decoder`]s.
//!
//! Octet-counted framing reads `DIGITS ' ' PAYLOAD{len}` (RFC 6587);
//! non-transparent framing reads to the next newline. Both are driven by
//! the protocol server over its own buffer, so they also compose with
//! any `Framed` transport.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Octet counts above this reject the connection outright; a peer
/// announcing gigabyte frames is broken or hostile.
pub const OCTET_COUNT_LIMIT: u64 = 1_000_000_000;

const OCTET_DIGITS_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds the permitted maximum")]
    OversizedFrame(u64),
    #[error("invalid octet count prefix")]
    BadFrameHeader,
}

/// `DIGITS ' ' PAYLOAD{len}` framing.
#[derive(Debug, Clone)]
pub struct OctetCountedDecoder {
    /// Per-record ceiling (defaults well under [`OCTET_COUNT_LIMIT`]).
    pub max_record: usize,
}

impl Default for OctetCountedDecoder {
    fn default() -> Self {
        OctetCountedDecoder {
            max_record: 64 * 1024,
        }
    }
}

impl Decoder for OctetCountedDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        let Some(space) = src.iter().position(|&b| b == b' ') else {
            if src.iter().any(|b| !b.is_ascii_digit()) {
                return Err(FramingError::BadFrameHeader);
            }
            if src.len() > OCTET_DIGITS_LIMIT {
                return Err(FramingError::OversizedFrame(OCTET_COUNT_LIMIT));
            }
            return Ok(None);
        };
        if space == 0 || space > OCTET_DIGITS_LIMIT {
            return Err(FramingError::BadFrameHeader);
        }
        let digits = &src[..space];
        if digits.iter().any(|b| !b.is_ascii_digit()) {
            return Err(FramingError::BadFrameHeader);
        }
        let len: u64 = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(FramingError::BadFrameHeader)?;
        if len > OCTET_COUNT_LIMIT || len > self.max_record as u64 {
            return Err(FramingError::OversizedFrame(len));
        }
        let frame_end = space + 1 + len as usize;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }
        src.advance(space + 1);
        Ok(Some(src.split_to(len as usize).freeze()))
    }
}

/// Newline-delimited framing; a CR before the LF is trimmed.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    /// Lines longer than this are truncated (the tail is discarded up to
    /// the newline).
    pub max_line: usize,
    pub(crate) discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        LineDecoder {
            max_line: 64 * 1024,
            discarding: false,
        }
    }
}

impl LineDecoder {
    fn trim(mut line: BytesMut) -> Bytes {
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        line.freeze()
    }
}

impl Decoder for LineDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        loop {
            let newline = src.iter().position(|&b| b == b'\n');
            if self.discarding {
                match newline {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }
            match newline {
                Some(pos) => {
                    let line = src.split_to(pos);
                    src.advance(1);
                    return Ok(Some(Self::trim(line)));
                }
                None if src.len() > self.max_line => {
                    // emit the truncated head, discard to the newline
                    tracing::warn!(max_line = self.max_line, "over-long line truncated");
                    let line = src.split_to(self.max_line);
                    self.discarding = true;
                    return Ok(Some(Self::trim(line)));
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() || self.discarding {
            return Ok(None);
        }
        let line = src.split_to(src.len());
        Ok(Some(Self::trim(line)))
    }
}
