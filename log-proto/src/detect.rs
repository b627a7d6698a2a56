// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-sniffing for the auto-detecting server.
//!
//! Pure functions over the first bytes of a connection; given the same
//! prefix they always reach the same verdict, which is what makes the
//! detector deterministic and testable without sockets.

/// Result of probing a prefix for one particular protocol shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Definitely this protocol.
    Success,
    /// Definitely not this protocol.
    Failure,
    /// Too few bytes to decide yet.
    NeedMoreData,
}

/// What the detector decided for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// TLS ClientHello; switch the TLS layer in and sniff again.
    TlsHandshake,
    /// A TLS alert record carrying `(level, description)`.
    TlsAlert(u8, u8),
    /// Octet-counted framing.
    Framed,
    /// Newline-delimited text.
    Text,
    /// Unrecognizable binary data.
    Binary,
    /// Need more bytes.
    NeedMoreData,
}

/// Probe for a TLS ClientHello record.
///
/// The first message of a TLS connection must be a plaintext handshake
/// record (type 0x16) holding a client_hello (handshake type 0x01) whose
/// lengths are mutually consistent.
pub fn is_tls_client_hello(buf: &[u8]) -> Probe {
    if buf.is_empty() {
        return Probe::NeedMoreData;
    }
    if buf[0] != 0x16 {
        return Probe::Failure;
    }
    if buf.len() < 5 {
        return Probe::NeedMoreData;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as u32;
    // a client_hello is at least 34 bytes
    if record_len < 34 {
        return Probe::Failure;
    }
    if buf.len() < 6 {
        return Probe::NeedMoreData;
    }
    if buf[5] != 0x01 {
        return Probe::Failure;
    }
    if buf.len() < 9 {
        return Probe::NeedMoreData;
    }
    let payload_size = u32::from_be_bytes([0, buf[6], buf[7], buf[8]]);
    // the handshake message cannot be bigger than the enclosing record
    if payload_size + 4 > record_len {
        return Probe::Failure;
    }
    Probe::Success
}

/// Probe for a TLS alert record (type 0x15, two-byte body).
pub fn is_tls_client_alert(buf: &[u8]) -> Probe {
    if buf.is_empty() {
        return Probe::NeedMoreData;
    }
    if buf[0] != 0x15 {
        return Probe::Failure;
    }
    if buf.len() < 5 {
        return Probe::NeedMoreData;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]);
    if record_len != 2 {
        return Probe::Failure;
    }
    if buf.len() < 7 {
        return Probe::NeedMoreData;
    }
    Probe::Success
}

/// Alert level and description bytes; only valid after
/// [`is_tls_client_alert`] returned `Success`.
pub fn tls_alert_fields(buf: &[u8]) -> (u8, u8) {
    (buf[5], buf[6])
}

/// Anything below 0x20 that is not whitespace marks binary data.
pub fn is_binary_data(buf: &[u8]) -> bool {
    buf.iter()
        .any(|&b| b < 0x20 && !(b as char).is_ascii_whitespace())
}

/// Run the decision table over `buf`.
///
/// `tls_eligible` is false once a TLS handshake already happened (the
/// decrypted stream cannot nest another one).
pub fn detect(buf: &[u8], tls_eligible: bool) -> Detection {
    if buf.is_empty() {
        return Detection::NeedMoreData;
    }
    if tls_eligible {
        match is_tls_client_hello(buf) {
            Probe::Success => return Detection::TlsHandshake,
            Probe::NeedMoreData => return Detection::NeedMoreData,
            Probe::Failure => {}
        }
        match is_tls_client_alert(buf) {
            Probe::Success => {
                let (level, desc) = tls_alert_fields(buf);
                return Detection::TlsAlert(level, desc);
            }
            Probe::NeedMoreData => return Detection::NeedMoreData,
            Probe::Failure => {}
        }
    }
    if buf[0].is_ascii_digit() {
        return Detection::Framed;
    }
    if buf[0] == b'<' {
        return Detection::Text;
    }
    if is_binary_data(buf) {
        return Detection::Binary;
    }
    Detection::Text
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_HELLO: &[u8] = &[0x16, 0x03, 0x01, 0x00, 0x2a, 0x01, 0x00, 0x00, 0x26];

    #[test]
    fn client_hello_detected() {
        assert_eq!(detect(CLIENT_HELLO, true), Detection::TlsHandshake);
        // not eligible after a handshake already happened
        assert_eq!(detect(CLIENT_HELLO, false), Detection::Binary);
    }

    #[test]
    fn client_hello_needs_enough_bytes() {
        assert_eq!(is_tls_client_hello(&CLIENT_HELLO[..1]), Probe::NeedMoreData);
        assert_eq!(is_tls_client_hello(&CLIENT_HELLO[..5]), Probe::NeedMoreData);
        assert_eq!(is_tls_client_hello(CLIENT_HELLO), Probe::Success);
    }

    #[test]
    fn undersized_hello_record_fails() {
        // record length 16 cannot hold a client_hello
        let buf = [0x16, 0x03, 0x01, 0x00, 0x10, 0x01];
        assert_eq!(is_tls_client_hello(&buf), Probe::Failure);
    }

    #[test]
    fn alert_detected_with_fields() {
        let alert = [0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x28];
        assert_eq!(detect(&alert, true), Detection::TlsAlert(2, 0x28));
    }

    #[test]
    fn framed_and_text_prefixes() {
        assert_eq!(detect(b"123 <13>m", true), Detection::Framed);
        assert_eq!(detect(b"<13>message", true), Detection::Text);
        assert_eq!(detect(b"plain words", true), Detection::Text);
    }

    #[test]
    fn binary_garbage_rejected() {
        assert_eq!(detect(&[0x00, 0x01, 0x02], true), Detection::Binary);
        // whitespace control bytes are not binary
        assert_eq!(detect(b"\t indented", true), Detection::Text);
    }

    #[test]
    fn detection_is_deterministic_over_fixed_prefixes() {
        let prefixes: Vec<Vec<u8>> = vec![
            CLIENT_HELLO.to_vec(),
            b"123 payload bytes".to_vec(),
            b"<13>1 2024-01-01T00:00:00Z h a p i -".to_vec(),
            vec![0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x28],
            vec![0x00; 16],
        ];
        for prefix in prefixes {
            let first = detect(&prefix, true);
            for _ in 0..10 {
                assert_eq!(detect(&prefix, true), first);
            }
            assert_ne!(first, Detection::NeedMoreData);
        }
    }
}
