//! RTP packet parsing (RFC 3550 §5.1). The parser never copies the payload —
//! it returns a view borrowing the input slice.

use crate::error::{Error, Result};

const FIXED_HEADER_LEN: usize = 12;

/// A parsed view over one RTP packet. Borrows `payload` from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parses `buf` as one RTP packet. Rejects packets shorter than the fixed
    /// 12-byte header, packets not claiming version 2, and packets whose
    /// declared CSRC count / extension header / padding count don't fit
    /// within the buffer.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(Error::MalformedRtp(format!(
                "packet too short: {} bytes, need at least {FIXED_HEADER_LEN}",
                buf.len()
            )));
        }

        let b0 = buf[0];
        let version = b0 >> 6;
        if version != 2 {
            return Err(Error::MalformedRtp(format!("unsupported RTP version {version}")));
        }
        let padding = (b0 & 0b0010_0000) != 0;
        let extension = (b0 & 0b0001_0000) != 0;
        let csrc_count = (b0 & 0b0000_1111) as usize;

        let b1 = buf[1];
        let marker = (b1 & 0b1000_0000) != 0;
        let payload_type = b1 & 0b0111_1111;

        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let csrc_len = csrc_count * 4;
        let mut offset = FIXED_HEADER_LEN;
        if buf.len() < offset + csrc_len {
            return Err(Error::MalformedRtp(format!(
                "declared {csrc_count} CSRC identifiers don't fit in {} remaining bytes",
                buf.len() - offset
            )));
        }
        let csrc = &buf[offset..offset + csrc_len];
        offset += csrc_len;

        if extension {
            if buf.len() < offset + 4 {
                return Err(Error::MalformedRtp("extension header doesn't fit".into()));
            }
            let ext_len_words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            let ext_total = 4 + ext_len_words * 4;
            if buf.len() < offset + ext_total {
                return Err(Error::MalformedRtp("extension body doesn't fit".into()));
            }
            offset += ext_total;
        }

        let mut payload_end = buf.len();
        if padding {
            let pad_count = *buf
                .last()
                .ok_or_else(|| Error::MalformedRtp("empty packet with padding bit set".into()))?
                as usize;
            if pad_count == 0 || offset + pad_count > payload_end {
                return Err(Error::MalformedRtp(format!(
                    "padding count {pad_count} inconsistent with packet length"
                )));
            }
            payload_end -= pad_count;
        }

        if offset > payload_end {
            return Err(Error::MalformedRtp("header consumes more than packet length".into()));
        }

        Ok(RtpPacket {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            payload: &buf[offset..payload_end],
        })
    }
}

/// True if `newer` is ahead of `older` in the modulo-2^16 sequence space,
/// i.e. the forward distance from `older` to `newer` is shorter than the
/// backward one. Used to tolerate sequence-number wraparound.
pub fn sequence_greater_than(newer: u16, older: u16) -> bool {
    let diff = newer.wrapping_sub(older);
    diff != 0 && diff < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_packet(marker: bool, pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + payload.len());
        buf.push(0b1000_0000); // version 2, no padding, no extension, 0 CSRC
        buf.push((marker as u8) << 7 | (pt & 0x7F));
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parses_minimal_packet() {
        let buf = build_packet(true, 96, 42, 90000, 0xdeadbeef, b"hello");
        let pkt = RtpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.version, 2);
        assert!(pkt.marker);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(pkt.sequence_number, 42);
        assert_eq!(pkt.timestamp, 90000);
        assert_eq!(pkt.ssrc, 0xdeadbeef);
        assert_eq!(pkt.payload, b"hello");
    }

    #[test]
    fn rejects_short_packet() {
        assert!(RtpPacket::parse(&[0u8; 11]).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = build_packet(false, 0, 0, 0, 0, b"");
        buf[0] = 0b0100_0000; // version 1
        assert!(matches!(RtpPacket::parse(&buf), Err(Error::MalformedRtp(_))));
    }

    #[test]
    fn rejects_csrc_overrun() {
        let mut buf = build_packet(false, 0, 0, 0, 0, b"xy");
        buf[0] |= 0x0F; // claim 15 CSRC identifiers that don't fit
        assert!(RtpPacket::parse(&buf).is_err());
    }

    #[test]
    fn subtracts_padding_from_payload() {
        let mut buf = build_packet(false, 0, 0, 0, 0, b"");
        buf[0] |= 0b0010_0000; // padding bit
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&[0x00, 0x02]); // 2 padding bytes, last one is the count
        let pkt = RtpPacket::parse(&buf).unwrap();
        assert_eq!(pkt.payload, b"data");
    }

    #[test]
    fn rejects_inconsistent_padding() {
        let mut buf = build_packet(false, 0, 0, 0, 0, b"d");
        buf[0] |= 0b0010_0000;
        let last = buf.len() - 1;
        buf[last] = 200; // padding count far exceeds payload length
        assert!(RtpPacket::parse(&buf).is_err());
    }

    #[test]
    fn sequence_wraparound_is_not_loss() {
        assert!(sequence_greater_than(65535, 65534));
        assert!(sequence_greater_than(0, 65535));
        assert!(sequence_greater_than(1, 0));
        assert!(!sequence_greater_than(65534, 65535));
    }
}
