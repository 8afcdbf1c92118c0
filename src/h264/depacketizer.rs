//! Reassembles RTP/H.264 payloads (RFC 6184: single NAL, STAP-A, FU-A) into
//! Annex B access units keyed by RTP timestamp.

use log::warn;

use crate::h264::nal;
use crate::rtp::RtpPacket;

/// One coded picture: all NAL units sharing an RTP timestamp, already
/// concatenated into Annex B byte-stream form (each NAL preceded by exactly
/// one `00 00 00 01` start code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub timestamp: u32,
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

#[derive(Default)]
struct FragmentAccumulator {
    header: u8,
    body: Vec<u8>,
}

/// Depacketizer state machine. One instance per RTP stream.
pub struct Depacketizer {
    current_timestamp: Option<u32>,
    current_units: Vec<Vec<u8>>,
    fragment: Option<FragmentAccumulator>,
    fragment_seq_next: Option<u16>,
    /// SPS/PPS NAL units decoded from SDP `sprop-parameter-sets`, injected
    /// into the first emitted access unit only.
    pending_prefix: Option<Vec<Vec<u8>>>,
    /// Local, per-packet error counters; not fatal, just observability.
    pub packets_dropped: u64,
    pub fragments_lost: u64,
}

impl Depacketizer {
    pub fn new() -> Self {
        Depacketizer {
            current_timestamp: None,
            current_units: Vec::new(),
            fragment: None,
            fragment_seq_next: None,
            pending_prefix: None,
            packets_dropped: 0,
            fragments_lost: 0,
        }
    }

    /// Registers out-of-band SPS/PPS NAL units (already including their own
    /// one-byte NAL headers) to prepend to the first access unit emitted.
    pub fn set_parameter_sets(&mut self, nal_units: Vec<Vec<u8>>) {
        if !nal_units.is_empty() {
            self.pending_prefix = Some(nal_units);
        }
    }

    /// Feeds one RTP packet, in arrival order. Returns zero, one, or two
    /// completed access units (a new timestamp can close the prior unit, and
    /// a marker bit on the same packet can immediately close the new one).
    pub fn process(&mut self, pkt: &RtpPacket<'_>) -> Vec<AccessUnit> {
        let mut emitted = Vec::new();

        if pkt.payload.is_empty() {
            warn!("dropping RTP packet seq={} with empty payload", pkt.sequence_number);
            self.packets_dropped += 1;
            return emitted;
        }

        if let Some(ts) = self.current_timestamp {
            if ts != pkt.timestamp {
                if let Some(au) = self.close_current(ts) {
                    emitted.push(au);
                }
                // A new timestamp while a fragment was in progress means we
                // lost the end of it; drop the partial NAL and resync.
                if self.fragment.take().is_some() {
                    self.fragment_seq_next = None;
                    self.fragments_lost += 1;
                    warn!("fragment lost: timestamp changed mid-reassembly");
                }
            }
        }
        self.current_timestamp = Some(pkt.timestamp);

        let nal_header = pkt.payload[0];
        let nal_type = nal_header & 0x1F;

        match nal_type {
            1..=23 => {
                self.current_units.push(pkt.payload.to_vec());
            }
            nal::TYPE_STAP_A => {
                if let Err(msg) = self.handle_stap_a(pkt.payload) {
                    warn!("malformed STAP-A at seq={}: {msg}", pkt.sequence_number);
                    self.packets_dropped += 1;
                }
            }
            nal::TYPE_FU_A => {
                self.handle_fu_a(pkt);
            }
            other => {
                warn!(
                    "dropping RTP packet seq={} with unrecognized NAL type {other} ({})",
                    pkt.sequence_number,
                    nal::type_name(other)
                );
                self.packets_dropped += 1;
            }
        }

        if pkt.marker {
            if let Some(au) = self.close_current(pkt.timestamp) {
                emitted.push(au);
            }
            self.current_timestamp = None;
        }

        emitted
    }

    fn handle_stap_a(&mut self, payload: &[u8]) -> Result<(), String> {
        let mut offset = 1; // skip the STAP-A indicator byte itself
        let mut units = Vec::new();
        while offset < payload.len() {
            if offset + 2 > payload.len() {
                return Err("truncated NAL unit length".to_string());
            }
            let len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if offset + len > payload.len() {
                return Err("declared NAL unit length exceeds payload".to_string());
            }
            units.push(payload[offset..offset + len].to_vec());
            offset += len;
        }
        self.current_units.extend(units);
        Ok(())
    }

    fn handle_fu_a(&mut self, pkt: &RtpPacket<'_>) {
        let payload = pkt.payload;
        if payload.len() < 2 {
            warn!("dropping truncated FU-A at seq={}", pkt.sequence_number);
            self.packets_dropped += 1;
            return;
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;

        if start {
            let header = (indicator & 0xE0) | (fu_header & 0x1F);
            let mut body = Vec::with_capacity(payload.len().saturating_sub(2));
            body.extend_from_slice(&payload[2..]);
            self.fragment = Some(FragmentAccumulator { header, body });
            self.fragment_seq_next = Some(pkt.sequence_number.wrapping_add(1));
            if end {
                // Single-packet "fragment" (S=1,E=1); finish immediately.
                self.finish_fragment();
            }
            return;
        }

        let Some(frag) = self.fragment.as_mut() else {
            warn!(
                "dropping FU-A continuation at seq={} with no fragment in progress",
                pkt.sequence_number
            );
            self.packets_dropped += 1;
            return;
        };

        if self.fragment_seq_next != Some(pkt.sequence_number) {
            warn!(
                "fragment lost: expected seq={:?}, got {} — discarding partial NAL",
                self.fragment_seq_next, pkt.sequence_number
            );
            self.fragment = None;
            self.fragment_seq_next = None;
            self.fragments_lost += 1;
            return;
        }

        frag.body.extend_from_slice(&payload[2..]);
        self.fragment_seq_next = Some(pkt.sequence_number.wrapping_add(1));

        if end {
            self.finish_fragment();
        }
    }

    fn finish_fragment(&mut self) {
        if let Some(frag) = self.fragment.take() {
            let mut nal = Vec::with_capacity(1 + frag.body.len());
            nal.push(frag.header);
            nal.extend_from_slice(&frag.body);
            self.current_units.push(nal);
        }
        self.fragment_seq_next = None;
    }

    fn close_current(&mut self, timestamp: u32) -> Option<AccessUnit> {
        if self.current_units.is_empty() {
            return None;
        }
        let mut units = Vec::new();
        if let Some(prefix) = self.pending_prefix.take() {
            units.extend(prefix);
        }
        units.append(&mut self.current_units);

        let is_keyframe = units.iter().any(|nal| {
            let nal_type = nal.first().copied().unwrap_or(0) & 0x1F;
            nal::marks_keyframe(nal_type)
        });

        let mut data = Vec::new();
        for unit in &units {
            data.extend_from_slice(&nal::START_CODE);
            data.extend_from_slice(unit);
        }

        Some(AccessUnit {
            timestamp,
            data,
            is_keyframe,
        })
    }
}

impl Default for Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}
