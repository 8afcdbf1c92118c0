//! Minimal SDP parsing (RFC 8866), limited to what the depacketizer needs:
//! the first `m=video ... RTP/AVP <pt>` line and its `a=rtpmap`/`a=fmtp`.

use base64::Engine;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMedia {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub sprop_parameter_sets: Vec<Vec<u8>>,
    pub control: Option<String>,
}

/// Parses the DESCRIBE response body and returns the first H.264 video
/// media description found.
pub fn parse_first_h264_video(sdp: &str) -> Result<VideoMedia> {
    let lines: Vec<&str> = sdp.lines().collect();

    let media_start = lines
        .iter()
        .position(|l| l.starts_with("m=video") && l.contains("RTP/AVP"))
        .ok_or_else(|| Error::ProtocolError("SDP has no m=video RTP/AVP line".to_string()))?;

    let payload_type = lines[media_start]
        .split_whitespace()
        .last()
        .and_then(|pt| pt.parse::<u8>().ok())
        .ok_or_else(|| Error::ProtocolError("m=video line missing payload type".to_string()))?;

    let media_end = lines[media_start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|i| media_start + 1 + i)
        .unwrap_or(lines.len());

    let rtpmap_prefix = format!("a=rtpmap:{payload_type} ");
    let fmtp_prefix = format!("a=fmtp:{payload_type} ");
    let control_prefix = "a=control:";

    let mut clock_rate = None;
    let mut sprop_parameter_sets = Vec::new();
    let mut control = None;

    for line in &lines[media_start..media_end] {
        if let Some(rest) = line.strip_prefix(&rtpmap_prefix) {
            // "<encoding>/<clock-rate>" e.g. "H264/90000"
            let mut parts = rest.splitn(2, '/');
            let encoding = parts.next().unwrap_or("");
            if !encoding.eq_ignore_ascii_case("H264") {
                return Err(Error::ProtocolError(format!("unsupported encoding {encoding:?}, only H264 is supported")));
            }
            if let Some(rate_str) = parts.next() {
                let rate_str = rate_str.split('/').next().unwrap_or(rate_str);
                clock_rate = rate_str.parse::<u32>().ok();
            }
        } else if let Some(rest) = line.strip_prefix(&fmtp_prefix) {
            for param in rest.split(';') {
                let param = param.trim();
                if let Some(value) = param.strip_prefix("sprop-parameter-sets=") {
                    for part in value.split(',') {
                        let decoded = base64::engine::general_purpose::STANDARD
                            .decode(part.trim())
                            .map_err(|e| Error::ProtocolError(format!("invalid sprop-parameter-sets base64: {e}")))?;
                        sprop_parameter_sets.push(decoded);
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix(control_prefix) {
            control = Some(rest.trim().to_string());
        }
    }

    let clock_rate = clock_rate.ok_or_else(|| Error::ProtocolError("missing a=rtpmap for H264 payload type".to_string()))?;

    Ok(VideoMedia {
        payload_type,
        clock_rate,
        sprop_parameter_sets,
        control,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
v=0\r
o=- 0 0 IN IP4 127.0.0.1\r
s=stream\r
t=0 0\r
m=audio 0 RTP/AVP 0\r
a=rtpmap:0 PCMU/8000\r
m=video 0 RTP/AVP 96\r
a=rtpmap:96 H264/90000\r
a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z0IAH5ZUBf/ABCD,aM48gA==\r
a=control:trackID=1\r
";

    #[test]
    fn finds_first_h264_video_media() {
        let media = parse_first_h264_video(SAMPLE).unwrap();
        assert_eq!(media.payload_type, 96);
        assert_eq!(media.clock_rate, 90000);
        assert_eq!(media.sprop_parameter_sets.len(), 2);
        assert_eq!(media.control.as_deref(), Some("trackID=1"));
    }

    #[test]
    fn rejects_missing_video_media() {
        let sdp = "v=0\r\nm=audio 0 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert!(parse_first_h264_video(sdp).is_err());
    }

    #[test]
    fn rejects_non_h264_video() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 98\r\na=rtpmap:98 VP8/90000\r\n";
        assert!(parse_first_h264_video(sdp).is_err());
    }
}
