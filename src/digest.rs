//! RFC 2617 HTTP Digest access authentication, as used by `WWW-Authenticate`
//! on RTSP 401 responses (RFC 2326 borrows the HTTP digest scheme verbatim).
//!
//! `qop=auth-int` is unsupported by design (see DESIGN.md); only the
//! no-`qop` legacy form and `qop=auth` are implemented.

use std::collections::HashMap;
use std::fmt::Write as _;

use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: String,
}

impl DigestChallenge {
    /// Parses the parameter list of a `WWW-Authenticate: Digest ...` header value.
    /// `header` is the value with the leading `Digest` scheme token already stripped,
    /// or still present (both are accepted).
    pub fn parse(header: &str) -> Result<Self> {
        let rest = header.trim();
        let rest = rest.strip_prefix("Digest").unwrap_or(rest).trim();

        let params = parse_params(rest);

        let realm = params
            .get("realm")
            .ok_or_else(|| Error::ProtocolError("WWW-Authenticate missing realm".into()))?
            .clone();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| Error::ProtocolError("WWW-Authenticate missing nonce".into()))?
            .clone();
        let qop = params.get("qop").cloned();
        let opaque = params.get("opaque").cloned();
        let algorithm = params.get("algorithm").cloned().unwrap_or_else(|| "MD5".to_string());

        Ok(DigestChallenge {
            realm,
            nonce,
            qop,
            opaque,
            algorithm,
        })
    }
}

/// Splits `key="value", key2=value2` parameter lists, tolerating quoted and
/// bare tokens alike.
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in split_params(s) {
        if let Some((k, v)) = part.split_once('=') {
            let k = k.trim();
            let v = v.trim().trim_matches('"');
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

/// Splits on top-level commas only, i.e. commas inside a quoted value don't split.
fn split_params(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = s[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// A computed digest response, ready to be serialized into an `Authorization` header.
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl DigestResponse {
    pub fn to_header_value(&self) -> String {
        let mut out = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, self.realm, self.nonce, self.uri, self.response
        );
        if let Some(qop) = &self.qop {
            let _ = write!(out, ", qop={qop}");
        }
        if let Some(nc) = &self.nc {
            let _ = write!(out, ", nc={nc}");
        }
        if let Some(cnonce) = &self.cnonce {
            let _ = write!(out, ", cnonce=\"{cnonce}\"");
        }
        if let Some(opaque) = &self.opaque {
            let _ = write!(out, ", opaque=\"{opaque}\"");
        }
        out
    }
}

/// Computes `response = MD5(HA1:nonce:HA2)` (no qop) or
/// `MD5(HA1:nonce:nc:cnonce:qop:HA2)` (`qop=auth`), per RFC 2617 §3.2.2.1.
pub fn respond(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
) -> DigestResponse {
    let ha1 = md5_hex(&format!("{username}:{}:{password}", challenge.realm));
    let ha2 = md5_hex(&format!("{method}:{uri}"));

    let auth_qop = challenge
        .qop
        .as_deref()
        .and_then(|q| q.split(',').map(str::trim).find(|q| *q == "auth"));

    let (response, nc, cnonce) = match auth_qop {
        Some(qop) => {
            let nc = "00000001".to_string();
            let cnonce = random_cnonce();
            let response = md5_hex(&format!(
                "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
                challenge.nonce
            ));
            (response, Some(nc), Some(cnonce))
        }
        None => (md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce)), None, None),
    };

    DigestResponse {
        username: username.to_string(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: uri.to_string(),
        response,
        qop: auth_qop.map(str::to_string),
        nc,
        cnonce,
        opaque: challenge.opaque.clone(),
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn random_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    bytes.iter().fold(String::with_capacity(16), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_challenge_with_qop() {
        let c = DigestChallenge::parse(
            r#"Digest realm="RTSP", nonce="abc", qop="auth", algorithm=MD5"#,
        )
        .unwrap();
        assert_eq!(c.realm, "RTSP");
        assert_eq!(c.nonce, "abc");
        assert_eq!(c.qop.as_deref(), Some("auth"));
        assert_eq!(c.algorithm, "MD5");
    }

    #[test]
    fn parses_challenge_without_qop() {
        let c = DigestChallenge::parse(r#"Digest realm="RTSP", nonce="abc""#).unwrap();
        assert_eq!(c.qop, None);
        assert_eq!(c.opaque, None);
    }

    #[test]
    fn rejects_missing_realm() {
        assert!(DigestChallenge::parse(r#"Digest nonce="abc""#).is_err());
    }

    /// From SPEC_FULL.md §8: response = MD5(MD5(u:r:p):n:MD5(m:U)) when qop absent.
    #[test]
    fn matches_the_no_qop_formula() {
        let challenge = DigestChallenge {
            realm: "RTSP".to_string(),
            nonce: "abc".to_string(),
            qop: None,
            opaque: None,
            algorithm: "MD5".to_string(),
        };
        let resp = respond(&challenge, "admin", "secret", "DESCRIBE", "rtsp://host/stream");

        let ha1 = md5_hex("admin:RTSP:secret");
        let ha2 = md5_hex("DESCRIBE:rtsp://host/stream");
        let expected = md5_hex(&format!("{ha1}:abc:{ha2}"));

        assert_eq!(resp.response, expected);
        assert_eq!(resp.qop, None);
        assert_eq!(resp.nc, None);
        assert_eq!(resp.cnonce, None);
    }

    #[test]
    fn qop_auth_includes_nc_and_cnonce() {
        let challenge = DigestChallenge {
            realm: "RTSP".to_string(),
            nonce: "abc".to_string(),
            qop: Some("auth".to_string()),
            opaque: None,
            algorithm: "MD5".to_string(),
        };
        let resp = respond(&challenge, "admin", "secret", "DESCRIBE", "rtsp://host/stream");
        assert_eq!(resp.qop.as_deref(), Some("auth"));
        assert_eq!(resp.nc.as_deref(), Some("00000001"));
        assert!(resp.cnonce.is_some());
    }
}
