//! RTSP 1.0 request/response types and wire (de)serialization (RFC 2326 §4, §6).

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub const USER_AGENT: &str = concat!("rtsp-capture-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
    GetParameter,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
        }
    }
}

/// One outgoing RTSP request. Headers are stored in insertion-independent
/// sorted order (`BTreeMap`) purely for deterministic serialization in tests.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub cseq: u32,
    pub session: Option<String>,
    pub authorization: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>, cseq: u32) -> Self {
        Request {
            method,
            uri: uri.into(),
            cseq,
            session: None,
            authorization: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_authorization(mut self, auth: impl Into<String>) -> Self {
        self.authorization = Some(auth.into());
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("{} {} RTSP/1.0\r\n", self.method.as_str(), self.uri);
        out.push_str(&format!("CSeq: {}\r\n", self.cseq));
        if let Some(session) = &self.session {
            out.push_str(&format!("Session: {session}\r\n"));
        }
        if let Some(auth) = &self.authorization {
            out.push_str(&format!("Authorization: {auth}\r\n"));
        }
        for (k, v) in &self.headers {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        out.push_str(&format!("User-Agent: {USER_AGENT}\r\n"));
        out.push_str("\r\n");
        out
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Response {
    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
        let mut lines = head.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| Error::ProtocolError("empty response".to_string()))?;
        let mut parts = status_line.splitn(3, ' ');
        let _version = parts
            .next()
            .ok_or_else(|| Error::ProtocolError("missing RTSP version in status line".to_string()))?;
        let status: u16 = parts
            .next()
            .ok_or_else(|| Error::ProtocolError("missing status code".to_string()))?
            .parse()
            .map_err(|_| Error::ProtocolError(format!("malformed status code in {status_line:?}")))?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = BTreeMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| Error::ProtocolError(format!("malformed header line {line:?}")))?;
            headers.insert(k.trim().to_string(), v.trim().to_string());
        }

        Ok(Response {
            status,
            reason,
            headers,
            body: body.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_options_request() {
        let req = Request::new(Method::Options, "rtsp://host/stream", 1);
        let wire = req.serialize();
        assert!(wire.starts_with("OPTIONS rtsp://host/stream RTSP/1.0\r\n"));
        assert!(wire.contains("CSeq: 1\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parses_response_with_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n";
        let resp = Response::parse(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.cseq(), Some(2));
        assert!(resp.is_success());
        assert_eq!(resp.body, "v=0\r\n");
    }

    #[test]
    fn parses_401_with_www_authenticate() {
        let raw = "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"RTSP\", nonce=\"abc\"\r\n\r\n";
        let resp = Response::parse(raw).unwrap();
        assert!(resp.is_unauthorized());
        assert!(resp.header("WWW-Authenticate").unwrap().contains("nonce=\"abc\""));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let raw = "RTSP/1.0 200 OK\r\ncseq: 9\r\n\r\n";
        let resp = Response::parse(raw).unwrap();
        assert_eq!(resp.cseq(), Some(9));
    }
}
