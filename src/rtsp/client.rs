//! RTSP control-channel state machine (SPEC_FULL.md §4.5):
//! `OPTIONS -> DESCRIBE -> SETUP -> PLAY -> TEARDOWN`, with digest
//! authentication and connect retry.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::RetryPolicy;
use crate::digest::{self, DigestChallenge};
use crate::error::{Error, Result};
use crate::rtsp::framer::{Frame, Framer};
use crate::rtsp::message::{Method, Request, Response};
use crate::rtsp_url::RtspUrl;
use crate::transport::NegotiatedTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connected,
    Described,
    Ready,
    Playing,
}

const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

pub struct RtspClient {
    url: RtspUrl,
    stream: Option<TcpStream>,
    state: State,
    cseq: u32,
    session_id: Option<String>,
    session_timeout: Duration,
    digest_challenge: Option<DigestChallenge>,
    socket_timeout: Duration,
    supports_get_parameter: bool,
}

impl RtspClient {
    /// Opens the TCP control connection, retrying only the connect itself
    /// per `retry` (SPEC_FULL.md §4.5 "Retry on connect").
    pub async fn connect(url: RtspUrl, retry: &RetryPolicy, socket_timeout: Duration) -> Result<Self> {
        let authority = url.authority();
        let mut last_err = None;

        for attempt in 0..=retry.max {
            if attempt > 0 {
                let delay = retry.delay_for_attempt(attempt - 1);
                debug!("connect attempt {attempt} to {authority} failed, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            match timeout(socket_timeout, TcpStream::connect(&authority)).await {
                Ok(Ok(stream)) => {
                    info!("connected to {authority}");
                    return Ok(RtspClient {
                        url,
                        stream: Some(stream),
                        state: State::Connected,
                        cseq: 0,
                        session_id: None,
                        session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
                        digest_challenge: None,
                        socket_timeout,
                        supports_get_parameter: true,
                    });
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some("connect timed out".to_string()),
            }
        }

        Err(Error::ConnectFailed(format!(
            "giving up on {authority} after {} attempts: {}",
            retry.max + 1,
            last_err.unwrap_or_default()
        )))
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn request_uri(&self) -> String {
        self.url.request_uri()
    }

    pub fn supports_get_parameter(&self) -> bool {
        self.supports_get_parameter
    }

    pub fn mark_get_parameter_unsupported(&mut self) {
        self.supports_get_parameter = false;
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    /// Builds (and accounts for, via CSeq) a request for `method` against the
    /// aggregate control URI, attaching `Session`/cached digest `Authorization`
    /// as appropriate. Exposed so callers that no longer hold the socket
    /// (TCP-interleaved keepalive/teardown after the receive task takes over)
    /// can still produce well-formed, correctly-sequenced requests.
    pub fn build_request(&mut self, method: Method) -> Request {
        let uri = self.request_uri();
        let cseq = self.next_cseq();
        self.build(method, uri, cseq)
    }

    fn build(&self, method: Method, uri: String, cseq: u32) -> Request {
        let mut req = Request::new(method, uri.clone(), cseq);
        if let Some(session) = &self.session_id {
            req = req.with_session(session.clone());
        }
        if let Some(auth) = self.cached_authorization(method, &uri) {
            req = req.with_authorization(auth);
        }
        req
    }

    fn cached_authorization(&self, method: Method, uri: &str) -> Option<String> {
        let challenge = self.digest_challenge.as_ref()?;
        let username = self.url.username.as_deref()?;
        let password = self.url.password.as_deref().unwrap_or("");
        let resp = digest::respond(challenge, username, password, method.as_str(), uri);
        Some(resp.to_header_value())
    }

    async fn roundtrip(&mut self, req: &Request) -> Result<Response> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::ProtocolError("control socket no longer owned by client".to_string()))?;

        let wire = req.serialize();
        timeout(self.socket_timeout, stream.write_all(wire.as_bytes()))
            .await
            .map_err(|_| Error::TransportError("write timed out".to_string()))?
            .map_err(|e| Error::TransportError(format!("write: {e}")))?;

        let mut framer = Framer::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = framer.next_frame()? {
                match frame {
                    Frame::RtspMessage(text) => {
                        let resp = Response::parse(&text)?;
                        if resp.cseq() != Some(req.cseq) {
                            return Err(Error::ProtocolError(format!(
                                "CSeq mismatch: sent {}, got {:?}",
                                req.cseq,
                                resp.cseq()
                            )));
                        }
                        return Ok(resp);
                    }
                    Frame::BinaryFrame { channel, .. } => {
                        warn!("unexpected interleaved binary frame on channel {channel} before PLAY handoff");
                        continue;
                    }
                }
            }

            let n = timeout(self.socket_timeout, stream.read(&mut buf))
                .await
                .map_err(|_| Error::TransportError("read timed out".to_string()))?
                .map_err(|e| Error::TransportError(format!("read: {e}")))?;
            if n == 0 {
                return Err(Error::TransportError("connection closed while awaiting response".to_string()));
            }
            framer.push(&buf[..n]);
        }
    }

    /// Sends `method`, retrying exactly once with a computed digest
    /// `Authorization` header if the server answers 401.
    async fn request_with_auth_retry(&mut self, method: Method, extra: Vec<(&str, String)>) -> Result<Response> {
        let uri = self.request_uri();
        let cseq = self.next_cseq();
        let mut req = self.build(method, uri.clone(), cseq);
        for (k, v) in &extra {
            req = req.with_header(*k, v.clone());
        }

        let resp = self.roundtrip(&req).await?;
        if !resp.is_unauthorized() {
            return Ok(resp);
        }

        let challenge_header = resp
            .header("WWW-Authenticate")
            .ok_or_else(|| Error::AuthFailed("401 response missing WWW-Authenticate".to_string()))?;
        self.digest_challenge = Some(DigestChallenge::parse(challenge_header)?);

        let cseq2 = self.next_cseq();
        let mut req2 = self.build(method, uri, cseq2);
        for (k, v) in &extra {
            req2 = req2.with_header(*k, v.clone());
        }
        let resp2 = self.roundtrip(&req2).await?;
        if resp2.is_unauthorized() {
            return Err(Error::AuthFailed(format!("401 persists for {method:?} after digest retry")));
        }
        Ok(resp2)
    }

    pub async fn options(&mut self) -> Result<Response> {
        self.ensure_state(&[State::Connected])?;
        let resp = self.request_with_auth_retry(Method::Options, vec![]).await?;
        if !resp.is_success() {
            return Err(Error::ProtocolError(format!("OPTIONS failed with status {}", resp.status)));
        }
        Ok(resp)
    }

    pub async fn describe(&mut self) -> Result<String> {
        self.ensure_state(&[State::Connected])?;
        let resp = self
            .request_with_auth_retry(Method::Describe, vec![("Accept", "application/sdp".to_string())])
            .await?;
        if !resp.is_success() {
            return Err(Error::ProtocolError(format!("DESCRIBE failed with status {}", resp.status)));
        }
        self.state = State::Described;
        Ok(resp.body)
    }

    /// Proposes a UDP transport; `client_port` is the RTP port (RTCP is
    /// `client_port + 1` by convention). Returns the server-confirmed ports.
    pub async fn setup_udp(&mut self, track_uri: &str, client_rtp_port: u16) -> Result<NegotiatedTransport> {
        self.ensure_state(&[State::Described])?;
        let transport_header = format!(
            "RTP/AVP;unicast;client_port={client_rtp_port}-{}",
            client_rtp_port + 1
        );
        self.setup_with_transport(track_uri, &transport_header, true).await
    }

    /// Proposes TCP-interleaved transport on the given channel pair
    /// (default 0/1).
    pub async fn setup_tcp(&mut self, track_uri: &str, rtp_channel: u8, rtcp_channel: u8) -> Result<NegotiatedTransport> {
        self.ensure_state(&[State::Described])?;
        let transport_header = format!(
            "RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}"
        );
        self.setup_with_transport(track_uri, &transport_header, false).await
    }

    async fn setup_with_transport(
        &mut self,
        track_uri: &str,
        transport_header: &str,
        udp: bool,
    ) -> Result<NegotiatedTransport> {
        let cseq = self.next_cseq();
        let mut req = self.build(Method::Setup, track_uri.to_string(), cseq);
        req = req.with_header("Transport", transport_header.to_string());

        let resp = self.roundtrip(&req).await?;
        let resp = if resp.is_unauthorized() {
            let challenge_header = resp
                .header("WWW-Authenticate")
                .ok_or_else(|| Error::AuthFailed("401 response missing WWW-Authenticate".to_string()))?;
            self.digest_challenge = Some(DigestChallenge::parse(challenge_header)?);
            let cseq2 = self.next_cseq();
            let mut req2 = self.build(Method::Setup, track_uri.to_string(), cseq2);
            req2 = req2.with_header("Transport", transport_header.to_string());
            self.roundtrip(&req2).await?
        } else {
            resp
        };

        if !resp.is_success() {
            return Err(Error::ProtocolError(format!("SETUP failed with status {}", resp.status)));
        }

        let session_header = resp
            .header("Session")
            .ok_or_else(|| Error::ProtocolError("SETUP response missing Session header".to_string()))?;
        let (session_id, timeout_secs) = parse_session_header(session_header);
        self.session_id = Some(session_id);
        if let Some(secs) = timeout_secs {
            self.session_timeout = Duration::from_secs(secs);
        }

        let transport_resp = resp
            .header("Transport")
            .ok_or_else(|| Error::ProtocolError("SETUP response missing Transport header".to_string()))?;

        self.state = State::Ready;

        if udp {
            parse_udp_server_transport(transport_resp, &self.url.host)
        } else {
            parse_tcp_server_transport(transport_resp)
        }
    }

    pub async fn play(&mut self) -> Result<Response> {
        self.ensure_state(&[State::Ready])?;
        let resp = self.request_with_auth_retry(Method::Play, vec![]).await?;
        if !resp.is_success() {
            return Err(Error::ProtocolError(format!("PLAY failed with status {}", resp.status)));
        }
        self.state = State::Playing;
        Ok(resp)
    }

    /// Sends `GET_PARAMETER` (falling back permanently to `OPTIONS` the first
    /// time `GET_PARAMETER` draws a non-2xx response) to keep the session
    /// alive. Only valid while the client itself still owns the socket
    /// (UDP transport); TCP-interleaved keepalives go through
    /// [`RtspClient::build_request`] instead.
    pub async fn keepalive(&mut self) -> Result<Response> {
        self.ensure_state(&[State::Playing])?;
        let method = if self.supports_get_parameter {
            Method::GetParameter
        } else {
            Method::Options
        };
        let resp = self.request_with_auth_retry(method, vec![]).await?;
        if !resp.is_success() && method == Method::GetParameter {
            warn!("GET_PARAMETER not supported (status {}), falling back to OPTIONS", resp.status);
            self.supports_get_parameter = false;
        }
        Ok(resp)
    }

    pub async fn teardown(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::ProtocolError("control socket no longer owned by client".to_string()));
        }
        let resp = self.request_with_auth_retry(Method::Teardown, vec![]).await?;
        if !resp.is_success() {
            warn!("TEARDOWN returned status {}", resp.status);
        }
        self.state = State::Disconnected;
        self.stream = None;
        Ok(())
    }

    /// Hands the control socket to the TCP-interleaved receive task after
    /// `PLAY`. The client keeps tracking CSeq/session/digest state so it can
    /// still build well-formed keepalive/teardown requests via
    /// [`RtspClient::build_request`].
    pub fn take_tcp_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }

    fn ensure_state(&self, allowed: &[State]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::ProtocolError(format!(
                "invalid state transition: in {:?}, expected one of {:?}",
                self.state, allowed
            )))
        }
    }
}

/// Parses `Session: <id>;timeout=<secs>`.
fn parse_session_header(header: &str) -> (String, Option<u64>) {
    match header.split_once(';') {
        Some((id, params)) => {
            let timeout = params
                .split(';')
                .find_map(|p| p.trim().strip_prefix("timeout="))
                .and_then(|t| t.parse().ok());
            (id.trim().to_string(), timeout)
        }
        None => (header.trim().to_string(), None),
    }
}

fn parse_udp_server_transport(header: &str, server_host: &str) -> Result<NegotiatedTransport> {
    let mut client_rtp_port = None;
    let mut server_rtp_port = None;
    let mut server_rtcp_port = None;

    for part in header.split(';') {
        if let Some(v) = part.trim().strip_prefix("client_port=") {
            client_rtp_port = v.split('-').next().and_then(|p| p.parse::<u16>().ok());
        } else if let Some(v) = part.trim().strip_prefix("server_port=") {
            let mut ports = v.split('-');
            server_rtp_port = ports.next().and_then(|p| p.parse::<u16>().ok());
            server_rtcp_port = ports.next().and_then(|p| p.parse::<u16>().ok());
        }
    }

    let server_rtp_port = server_rtp_port
        .ok_or_else(|| Error::ProtocolError("Transport response missing server_port".to_string()))?;

    let server_rtp_addr = format!("{server_host}:{server_rtp_port}")
        .parse()
        .map_err(|e| Error::ProtocolError(format!("bad server RTP address: {e}")))?;
    let server_rtcp_addr = server_rtcp_port
        .map(|p| format!("{server_host}:{p}").parse())
        .transpose()
        .map_err(|e: std::net::AddrParseError| Error::ProtocolError(format!("bad server RTCP address: {e}")))?;

    Ok(NegotiatedTransport::Udp {
        client_rtp_port: client_rtp_port.unwrap_or_default(),
        server_rtp_addr,
        server_rtcp_addr,
    })
}

fn parse_tcp_server_transport(header: &str) -> Result<NegotiatedTransport> {
    for part in header.split(';') {
        if let Some(v) = part.trim().strip_prefix("interleaved=") {
            let mut channels = v.splitn(2, '-');
            let rtp_channel: u8 = channels
                .next()
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| Error::ProtocolError(format!("bad interleaved channel in {v:?}")))?;
            let rtcp_channel = channels.next().and_then(|c| c.parse().ok()).unwrap_or(rtp_channel + 1);
            return Ok(NegotiatedTransport::TcpInterleaved {
                rtp_channel,
                rtcp_channel,
            });
        }
    }
    Err(Error::ProtocolError("Transport response missing interleaved= parameter".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_header_with_timeout() {
        let (id, timeout) = parse_session_header("12345678;timeout=60");
        assert_eq!(id, "12345678");
        assert_eq!(timeout, Some(60));
    }

    #[test]
    fn parses_session_header_without_timeout() {
        let (id, timeout) = parse_session_header("12345678");
        assert_eq!(id, "12345678");
        assert_eq!(timeout, None);
    }

    #[test]
    fn parses_udp_server_transport() {
        let t = parse_udp_server_transport(
            "RTP/AVP;unicast;client_port=4588-4589;server_port=6600-6601",
            "192.168.1.10",
        )
        .unwrap();
        match t {
            NegotiatedTransport::Udp {
                client_rtp_port,
                server_rtp_addr,
                server_rtcp_addr,
            } => {
                assert_eq!(client_rtp_port, 4588);
                assert_eq!(server_rtp_addr.port(), 6600);
                assert_eq!(server_rtcp_addr.unwrap().port(), 6601);
            }
            _ => panic!("expected udp"),
        }
    }

    #[test]
    fn parses_tcp_server_transport() {
        let t = parse_tcp_server_transport("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        match t {
            NegotiatedTransport::TcpInterleaved { rtp_channel, rtcp_channel } => {
                assert_eq!(rtp_channel, 0);
                assert_eq!(rtcp_channel, 1);
            }
            _ => panic!("expected tcp"),
        }
    }

    // End-to-end scenarios against a loopback mock server (SPEC_FULL.md §8).

    use std::sync::{Arc, Mutex as StdMutex};

    use tokio::net::TcpListener;

    async fn read_one_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-request");
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                return String::from_utf8_lossy(&buf).into_owned();
            }
        }
    }

    /// Accepts one connection and answers each request in turn with the next
    /// scripted response, recording the raw requests it observed.
    async fn serve_scripted_responses(
        listener: TcpListener,
        responses: Vec<&'static str>,
        observed: Arc<StdMutex<Vec<String>>>,
    ) {
        let (mut stream, _) = listener.accept().await.unwrap();
        for resp in responses {
            let req = read_one_request(&mut stream).await;
            observed.lock().unwrap().push(req);
            stream.write_all(resp.as_bytes()).await.unwrap();
        }
    }

    fn loopback_url(port: u16, username: Option<&str>, password: Option<&str>) -> RtspUrl {
        RtspUrl {
            host: "127.0.0.1".to_string(),
            port,
            path: "/stream".to_string(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        }
    }

    /// Scenario 1: clean play/teardown issues CSeq 1..5 in order, request
    /// count 5, final state Disconnected.
    #[tokio::test]
    async fn clean_play_teardown_issues_five_sequential_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let observed = Arc::new(StdMutex::new(Vec::new()));

        let responses = vec![
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n",
            "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: 5\r\n\r\nv=0\r\n",
            "RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: ABCDEF;timeout=60\r\nTransport: RTP/AVP;unicast;client_port=6970-6971;server_port=6600-6601\r\n\r\n",
            "RTSP/1.0 200 OK\r\nCSeq: 4\r\nSession: ABCDEF\r\n\r\n",
            "RTSP/1.0 200 OK\r\nCSeq: 5\r\nSession: ABCDEF\r\n\r\n",
        ];
        let server = tokio::spawn(serve_scripted_responses(listener, responses, Arc::clone(&observed)));

        let mut client = RtspClient::connect(loopback_url(addr.port(), None, None), &RetryPolicy::default(), Duration::from_secs(2))
            .await
            .unwrap();

        client.options().await.unwrap();
        client.describe().await.unwrap();
        client.setup_udp("rtsp://127.0.0.1/stream/trackID=1", 6970).await.unwrap();
        client.play().await.unwrap();
        client.teardown().await.unwrap();

        server.await.unwrap();
        assert_eq!(client.state(), State::Disconnected);

        let reqs = observed.lock().unwrap();
        assert_eq!(reqs.len(), 5, "expected exactly 5 requests, got {reqs:?}");
        let expected_methods = ["OPTIONS", "DESCRIBE", "SETUP", "PLAY", "TEARDOWN"];
        for (i, req) in reqs.iter().enumerate() {
            assert!(req.starts_with(expected_methods[i]), "request {i} was {req:?}");
            assert!(
                req.contains(&format!("CSeq: {}\r\n", i + 1)),
                "request {i} missing CSeq {}: {req:?}",
                i + 1
            );
        }
    }

    /// Scenario 2: a 401 on the first DESCRIBE triggers exactly one digest
    /// retry; the retry carries the computed Authorization header.
    #[tokio::test]
    async fn digest_challenge_triggers_exactly_one_describe_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let observed = Arc::new(StdMutex::new(Vec::new()));

        let responses = vec![
            "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"RTSP\", nonce=\"abc\"\r\n\r\n",
            "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: 5\r\n\r\nv=0\r\n",
        ];
        let server = tokio::spawn(serve_scripted_responses(listener, responses, Arc::clone(&observed)));

        let mut client = RtspClient::connect(
            loopback_url(addr.port(), Some("admin"), Some("secret")),
            &RetryPolicy::default(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let sdp = client.describe().await.unwrap();
        assert_eq!(sdp, "v=0\r\n");

        server.await.unwrap();

        let reqs = observed.lock().unwrap();
        assert_eq!(reqs.len(), 2, "expected exactly two DESCRIBE requests, got {reqs:?}");
        assert!(reqs[0].starts_with("DESCRIBE"));
        assert!(reqs[1].starts_with("DESCRIBE"));
        assert!(!reqs[0].contains("Authorization:"));
        assert!(reqs[1].contains("Authorization: Digest username=\"admin\""));
    }

    /// Scenario 6: the server refuses the first two connection attempts and
    /// accepts the third; cumulative pre-connect delay is at least the sum of
    /// the two backoff waits (100 ms + 200 ms).
    #[tokio::test]
    async fn connect_retries_and_succeeds_on_third_attempt() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let retry = RetryPolicy {
            max: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            factor: 2.0,
        };

        let relisten = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            TcpListener::bind(("127.0.0.1", port)).await.unwrap()
        });

        let start = std::time::Instant::now();
        let client = RtspClient::connect(loopback_url(port, None, None), &retry, Duration::from_secs(2))
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(client.state(), State::Connected);
        assert!(
            elapsed >= Duration::from_millis(300),
            "elapsed {elapsed:?} should cover both backoff delays (100ms + 200ms)"
        );

        let _listener = relisten.await.unwrap();
    }
}
