//! Dual-transport RTP receiver: a UDP socket pair, or the TCP control
//! connection demultiplexed by the interleaved framer. Both variants expose
//! the same downstream capability so the depacketizer never sees which one
//! is in use (SPEC_FULL.md §4.4, §9).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::rtsp::framer::{Frame, Framer};

/// What the client proposed in `SETUP` and what the server confirmed.
#[derive(Debug, Clone)]
pub enum NegotiatedTransport {
    Udp {
        client_rtp_port: u16,
        server_rtp_addr: std::net::SocketAddr,
        server_rtcp_addr: Option<std::net::SocketAddr>,
    },
    TcpInterleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

/// A socket bound for every byte that might come in: one buffer reused across
/// reads, sized comfortably above common camera MTUs.
const RECV_BUF_SIZE: usize = 65536;

pub struct UdpReceiver {
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpReceiver {
    /// Binds the RTP/RTCP port pair. Must happen before `SETUP` is sent so
    /// the client can advertise `client_port=a-b`.
    pub async fn bind(client_ip: &str, rtp_port: u16) -> Result<Self> {
        let rtp_addr = format!("{client_ip}:{rtp_port}");
        let rtcp_addr = format!("{client_ip}:{}", rtp_port + 1);
        let rtp_socket = UdpSocket::bind(&rtp_addr)
            .await
            .map_err(|e| Error::TransportError(format!("bind RTP socket {rtp_addr}: {e}")))?;
        let rtcp_socket = UdpSocket::bind(&rtcp_addr)
            .await
            .map_err(|e| Error::TransportError(format!("bind RTCP socket {rtcp_addr}: {e}")))?;
        Ok(UdpReceiver {
            rtp_socket,
            rtcp_socket,
            buf: vec![0u8; RECV_BUF_SIZE],
        })
    }

    pub fn local_rtp_port(&self) -> Result<u16> {
        self.rtp_socket
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| Error::TransportError(format!("local RTP addr: {e}")))
    }

    pub async fn connect(&self, server_rtp: std::net::SocketAddr, server_rtcp: Option<std::net::SocketAddr>) -> Result<()> {
        self.rtp_socket
            .connect(server_rtp)
            .await
            .map_err(|e| Error::TransportError(format!("connect RTP socket: {e}")))?;
        if let Some(rtcp) = server_rtcp {
            // Best-effort; RTCP is drained but never interpreted.
            let _ = self.rtcp_socket.connect(rtcp).await;
        }
        Ok(())
    }

    /// Returns the next RTP datagram, or `Ok(None)` once the socket is shut
    /// down cleanly (not expected for UDP — closure is caller-driven).
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            tokio::select! {
                biased;
                result = self.rtp_socket.recv(&mut self.buf) => {
                    let n = result.map_err(|e| Error::TransportError(format!("RTP recv: {e}")))?;
                    return Ok(Some(self.buf[..n].to_vec()));
                }
                result = self.rtcp_socket.recv(&mut self.buf) => {
                    // Drained, not interpreted (SPEC_FULL.md §4.4).
                    let _ = result;
                    continue;
                }
            }
        }
    }
}

type KeepaliveRequest = (String, oneshot::Sender<Result<String>>);

/// TCP-interleaved receiver. Owns the control socket exclusively after
/// `PLAY`; keepalive requests from the orchestrator are muxed through a
/// channel the receive task services between RTP frames.
pub struct TcpInterleavedReceiver {
    rtp_rx: mpsc::Receiver<Vec<u8>>,
    keepalive_tx: mpsc::Sender<KeepaliveRequest>,
    pump: JoinHandle<()>,
}

impl TcpInterleavedReceiver {
    pub fn spawn(stream: TcpStream, rtp_channel: u8, rtcp_channel: u8) -> Self {
        let (rtp_tx, rtp_rx) = mpsc::channel(256);
        let (keepalive_tx, keepalive_rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump_loop(stream, rtp_channel, rtcp_channel, rtp_tx, keepalive_rx));
        TcpInterleavedReceiver {
            rtp_rx,
            keepalive_tx,
            pump,
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rtp_rx.recv().await {
            Some(payload) => Ok(Some(payload)),
            None => Ok(None), // pump task ended: clean close or fatal error already logged
        }
    }

    /// Sends a serialized keepalive request (`GET_PARAMETER`/`OPTIONS`) over
    /// the shared control connection and waits for the matching text reply.
    pub async fn send_keepalive(&self, request: String) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.keepalive_tx
            .send((request, tx))
            .await
            .map_err(|_| Error::TransportError("receive task has exited".to_string()))?;
        rx.await.map_err(|_| Error::TransportError("receive task dropped keepalive reply".to_string()))?
    }

    pub fn stop(self) {
        self.pump.abort();
    }
}

async fn pump_loop(
    mut stream: TcpStream,
    rtp_channel: u8,
    rtcp_channel: u8,
    rtp_tx: mpsc::Sender<Vec<u8>>,
    mut keepalive_rx: mpsc::Receiver<KeepaliveRequest>,
) {
    let mut framer = Framer::new();
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut pending_reply: Option<oneshot::Sender<Result<String>>> = None;

    loop {
        // Drain any already-buffered frames before blocking on more I/O.
        match drain_frames(&mut framer, rtp_channel, rtcp_channel, &rtp_tx, &mut pending_reply).await {
            Ok(true) => return, // clean shutdown observed
            Ok(false) => {}
            Err(_) => return,
        }

        tokio::select! {
            biased;
            maybe_req = keepalive_rx.recv(), if pending_reply.is_none() => {
                match maybe_req {
                    Some((request, reply)) => {
                        if let Err(e) = stream.write_all(request.as_bytes()).await {
                            let _ = reply.send(Err(Error::TransportError(format!("write keepalive: {e}"))));
                        } else {
                            pending_reply = Some(reply);
                        }
                    }
                    None => { /* orchestrator dropped the handle; keep pumping RTP */ }
                }
            }
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        if let Some(reply) = pending_reply.take() {
                            let _ = reply.send(Err(Error::TransportError("connection closed awaiting keepalive reply".to_string())));
                        }
                        return;
                    }
                    Ok(n) => framer.push(&buf[..n]),
                    Err(e) => {
                        if let Some(reply) = pending_reply.take() {
                            let _ = reply.send(Err(Error::TransportError(format!("read: {e}"))));
                        }
                        return;
                    }
                }
            }
        }
    }
}

/// Drains every frame currently buffered. Returns `Ok(true)` if a clean
/// shutdown was observed (server-initiated TEARDOWN announcement).
async fn drain_frames(
    framer: &mut Framer,
    rtp_channel: u8,
    rtcp_channel: u8,
    rtp_tx: &mpsc::Sender<Vec<u8>>,
    pending_reply: &mut Option<oneshot::Sender<Result<String>>>,
) -> Result<bool> {
    loop {
        match framer.next_frame()? {
            None => return Ok(false),
            Some(Frame::BinaryFrame { channel, payload }) => {
                if channel == rtp_channel {
                    if rtp_tx.send(payload).await.is_err() {
                        return Ok(true); // receiver side dropped, nothing more to do
                    }
                } else if channel == rtcp_channel {
                    // drained, not interpreted
                } else {
                    log::warn!("interleaved frame on unexpected channel {channel}");
                }
            }
            Some(Frame::RtspMessage(text)) => {
                if let Some(reply) = pending_reply.take() {
                    let _ = reply.send(Ok(text));
                } else if text.contains("TEARDOWN") {
                    log::info!("server-initiated TEARDOWN announcement");
                    return Ok(true);
                } else {
                    log::warn!("unexpected late RTSP message on interleaved channel: {text:?}");
                }
            }
        }
    }
}

/// The single capability the depacketizer/orchestrator consume, regardless
/// of which transport backs it.
pub enum Receiver {
    Udp(UdpReceiver),
    TcpInterleaved(TcpInterleavedReceiver),
}

impl Receiver {
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Receiver::Udp(r) => r.recv().await,
            Receiver::TcpInterleaved(r) => r.recv().await,
        }
    }
}
