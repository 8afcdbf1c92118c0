//! Orchestrator: ties the RTSP client, transport receiver, depacketizer, and
//! frame sink together and owns the run loop and shutdown (SPEC_FULL.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::oneshot;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::h264::depacketizer::{AccessUnit, Depacketizer};
use crate::queue::FrameQueue;
use crate::rtp::RtpPacket;
use crate::rtsp::client::RtspClient;
use crate::rtsp::message::Method;
use crate::rtsp::sdp;
use crate::rtsp_url::RtspUrl;
use crate::sink::FrameSink;
use crate::stats::Stats;
use crate::transport::{NegotiatedTransport, Receiver, TcpInterleavedReceiver, UdpReceiver};

/// Upper bound on access units buffered between the receive loop and the
/// sink task before the oldest non-keyframe is evicted.
const FRAME_QUEUE_CAPACITY: usize = 64;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const UDP_CLIENT_IP: &str = "0.0.0.0";
const UDP_PORT_RANGE_START: u16 = 6970;
const UDP_PORT_RANGE_ATTEMPTS: u16 = 64;

/// A `SETUP` already negotiated, awaiting `PLAY` before the receiver (and,
/// for TCP, the control socket itself) can be constructed.
enum PendingReceiver {
    Udp(UdpReceiver, NegotiatedTransport),
    Tcp(NegotiatedTransport),
}

impl PendingReceiver {
    fn negotiated(&self) -> &NegotiatedTransport {
        match self {
            PendingReceiver::Udp(_, n) => n,
            PendingReceiver::Tcp(n) => n,
        }
    }

    fn into_receiver(self, client: &mut RtspClient) -> Result<Receiver> {
        match self {
            PendingReceiver::Udp(udp, _) => Ok(Receiver::Udp(udp)),
            PendingReceiver::Tcp(negotiated) => {
                let (rtp_channel, rtcp_channel) = match negotiated {
                    NegotiatedTransport::TcpInterleaved {
                        rtp_channel,
                        rtcp_channel,
                    } => (rtp_channel, rtcp_channel),
                    _ => unreachable!("setup_tcp always negotiates TcpInterleaved"),
                };
                let stream = client
                    .take_tcp_stream()
                    .ok_or_else(|| Error::TransportError("control stream already consumed".to_string()))?;
                Ok(Receiver::TcpInterleaved(TcpInterleavedReceiver::spawn(
                    stream,
                    rtp_channel,
                    rtcp_channel,
                )))
            }
        }
    }
}

pub struct Session {
    config: Config,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Session { config }
    }

    /// Runs one capture session to completion. Returns the final statistics
    /// on a clean TEARDOWN or external cancellation; propagates the first
    /// fatal error otherwise (best-effort TEARDOWN is still attempted first).
    pub async fn run(self, sink: Box<dyn FrameSink>, mut shutdown: oneshot::Receiver<()>) -> Result<Stats> {
        let stats = Arc::new(Stats::default());
        let url = RtspUrl::parse(&self.config.rtsp_url)?;

        let mut client = RtspClient::connect(url.clone(), &self.config.retry, self.config.timeout).await?;
        client.options().await?;
        let sdp_body = client.describe().await?;
        let media = sdp::parse_first_h264_video(&sdp_body)?;
        let track_uri = resolve_track_uri(&url, media.control.as_deref());

        let pending = match self.config.transport {
            config::Transport::Udp => self.setup_udp(&mut client, &track_uri).await?,
            config::Transport::Tcp => self.setup_tcp(&mut client, &track_uri).await?,
        };
        info!("negotiated transport: {:?}", pending.negotiated());

        client.play().await?;

        let receiver = pending.into_receiver(&mut client)?;

        let mut depacketizer = Depacketizer::new();
        if !media.sprop_parameter_sets.is_empty() {
            depacketizer.set_parameter_sets(media.sprop_parameter_sets.clone());
        }

        let queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY));
        let sink_task = tokio::spawn(run_sink_task(Arc::clone(&queue), sink));

        let result = self
            .receive_loop(client, receiver, &mut depacketizer, &queue, &stats, &mut shutdown)
            .await;

        queue.close();
        if let Err(e) = sink_task.await {
            warn!("frame sink task panicked: {e}");
        }

        info!(
            "{} packets, {} access units, {} keyframes, {} packets dropped, {} frames dropped",
            stats.packets_received_count(),
            stats.access_units_emitted_count(),
            stats.keyframes_emitted_count(),
            stats.packets_dropped_count(),
            stats.frames_dropped(),
        );

        match result {
            Ok(()) => Ok(Arc::try_unwrap(stats).unwrap_or_default()),
            Err(e) => Err(e),
        }
    }

    /// Binds the UDP port pair and sends `SETUP`, but does not yet construct
    /// the receiver — `PLAY` must still be sent first (SPEC_FULL.md §4.5).
    async fn setup_udp(&self, client: &mut RtspClient, track_uri: &str) -> Result<PendingReceiver> {
        let udp = bind_udp_port_pair().await?;
        let client_port = udp.local_rtp_port()?;
        let negotiated = client.setup_udp(track_uri, client_port).await?;
        if let NegotiatedTransport::Udp {
            server_rtp_addr,
            server_rtcp_addr,
            ..
        } = &negotiated
        {
            udp.connect(*server_rtp_addr, *server_rtcp_addr).await?;
        }
        Ok(PendingReceiver::Udp(udp, negotiated))
    }

    /// Sends `SETUP` for TCP-interleaved transport. The control socket stays
    /// with `client` until `PLAY` succeeds and `PendingReceiver::into_receiver`
    /// hands it to the dedicated receive task.
    async fn setup_tcp(&self, client: &mut RtspClient, track_uri: &str) -> Result<PendingReceiver> {
        let negotiated = client.setup_tcp(track_uri, 0, 1).await?;
        Ok(PendingReceiver::Tcp(negotiated))
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_loop(
        &self,
        mut client: RtspClient,
        mut receiver: Receiver,
        depacketizer: &mut Depacketizer,
        queue: &Arc<FrameQueue>,
        stats: &Arc<Stats>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<()> {
        let keepalive_period = Duration::from_secs((client.session_timeout().as_secs() / 2).max(1));
        let mut keepalive_tick = interval(keepalive_period);
        keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive_tick.reset();

        let run_result = loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown => {
                    info!("cancellation received, stopping capture");
                    break Err(Error::Cancelled);
                }
                _ = keepalive_tick.tick() => {
                    if let Err(e) = self.send_keepalive(&mut client, &mut receiver).await {
                        warn!("keepalive failed: {e}");
                    }
                }
                payload = receiver.recv() => {
                    match payload {
                        Ok(Some(bytes)) => {
                            self.handle_payload(&bytes, depacketizer, queue, stats).await;
                        }
                        Ok(None) => {
                            info!("transport closed cleanly");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.teardown(client, receiver).await;
        run_result
    }

    async fn send_keepalive(&self, client: &mut RtspClient, receiver: &mut Receiver) -> Result<()> {
        match receiver {
            Receiver::Udp(_) => {
                client.keepalive().await?;
            }
            Receiver::TcpInterleaved(tcp) => {
                let method = if client.supports_get_parameter() {
                    Method::GetParameter
                } else {
                    Method::Options
                };
                let req = client.build_request(method);
                let raw = tcp.send_keepalive(req.serialize()).await?;
                let resp = crate::rtsp::message::Response::parse(&raw)?;
                if !resp.is_success() && method == Method::GetParameter {
                    client.mark_get_parameter_unsupported();
                }
            }
        }
        Ok(())
    }

    async fn handle_payload(
        &self,
        bytes: &[u8],
        depacketizer: &mut Depacketizer,
        queue: &Arc<FrameQueue>,
        stats: &Arc<Stats>,
    ) {
        stats.packet_received(bytes.len());

        let packet = match RtpPacket::parse(bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping malformed RTP packet: {e}");
                stats.packets_dropped_add(1);
                return;
            }
        };

        let units = depacketizer.process(&packet);
        stats.packets_dropped_add(depacketizer.packets_dropped);
        depacketizer.packets_dropped = 0;

        for unit in units {
            self.emit(unit, queue, stats).await;
        }
    }

    async fn emit(&self, unit: AccessUnit, queue: &Arc<FrameQueue>, stats: &Arc<Stats>) {
        stats.access_unit_emitted(unit.is_keyframe);
        if self.config.continuous_decoder || unit.is_keyframe {
            queue.push(unit, stats).await;
        }
    }

    async fn teardown(&self, mut client: RtspClient, receiver: Receiver) {
        match receiver {
            Receiver::Udp(_) => {
                if let Err(e) = timeout(TEARDOWN_TIMEOUT, client.teardown()).await {
                    warn!("TEARDOWN did not complete within {TEARDOWN_TIMEOUT:?}: {e}");
                }
            }
            Receiver::TcpInterleaved(tcp) => {
                let req = client.build_request(Method::Teardown);
                match timeout(TEARDOWN_TIMEOUT, tcp.send_keepalive(req.serialize())).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("TEARDOWN failed: {e}"),
                    Err(_) => warn!("TEARDOWN did not complete within {TEARDOWN_TIMEOUT:?}"),
                }
                tcp.stop();
            }
        }
    }
}

async fn run_sink_task(queue: Arc<FrameQueue>, mut sink: Box<dyn FrameSink>) {
    while let Some(unit) = queue.pop().await {
        if let Err(e) = sink.write(&unit).await {
            error!("frame sink write failed: {e}");
        }
    }
}

async fn bind_udp_port_pair() -> Result<UdpReceiver> {
    let mut last_err = None;
    for i in 0..UDP_PORT_RANGE_ATTEMPTS {
        let port = UDP_PORT_RANGE_START + i * 2;
        match UdpReceiver::bind(UDP_CLIENT_IP, port).await {
            Ok(receiver) => return Ok(receiver),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::TransportError("no UDP port pair available".to_string())))
}

/// Resolves the `SETUP` request-URI for the selected media track against the
/// aggregate control URL and SDP `a=control` value (absolute, root-relative,
/// or a bare suffix to append).
fn resolve_track_uri(base: &RtspUrl, control: Option<&str>) -> String {
    let base_uri = base.request_uri();
    match control {
        None => base_uri,
        Some(c) if c.starts_with("rtsp://") => c.to_string(),
        Some(c) if c.starts_with('/') => format!("rtsp://{}:{}{}", base.host, base.port, c),
        Some(c) => {
            if base_uri.ends_with('/') {
                format!("{base_uri}{c}")
            } else {
                format!("{base_uri}/{c}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> RtspUrl {
        RtspUrl {
            host: "127.0.0.1".to_string(),
            port: 554,
            path: path.to_string(),
            username: None,
            password: None,
        }
    }

    #[test]
    fn resolves_absolute_control_uri() {
        let base = url("/stream");
        assert_eq!(
            resolve_track_uri(&base, Some("rtsp://other/stream/trackID=1")),
            "rtsp://other/stream/trackID=1"
        );
    }

    #[test]
    fn resolves_relative_control_uri() {
        let base = url("/stream");
        assert_eq!(resolve_track_uri(&base, Some("trackID=1")), "rtsp://127.0.0.1:554/stream/trackID=1");
    }

    #[test]
    fn resolves_root_relative_control_uri() {
        let base = url("/stream");
        assert_eq!(resolve_track_uri(&base, Some("/trackID=1")), "rtsp://127.0.0.1:554/trackID=1");
    }

    #[test]
    fn falls_back_to_base_uri_when_control_absent() {
        let base = url("/stream");
        assert_eq!(resolve_track_uri(&base, None), "rtsp://127.0.0.1:554/stream");
    }
}
