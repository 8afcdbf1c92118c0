//! RTSP/RTP client that depacketizes H.264 video into Annex B access units.
//!
//! The protocol stack (`rtsp`, `transport`, `rtp`, `h264`) has no knowledge of
//! configuration, logging, or disk I/O; [`session::Session`] is the only piece
//! that ties them to the outside world.

pub mod config;
pub mod digest;
pub mod error;
pub mod h264;
pub mod queue;
pub mod rtp;
pub mod rtsp;
pub mod rtsp_url;
pub mod session;
pub mod sink;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use session::Session;
