//! RTSP 1.0 control protocol: wire types, the interleaved-frame reader, SDP
//! parsing, and the client state machine built from them.

pub mod client;
pub mod framer;
pub mod message;
pub mod sdp;

pub use client::RtspClient;
pub use message::{Method, Request, Response};
