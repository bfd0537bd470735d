//! Media session manager
//!
//! Owns the capture handle, the webrtc-rs API configured with the selected
//! codecs, and the data-channel relay. Signaling servers share one manager
//! and ask it for peer connections.

pub mod connection;
pub mod data;
pub mod manager;

pub use connection::{ConnectionEvent, RtcConnection};
pub use data::DataRelay;
pub use manager::RtcManager;

use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// STUN server used when a signaling mode does not supply its own
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// WebRTC-related errors
#[derive(Error, Debug)]
pub enum RtcError {
    #[error("Media engine setup failed: {0}")]
    Setup(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("DataChannel error: {0}")]
    DataChannel(String),

    #[error("Media error: {0}")]
    Media(String),
}

/// ICE server list from bare URLs
pub fn ice_servers(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

/// The default STUN-only ICE configuration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    ice_servers(&[DEFAULT_STUN.to_string()])
}
