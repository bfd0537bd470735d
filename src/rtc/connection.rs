//! One peer connection handed to a signaling server

use super::RtcError;
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Events a connection reports back to its signaling server
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Trickled local candidate to forward to the remote side
    LocalCandidate(RTCIceCandidateInit),
    State(RTCPeerConnectionState),
}

pub struct RtcConnection {
    id: String,
    pc: Arc<RTCPeerConnection>,
    active: Arc<AtomicUsize>,
}

impl RtcConnection {
    pub(crate) fn new(id: String, pc: Arc<RTCPeerConnection>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self { id, pc, active }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    /// Apply a remote offer and return the local answer SDP
    pub async fn accept_offer(&self, sdp: &str) -> Result<String, RtcError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| RtcError::Sdp(format!("Invalid SDP offer: {}", e)))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to create answer: {}", e)))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set local description: {}", e)))?;

        Ok(match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => answer.sdp,
        })
    }

    /// Create and apply a local offer, returning its SDP
    pub async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to create offer: {}", e)))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    /// Apply the remote answer to our offer
    pub async fn accept_answer(&self, sdp: &str) -> Result<(), RtcError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| RtcError::Sdp(format!("Invalid SDP answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| RtcError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| RtcError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    pub async fn close(&self) -> Result<(), RtcError> {
        debug!("Closing connection {}", self.id);
        self.pc
            .close()
            .await
            .map_err(|e| RtcError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}

impl Drop for RtcConnection {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
