//! Signaling servers
//!
//! Each selected mode becomes one `SignalingServer`. They share the media
//! session manager, run as independent services on the event loop and stop
//! together when the loop's stop token fires.

pub mod ayame;
pub mod p2p;
pub mod sora;

use crate::config::{ConnectionSettings, FileConfig};
use crate::event_loop::LoopHandle;
use crate::rtc::{ConnectionEvent, RtcConnection, RtcError, RtcManager};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Runtime failures of one signaling server; logged, never fatal to the loop
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid signaling message: {0}")]
    Message(#[from] serde_json::Error),

    #[error(transparent)]
    Rtc(#[from] RtcError),

    #[error("Rejected by signaling server: {0}")]
    Rejected(String),
}

/// One connection-establishment protocol hosted on the shared loop
pub trait SignalingServer: Send {
    fn name(&self) -> &'static str;

    /// Bind and serve until the loop stops or the protocol ends
    fn run(self: Box<Self>, lp: LoopHandle) -> BoxFuture<'static, Result<(), ServerError>>;
}

/// The servers selected on the command line
#[derive(Default)]
pub struct ServerSet {
    servers: Vec<Box<dyn SignalingServer>>,
}

impl ServerSet {
    pub fn from_settings(settings: &ConnectionSettings, file: &FileConfig, manager: &Arc<RtcManager>) -> Self {
        let mut set = ServerSet::default();

        if let Some(p2p) = &settings.p2p {
            let document_root = p2p
                .document_root
                .clone()
                .unwrap_or_else(|| file.p2p.document_root.clone());
            set.push(Box::new(p2p::P2pServer::new(p2p.port, document_root, manager.clone())));
        }

        if let Some(sora) = &settings.sora {
            set.push(Box::new(sora::SoraServer::new(
                sora.clone(),
                sora::ConnectRequest::from_settings(settings, sora),
                manager.clone(),
            )));
        }

        if let Some(ayame) = &settings.ayame {
            set.push(Box::new(ayame::AyameServer::new(
                ayame.clone(),
                settings.metadata.clone(),
                manager.clone(),
            )));
        }

        set
    }

    pub fn push(&mut self, server: Box<dyn SignalingServer>) {
        self.servers.push(server);
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.servers.iter().map(|s| s.name()).collect()
    }

    /// Register every server as an isolated service on the loop
    pub fn spawn_all(self, lp: &LoopHandle) {
        for server in self.servers {
            let name = server.name();
            info!("Starting {} signaling", name);
            lp.spawn_service(name, server.run(lp.clone()));
        }
    }
}

/// ICE candidate as browsers and relay servers spell it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(c: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

/// Text frames queued for the socket writer
pub(crate) type Outbox = mpsc::UnboundedSender<String>;

pub(crate) fn send_json(out: &Outbox, value: Value) {
    let _ = out.send(value.to_string());
}

/// Forward a connection's local candidates to the remote side, encoded by
/// the protocol, until the connection's event stream ends
pub(crate) fn forward_events(
    protocol: &'static str,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    out: Outbox,
    encode: fn(IceCandidate) -> Value,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::LocalCandidate(init) => send_json(&out, encode(init.into())),
                ConnectionEvent::State(state) => debug!("{} connection state: {}", protocol, state),
            }
        }
    })
}

/// The one peer connection a signaling session negotiates at a time
pub(crate) struct PeerSession {
    protocol: &'static str,
    manager: Arc<RtcManager>,
    out: Outbox,
    encode: fn(IceCandidate) -> Value,
    conn: Option<RtcConnection>,
    forwarder: Option<JoinHandle<()>>,
}

impl PeerSession {
    pub(crate) fn new(
        protocol: &'static str,
        manager: Arc<RtcManager>,
        out: Outbox,
        encode: fn(IceCandidate) -> Value,
    ) -> Self {
        Self {
            protocol,
            manager,
            out,
            encode,
            conn: None,
            forwarder: None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self, ice_servers: Vec<RTCIceServer>) -> Result<&RtcConnection, ServerError> {
        self.close().await;
        let (conn, events) = self.manager.create_connection(ice_servers).await?;
        info!("{}: connection {} opened", self.protocol, conn.id());
        self.forwarder = Some(forward_events(self.protocol, events, self.out.clone(), self.encode));
        Ok(self.conn.insert(conn))
    }

    /// New connection, local offer sent as `{"type":"offer"}`
    pub(crate) async fn offer(&mut self, ice_servers: Vec<RTCIceServer>) -> Result<(), ServerError> {
        let sdp = self.open(ice_servers).await?.create_offer().await?;
        send_json(&self.out, json!({ "type": "offer", "sdp": sdp }));
        Ok(())
    }

    /// New connection answering the remote offer with `{"type":"answer"}`
    pub(crate) async fn answer(&mut self, ice_servers: Vec<RTCIceServer>, sdp: &str) -> Result<(), ServerError> {
        let answer = self.open(ice_servers).await?.accept_offer(sdp).await?;
        send_json(&self.out, json!({ "type": "answer", "sdp": answer }));
        Ok(())
    }

    /// Re-offer on the current connection, replying with `reply_type`
    pub(crate) async fn renegotiate(&mut self, sdp: &str, reply_type: &str) -> Result<(), ServerError> {
        let Some(conn) = &self.conn else {
            warn!("{}: {} without a connection", self.protocol, reply_type);
            return Ok(());
        };
        let answer = conn.accept_offer(sdp).await?;
        send_json(&self.out, json!({ "type": reply_type, "sdp": answer }));
        Ok(())
    }

    pub(crate) async fn accept_answer(&mut self, sdp: &str) -> Result<(), ServerError> {
        match &self.conn {
            Some(conn) => Ok(conn.accept_answer(sdp).await?),
            None => {
                warn!("{}: answer without an outstanding offer", self.protocol);
                Ok(())
            }
        }
    }

    pub(crate) async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), ServerError> {
        match &self.conn {
            Some(conn) => Ok(conn.add_remote_candidate(candidate.into()).await?),
            None => {
                debug!("{}: candidate before connection, dropped", self.protocol);
                Ok(())
            }
        }
    }

    pub(crate) async fn close(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!("{}: {}", self.protocol, e);
            }
            info!("{}: connection {} closed ({})", self.protocol, conn.id(), conn.state());
        }
    }
}
