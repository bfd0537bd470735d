//! Sora SFU mode
//!
//! Outbound websocket client: sends `connect`, answers the SFU's offer and
//! trickles candidates. Sessions start at launch with `--auto` (and are
//! retried after a drop) or on `POST /connect` to the local control port.

use super::{send_json, IceCandidate, PeerSession, ServerError, SignalingServer};
use crate::config::{ConnectionSettings, SoraSettings};
use crate::event_loop::LoopHandle;
use crate::rtc::{default_ice_servers, RtcManager};
use crate::web::{bad_request, not_found, respond, server_error};
use axum::{
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
    routing::post,
    Router,
};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_server::RTCIceServer;

const PROTOCOL: &str = "sora";

/// Delay before an `--auto` session is retried
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// The `connect` message, fixed at startup
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub role: &'static str,
    pub channel_id: String,
    pub metadata: Option<Value>,
    pub video: Option<MediaRequest>,
    pub audio: Option<MediaRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub codec_type: &'static str,
    pub bit_rate: Option<u32>,
}

impl ConnectRequest {
    pub fn from_settings(settings: &ConnectionSettings, sora: &SoraSettings) -> Self {
        let video = (!settings.no_video).then(|| MediaRequest {
            codec_type: settings.video_codec.as_str(),
            bit_rate: settings.video_bitrate,
        });
        let audio = (!settings.no_audio).then(|| MediaRequest {
            codec_type: settings.audio_codec.as_str(),
            bit_rate: settings.audio_bitrate,
        });

        Self {
            role: if settings.render.is_some() { "sendrecv" } else { "sendonly" },
            channel_id: sora.channel_id.clone(),
            metadata: settings.metadata.clone(),
            video,
            audio,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut msg = json!({
            "type": "connect",
            "role": self.role,
            "channel_id": self.channel_id,
            "sora_client": concat!("rtc-native ", env!("CARGO_PKG_VERSION")),
            "video": media_json(&self.video),
            "audio": media_json(&self.audio),
        });
        if let Some(metadata) = &self.metadata {
            msg["metadata"] = metadata.clone();
        }
        msg
    }
}

fn media_json(media: &Option<MediaRequest>) -> Value {
    match media {
        None => Value::Bool(false),
        Some(media) => {
            let mut value = json!({ "codec_type": media.codec_type });
            if let Some(bit_rate) = media.bit_rate {
                value["bit_rate"] = json!(bit_rate);
            }
            value
        }
    }
}

/// Messages the SFU sends us
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SoraMessage {
    Offer {
        sdp: String,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        config: Option<OfferConfig>,
    },
    Update {
        sdp: String,
    },
    #[serde(rename = "re-offer")]
    ReOffer {
        sdp: String,
    },
    Ping {
        #[serde(default)]
        stats: bool,
    },
    Notify {
        #[serde(default)]
        event_type: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OfferConfig {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<SoraIceServer>,
}

#[derive(Debug, Deserialize)]
struct SoraIceServer {
    urls: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

fn ice_servers(config: Option<OfferConfig>) -> Vec<RTCIceServer> {
    let servers: Vec<RTCIceServer> = config
        .map(|c| c.ice_servers)
        .unwrap_or_default()
        .into_iter()
        .map(|s| RTCIceServer {
            urls: s.urls,
            username: s.username.unwrap_or_default(),
            credential: s.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    if servers.is_empty() {
        default_ice_servers()
    } else {
        servers
    }
}

fn encode_candidate(ice: IceCandidate) -> Value {
    json!({ "type": "candidate", "candidate": ice.candidate })
}

pub struct SoraServer {
    settings: SoraSettings,
    connect: ConnectRequest,
    manager: Arc<RtcManager>,
}

impl SoraServer {
    pub fn new(settings: SoraSettings, connect: ConnectRequest, manager: Arc<RtcManager>) -> Self {
        Self {
            settings,
            connect,
            manager,
        }
    }

    /// Run the control listener (if any) and the session loop until `stop`
    pub async fn serve(self, stop: CancellationToken) -> Result<(), ServerError> {
        let (triggers_tx, triggers_rx) = mpsc::channel(1);

        match self.settings.port {
            Some(port) => {
                let listener = bind_control(port).await?;
                let control = control_server(listener, triggers_tx, stop.clone());
                let sessions = self.session_loop(triggers_rx, stop.clone());
                tokio::try_join!(control, sessions)?;
            }
            None => {
                drop(triggers_tx);
                self.session_loop(triggers_rx, stop).await?;
            }
        }
        Ok(())
    }

    async fn session_loop(&self, mut triggers: mpsc::Receiver<()>, stop: CancellationToken) -> Result<(), ServerError> {
        let auto = self.settings.auto_connect;
        let controlled = self.settings.port.is_some();
        let mut pending = auto || !controlled;

        loop {
            if !pending {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    trigger = triggers.recv() => if trigger.is_none() { break },
                }
            }
            pending = false;

            match self.session(&stop).await {
                Ok(()) => info!("Sora: session ended"),
                Err(e) if !auto && !controlled => return Err(e),
                Err(e) => warn!("Sora: session failed: {}", e),
            }

            if stop.is_cancelled() {
                break;
            }
            if auto {
                info!("Sora: reconnecting in {:?}", RECONNECT_DELAY);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
                pending = true;
            } else if !controlled {
                break;
            }
        }
        Ok(())
    }

    async fn session(&self, stop: &CancellationToken) -> Result<(), ServerError> {
        info!("Sora: connecting to {}", self.settings.signaling_url);
        let ws = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            ws = tokio_tungstenite::connect_async(self.settings.signaling_url.as_str()) => ws?.0,
        };
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        send_json(&tx, self.connect.to_json());
        let mut peer = PeerSession::new(PROTOCOL, self.manager.clone(), tx.clone(), encode_candidate);

        let result = async {
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = ws_receiver.next() => next,
                };
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        info!("Sora: signaling closed {:?}", frame);
                        break;
                    }
                    None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                let message = match serde_json::from_str::<SoraMessage>(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Sora: ignoring invalid message: {}", e);
                        continue;
                    }
                };

                match message {
                    SoraMessage::Offer { sdp, client_id, config } => {
                        if let Some(id) = client_id {
                            info!("Sora: offer for client {}", id);
                        }
                        peer.answer(ice_servers(config), &sdp).await?;
                    }
                    SoraMessage::Update { sdp } => peer.renegotiate(&sdp, "update").await?,
                    SoraMessage::ReOffer { sdp } => peer.renegotiate(&sdp, "re-answer").await?,
                    SoraMessage::Ping { stats } => {
                        debug!("Sora: ping (stats requested: {})", stats);
                        send_json(&tx, json!({ "type": "pong" }));
                    }
                    SoraMessage::Notify { event_type } => info!("Sora: notify {}", event_type),
                    SoraMessage::Other => debug!("Sora: unhandled message {}", text),
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        peer.close().await;
        drop(peer);
        drop(tx);
        let _ = writer.await;
        result
    }
}

impl SignalingServer for SoraServer {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn run(self: Box<Self>, lp: LoopHandle) -> BoxFuture<'static, Result<(), ServerError>> {
        Box::pin(async move { self.serve(lp.stop_token()).await })
    }
}

/// Bind the control listener on loopback; port 0 picks an ephemeral port
pub async fn bind_control(port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("127.0.0.1:{}", port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn control_server(
    listener: TcpListener,
    triggers: mpsc::Sender<()>,
    stop: CancellationToken,
) -> Result<(), ServerError> {
    info!("Sora control listening on http://{}", listener.local_addr()?);

    let app = Router::new()
        .route("/connect", post(connect_handler).fallback(wrong_method))
        .fallback(unknown_target)
        .with_state(triggers);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;
    Ok(())
}

fn head_only(req: Request<Body>) -> Request<()> {
    let (parts, _) = req.into_parts();
    Request::from_parts(parts, ())
}

async fn connect_handler(State(triggers): State<mpsc::Sender<()>>, req: Request<Body>) -> Response<Body> {
    let req = head_only(req);
    let res = match triggers.try_send(()) {
        Ok(()) => respond(&req, StatusCode::OK, "connecting".to_string()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            respond(&req, StatusCode::OK, "connect already requested".to_string())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => server_error(&req, "signaling stopped"),
    };
    res.map(Body::from)
}

async fn wrong_method(req: Request<Body>) -> Response<Body> {
    bad_request(&head_only(req), "Unknown HTTP-method").map(Body::from)
}

async fn unknown_target(req: Request<Body>) -> Response<Body> {
    let req = head_only(req);
    not_found(&req, req.uri().path()).map(Body::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioCodec, VideoCodec};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sora_settings(url: String) -> SoraSettings {
        SoraSettings {
            signaling_url: url,
            channel_id: "sora-test".to_string(),
            auto_connect: false,
            port: None,
        }
    }

    fn media_off() -> ConnectionSettings {
        ConnectionSettings {
            no_video: true,
            no_audio: true,
            ..Default::default()
        }
    }

    #[test]
    fn connect_message_fields() {
        let settings = ConnectionSettings {
            video_codec: VideoCodec::H264,
            video_bitrate: Some(800),
            audio_codec: AudioCodec::Opus,
            metadata: Some(json!({ "access_token": "xyz" })),
            ..Default::default()
        };
        let msg = ConnectRequest::from_settings(&settings, &sora_settings("wss://h".into())).to_json();

        assert_eq!(msg["type"], "connect");
        assert_eq!(msg["role"], "sendonly");
        assert_eq!(msg["channel_id"], "sora-test");
        assert_eq!(msg["video"]["codec_type"], "H264");
        assert_eq!(msg["video"]["bit_rate"], 800);
        assert_eq!(msg["audio"]["codec_type"], "OPUS");
        assert!(msg["audio"].get("bit_rate").is_none());
        assert_eq!(msg["metadata"]["access_token"], "xyz");
    }

    #[test]
    fn disabled_media_is_false() {
        let msg = ConnectRequest::from_settings(&media_off(), &sora_settings("wss://h".into())).to_json();
        assert_eq!(msg["video"], false);
        assert_eq!(msg["audio"], false);
        assert!(msg.get("metadata").is_none());
    }

    #[test]
    fn offer_config_ice_servers() {
        let msg: SoraMessage = serde_json::from_value(json!({
            "type": "offer",
            "sdp": "v=0",
            "config": { "iceServers": [
                { "urls": ["turn:turn.example:3478"], "username": "u", "credential": "p" }
            ]}
        }))
        .unwrap();
        match msg {
            SoraMessage::Offer { config, .. } => {
                let servers = ice_servers(config);
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].username, "u");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ice_servers(None)[0].urls, vec![crate::rtc::DEFAULT_STUN.to_string()]);

        let unknown: SoraMessage = serde_json::from_value(json!({ "type": "push", "data": {} })).unwrap();
        assert!(matches!(unknown, SoraMessage::Other));
    }

    #[tokio::test]
    async fn one_shot_session_answers_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/signaling", listener.local_addr().unwrap());

        let sfu = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let connect = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(connect["type"], "connect");
            assert_eq!(connect["channel_id"], "sora-test");

            ws.send(Message::Text(json!({ "type": "ping" }).to_string())).await.unwrap();
            let pong = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(pong["type"], "pong");

            ws.close(None).await.unwrap();
        });

        let manager = Arc::new(RtcManager::new(&media_off(), None, None).unwrap());
        let settings = media_off();
        let sora = sora_settings(url);
        let server = SoraServer::new(sora.clone(), ConnectRequest::from_settings(&settings, &sora), manager);

        server.serve(CancellationToken::new()).await.unwrap();
        sfu.await.unwrap();
    }

    async fn http(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn control_port_triggers_connect() {
        let listener = bind_control(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let server = tokio::spawn(control_server(listener, tx, stop.clone()));

        let ok = http(
            addr,
            "POST /connect HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(ok.starts_with("HTTP/1.1 200"), "{}", ok);
        assert_eq!(rx.recv().await, Some(()));

        let missing = http(addr, "GET /status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{}", missing);
        assert!(missing.contains("The resource '/status' was not found."));

        let wrong = http(addr, "GET /connect HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        assert!(wrong.starts_with("HTTP/1.1 400"), "{}", wrong);

        stop.cancel();
        server.await.unwrap().unwrap();
    }
}
