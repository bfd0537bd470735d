//! Ayame relay mode
//!
//! Registers in a room on an Ayame signaling server. The side that finds a
//! peer already waiting sends the offer; the other side answers. After `bye`
//! the connection is dropped and we wait in the room for the next peer.

use super::{send_json, IceCandidate, PeerSession, ServerError, SignalingServer};
use crate::config::AyameSettings;
use crate::event_loop::LoopHandle;
use crate::rtc::{default_ice_servers, RtcManager};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_server::RTCIceServer;

const PROTOCOL: &str = "ayame";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AyameMessage {
    Accept {
        #[serde(rename = "isExistClient", default)]
        is_exist_client: bool,
        #[serde(rename = "iceServers", default)]
        ice_servers: Option<Vec<AyameIceServer>>,
    },
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        ice: Option<IceCandidate>,
    },
    Ping,
    Bye,
    #[serde(other)]
    Other,
}

/// `urls` is a string or a list depending on the server build
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct AyameIceServer {
    urls: Urls,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

fn ice_servers(servers: Option<Vec<AyameIceServer>>) -> Vec<RTCIceServer> {
    let servers: Vec<RTCIceServer> = servers
        .unwrap_or_default()
        .into_iter()
        .map(|s| RTCIceServer {
            urls: match s.urls {
                Urls::One(url) => vec![url],
                Urls::Many(urls) => urls,
            },
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
    json!({ "type": "candidate", "ice": ice })
}

pub struct AyameServer {
    settings: AyameSettings,
    metadata: Option<Value>,
    manager: Arc<RtcManager>,
}

impl AyameServer {
    pub fn new(settings: AyameSettings, metadata: Option<Value>, manager: Arc<RtcManager>) -> Self {
        Self {
            settings,
            metadata,
            manager,
        }
    }

    pub fn register_message(&self) -> Value {
        let mut msg = json!({
            "type": "register",
            "roomId": self.settings.room_id,
            "clientId": self.settings.client_id,
        });
        if let Some(key) = &self.settings.signaling_key {
            msg["key"] = json!(key);
        }
        if let Some(metadata) = &self.metadata {
            msg["authnMetadata"] = metadata.clone();
        }
        msg
    }

    /// One registration; returns when the socket closes or `stop` fires
    pub async fn serve(self, stop: CancellationToken) -> Result<(), ServerError> {
        info!(
            "Ayame: connecting to {} (room {}, client {})",
            self.settings.signaling_url, self.settings.room_id, self.settings.client_id
        );
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

        send_json(&tx, self.register_message());
        let mut peer = PeerSession::new(PROTOCOL, self.manager.clone(), tx.clone(), encode_candidate);
        let mut room_ice = default_ice_servers();

        let result = async {
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => break,
                    next = ws_receiver.next() => next,
                };
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        info!("Ayame: signaling closed {:?}", frame);
                        break;
                    }
                    None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                let message = match serde_json::from_str::<AyameMessage>(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Ayame: ignoring invalid message: {}", e);
                        continue;
                    }
                };

                match message {
                    AyameMessage::Accept {
                        is_exist_client,
                        ice_servers: servers,
                    } => {
                        info!("Ayame: registered, peer waiting: {}", is_exist_client);
                        room_ice = ice_servers(servers);
                        if is_exist_client {
                            peer.offer(room_ice.clone()).await?;
                        }
                    }
                    AyameMessage::Reject { reason } => {
                        return Err(ServerError::Rejected(reason.unwrap_or_else(|| "rejected".to_string())));
                    }
                    AyameMessage::Offer { sdp } => peer.answer(room_ice.clone(), &sdp).await?,
                    AyameMessage::Answer { sdp } => peer.accept_answer(&sdp).await?,
                    AyameMessage::Candidate { ice: Some(ice) } => peer.add_candidate(ice).await?,
                    AyameMessage::Candidate { ice: None } => debug!("Ayame: end of candidates"),
                    AyameMessage::Ping => send_json(&tx, json!({ "type": "pong" })),
                    AyameMessage::Bye => {
                        info!("Ayame: peer left the room");
                        if peer.is_open() {
                            peer.close().await;
                        }
                    }
                    AyameMessage::Other => debug!("Ayame: unhandled message {}", text),
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        peer.close().await;
        drop(peer);
        drop(tx);
        let _ = writer.await;
        info!("Ayame: session finished");
        result
    }
}

impl SignalingServer for AyameServer {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn run(self: Box<Self>, lp: LoopHandle) -> BoxFuture<'static, Result<(), ServerError>> {
        Box::pin(async move { self.serve(lp.stop_token()).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use tokio::net::TcpListener;

    fn manager() -> Arc<RtcManager> {
        let settings = ConnectionSettings {
            no_video: true,
            no_audio: true,
            ..Default::default()
        };
        Arc::new(RtcManager::new(&settings, None, None).unwrap())
    }

    fn settings(url: String) -> AyameSettings {
        AyameSettings {
            signaling_url: url,
            room_id: "room-1".to_string(),
            client_id: "client-1".to_string(),
            signaling_key: Some("secret".to_string()),
        }
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn register_message_fields() {
        let server = AyameServer::new(
            settings("wss://ayame.example/signaling".into()),
            Some(json!({ "user": "u" })),
            manager(),
        );
        let msg = server.register_message();
        assert_eq!(msg["type"], "register");
        assert_eq!(msg["roomId"], "room-1");
        assert_eq!(msg["clientId"], "client-1");
        assert_eq!(msg["key"], "secret");
        assert_eq!(msg["authnMetadata"]["user"], "u");
    }

    #[test]
    fn accept_urls_as_string_or_list() {
        let msg: AyameMessage = serde_json::from_value(json!({
            "type": "accept",
            "isExistClient": false,
            "iceServers": [
                { "urls": "stun:a.example:3478" },
                { "urls": ["turn:b.example:3478"], "username": "u", "credential": "c" }
            ]
        }))
        .unwrap();
        let AyameMessage::Accept { ice_servers: servers, .. } = msg else {
            panic!("not an accept");
        };
        let servers = ice_servers(servers);
        assert_eq!(servers[0].urls, vec!["stun:a.example:3478".to_string()]);
        assert_eq!(servers[1].credential, "c");
    }

    #[tokio::test]
    async fn waits_in_room_through_bye() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/signaling", listener.local_addr().unwrap());

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let register = next_json(&mut ws).await;
            assert_eq!(register["type"], "register");
            assert_eq!(register["roomId"], "room-1");

            ws.send(Message::Text(json!({ "type": "accept", "isExistClient": false }).to_string()))
                .await
                .unwrap();
            ws.send(Message::Text(json!({ "type": "ping" }).to_string())).await.unwrap();
            assert_eq!(next_json(&mut ws).await["type"], "pong");

            // Still registered after bye: ping is answered again.
            ws.send(Message::Text(json!({ "type": "bye" }).to_string())).await.unwrap();
            ws.send(Message::Text(json!({ "type": "ping" }).to_string())).await.unwrap();
            assert_eq!(next_json(&mut ws).await["type"], "pong");

            ws.close(None).await.unwrap();
        });

        let server = AyameServer::new(settings(url), None, manager());
        server.serve(CancellationToken::new()).await.unwrap();
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn reject_ends_the_session_with_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/signaling", listener.local_addr().unwrap());

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            next_json(&mut ws).await;
            ws.send(Message::Text(json!({ "type": "reject", "reason": "full" }).to_string()))
                .await
                .unwrap();
            // Drain until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let server = AyameServer::new(settings(url), None, manager());
        let result = server.serve(CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::Rejected(reason)) if reason == "full"));
        relay.await.unwrap();
    }
}
