//! Peer-to-peer mode
//!
//! Serves the bundled web client from the document root and negotiates one
//! browser session at a time over the `/ws` websocket.

use super::{send_json, IceCandidate, PeerSession, ServerError, SignalingServer};
use crate::event_loop::LoopHandle;
use crate::rtc::{default_ice_servers, RtcManager};
use crate::web::{bad_request, mime_type, not_found, server_error, SERVER_NAME};
use axum::{
    body::Body,
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderValue, Method, Request, Response, StatusCode},
    routing::get,
    Router,
};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PROTOCOL: &str = "p2p";

/// Messages a browser sends on `/ws`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum P2pMessage {
    /// Ask us to offer
    Connect,
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { ice: IceCandidate },
    Close,
}

fn encode_candidate(ice: IceCandidate) -> Value {
    json!({ "type": "candidate", "ice": ice })
}

pub struct P2pServer {
    port: u16,
    document_root: PathBuf,
    manager: Arc<RtcManager>,
}

impl P2pServer {
    pub fn new(port: u16, document_root: PathBuf, manager: Arc<RtcManager>) -> Self {
        Self {
            port,
            document_root,
            manager,
        }
    }
}

impl SignalingServer for P2pServer {
    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn run(self: Box<Self>, lp: LoopHandle) -> BoxFuture<'static, Result<(), ServerError>> {
        Box::pin(async move {
            let listener = bind(self.port).await?;
            serve(listener, self.document_root, self.manager, lp.stop_token()).await
        })
    }
}

/// Bind the listening socket on all interfaces
pub async fn bind(port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("0.0.0.0:{}", port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

struct P2pState {
    document_root: PathBuf,
    manager: Arc<RtcManager>,
    busy: AtomicBool,
    stop: CancellationToken,
}

/// Releases the single session slot however the session ends
struct SessionSlot(Arc<P2pState>);

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Serve HTTP and websocket signaling until `stop` fires
pub async fn serve(
    listener: TcpListener,
    document_root: PathBuf,
    manager: Arc<RtcManager>,
    stop: CancellationToken,
) -> Result<(), ServerError> {
    let state = Arc::new(P2pState {
        document_root,
        manager,
        busy: AtomicBool::new(false),
        stop: stop.clone(),
    });

    info!(
        "P2P signaling listening on http://{} (document root {:?})",
        listener.local_addr()?,
        state.document_root
    );

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .fallback(static_handler)
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    info!("P2P signaling stopped");
    Ok(())
}

async fn ws_handler(State(state): State<Arc<P2pState>>, ws: WebSocketUpgrade) -> axum::response::Response {
    if state.busy.swap(true, Ordering::AcqRel) {
        info!("P2P: session already in progress, refusing websocket");
        return ws.on_upgrade(|mut socket| async move {
            let close = json!({ "type": "close" }).to_string();
            let _ = socket.send(Message::Text(close.into())).await;
            let _ = socket.send(Message::Close(None)).await;
        });
    }

    let slot = SessionSlot(state.clone());
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = session(socket, &state).await {
            warn!("P2P session ended with error: {}", e);
        }
        drop(slot);
    })
}

async fn session(socket: WebSocket, state: &P2pState) -> Result<(), ServerError> {
    info!("P2P: websocket session started");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let mut peer = PeerSession::new(PROTOCOL, state.manager.clone(), tx.clone(), encode_candidate);
    let result = async {
        loop {
            let next = tokio::select! {
                _ = state.stop.cancelled() => break,
                next = ws_receiver.next() => next,
            };
            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("P2P websocket error: {}", e);
                    break;
                }
            };

            let message = match serde_json::from_str::<P2pMessage>(text.as_str()) {
                Ok(message) => message,
                Err(e) => {
                    warn!("P2P: ignoring invalid message: {}", e);
                    continue;
                }
            };

            match message {
                P2pMessage::Connect => peer.offer(default_ice_servers()).await?,
                P2pMessage::Offer { sdp } => peer.answer(default_ice_servers(), &sdp).await?,
                P2pMessage::Answer { sdp } => peer.accept_answer(&sdp).await?,
                P2pMessage::Candidate { ice } => peer.add_candidate(ice).await?,
                P2pMessage::Close => {
                    peer.close().await;
                    send_json(&tx, json!({ "type": "close" }));
                }
            }
        }
        Ok::<(), ServerError>(())
    }
    .await;

    peer.close().await;
    drop(peer);
    drop(tx);
    let _ = writer.await;
    info!("P2P: websocket session finished");
    result
}

async fn static_handler(State(state): State<Arc<P2pState>>, req: Request<Body>) -> Response<Body> {
    // Only the head is needed; the body type is not Sync.
    let (parts, _) = req.into_parts();
    serve_file(&state.document_root, &Request::from_parts(parts, ())).await
}

/// GET/HEAD of a file under `root`; anything else gets a canned error
pub async fn serve_file<B>(root: &Path, req: &Request<B>) -> Response<Body> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return bad_request(req, "Unknown HTTP-method").map(Body::from);
    }

    let target = req.uri().path();
    if target.is_empty() || !target.starts_with('/') || target.contains("..") {
        return bad_request(req, "Illegal request-target").map(Body::from);
    }

    let mut path = root.join(target.trim_start_matches('/'));
    if target.ends_with('/') {
        path.push("index.html");
    }

    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return not_found(req, target).map(Body::from);
        }
        Err(e) => return server_error(req, &e.to_string()).map(Body::from),
    };

    let length = contents.len();
    let body = if req.method() == Method::HEAD {
        Body::empty()
    } else {
        Body::from(contents)
    };

    let mut res = Response::new(body);
    *res.status_mut() = StatusCode::OK;
    *res.version_mut() = req.version();
    let headers = res.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(mime_type(&path.to_string_lossy())),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    async fn body_string(res: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn document_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>p2p</html>").unwrap();
        std::fs::create_dir(dir.path().join("js")).unwrap();
        std::fs::write(dir.path().join("js").join("webrtc.js"), "let pc;").unwrap();
        dir
    }

    #[tokio::test]
    async fn serves_files_with_mime_types() {
        let root = document_root();

        let res = serve_file(root.path(), &request(Method::GET, "/js/webrtc.js")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "application/javascript");
        assert_eq!(body_string(res).await, "let pc;");

        let res = serve_file(root.path(), &request(Method::GET, "/")).await;
        assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
        assert_eq!(body_string(res).await, "<html>p2p</html>");
    }

    #[tokio::test]
    async fn head_has_length_but_no_body() {
        let root = document_root();
        let res = serve_file(root.path(), &request(Method::HEAD, "/index.html")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_LENGTH], "16");
        assert_eq!(body_string(res).await, "");
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let root = document_root();

        let res = serve_file(root.path(), &request(Method::POST, "/index.html")).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(res).await, "Unknown HTTP-method");

        let res = serve_file(root.path(), &request(Method::GET, "/../etc/passwd")).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(res).await, "Illegal request-target");

        let res = serve_file(root.path(), &request(Method::GET, "/missing.css")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_string(res).await,
            "The resource '/missing.css' was not found."
        );
    }

    #[tokio::test]
    async fn second_websocket_is_refused() {
        let settings = ConnectionSettings {
            no_video: true,
            no_audio: true,
            ..Default::default()
        };
        let manager = Arc::new(RtcManager::new(&settings, None, None).unwrap());
        let root = document_root();
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stop = CancellationToken::new();

        let server = tokio::spawn(serve(listener, root.path().to_path_buf(), manager, stop.clone()));
        let url = format!("ws://127.0.0.1:{}/ws", port);

        let (first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        // Give the first upgrade time to claim the slot.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match reply {
            WsMessage::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "close");
            }
            other => panic!("unexpected reply {:?}", other),
        }

        stop.cancel();
        drop(first);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
