//! Connection factory shared by every signaling server

use super::connection::{ConnectionEvent, RtcConnection};
use super::data::{DataRelay, SERIAL_CHANNEL};
use super::RtcError;
use crate::capture::CaptureHandle;
use crate::config::{AudioCodec, ConnectionSettings, VideoCodec};
use crate::render::RenderHandle;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "rtc-native";
const VIDEO_CLOCK_RATE: u32 = 90_000;

pub struct RtcManager {
    api: API,
    video: Option<VideoCodec>,
    audio: Option<AudioCodec>,
    capture: CaptureHandle,
    render: Option<RenderHandle>,
    data: DataRelay,
    serial_enabled: bool,
    active: Arc<AtomicUsize>,
}

impl RtcManager {
    /// Build the manager; it takes ownership of the capture handle
    pub fn new(
        settings: &ConnectionSettings,
        capture: CaptureHandle,
        render: Option<RenderHandle>,
    ) -> Result<Self, RtcError> {
        let video = (!settings.no_video).then_some(settings.video_codec);
        let audio = (!settings.no_audio).then_some(settings.audio_codec);

        let mut media_engine = MediaEngine::default();
        register_video_codec(&mut media_engine, settings.video_codec)?;
        register_audio_codec(&mut media_engine, settings.audio_codec)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RtcError::Setup(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(
            "Media session manager ready: video {}, audio {}, capture {}",
            video.map(|c| c.as_str()).unwrap_or("off"),
            audio.map(|c| c.as_str()).unwrap_or("off"),
            if capture.is_some() { "present" } else { "none" }
        );

        Ok(Self {
            api,
            video,
            audio,
            capture,
            render,
            data: DataRelay::new(),
            serial_enabled: settings.serial.is_some(),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn data(&self) -> &DataRelay {
        &self.data
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// New peer connection plus the stream of its local events
    pub async fn create_connection(
        &self,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<(RtcConnection, mpsc::UnboundedReceiver<ConnectionEvent>), RtcError> {
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| RtcError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?,
        );

        self.add_local_tracks(&pc).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.wire_callbacks(&id, &pc, tx);

        if self.serial_enabled {
            let channel = pc
                .create_data_channel(SERIAL_CHANNEL, None)
                .await
                .map_err(|e| RtcError::DataChannel(format!("Failed to create data channel: {}", e)))?;
            self.data.attach(channel);
        }

        debug!("Connection {} created", id);
        Ok((RtcConnection::new(id, pc, self.active.clone()), rx))
    }

    async fn add_local_tracks(&self, pc: &Arc<RTCPeerConnection>) -> Result<(), RtcError> {
        match (self.video, self.capture.is_some()) {
            (Some(codec), true) => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    video_capability(codec),
                    format!("video-{}", uuid::Uuid::new_v4()),
                    STREAM_ID.to_string(),
                ));
                add_track(pc, track).await?;
            }
            _ if self.render.is_some() => {
                // Nothing to send, but the remote video still has to reach the window.
                pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| RtcError::Media(format!("Failed to add video transceiver: {}", e)))?;
            }
            _ => {}
        }

        if let Some(codec) = self.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                audio_capability(codec),
                format!("audio-{}", uuid::Uuid::new_v4()),
                STREAM_ID.to_string(),
            ));
            add_track(pc, track).await?;
        }
        Ok(())
    }

    fn wire_callbacks(&self, id: &str, pc: &Arc<RTCPeerConnection>, tx: mpsc::UnboundedSender<ConnectionEvent>) {
        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(ConnectionEvent::LocalCandidate(init));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                }
            })
        }));

        let conn_id = id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            info!("Connection {} state: {}", conn_id, state);
            let _ = tx.send(ConnectionEvent::State(state));
            Box::pin(async {})
        }));

        let render = self.render.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let render = render.clone();
            Box::pin(async move {
                let track_id = track.id();
                info!("Remote {} track {}", track.kind(), track_id);
                let Some(render) = render else {
                    return;
                };
                if track.kind() != RTPCodecType::Video {
                    return;
                }
                render.track_added(&track_id);
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        if packet.header.marker {
                            render.frame(&track_id);
                        }
                    }
                    render.track_removed(&track_id);
                });
            })
        }));

        let data = self.data.clone();
        pc.on_data_channel(Box::new(move |channel| {
            let data = data.clone();
            Box::pin(async move {
                data.attach(channel);
            })
        }));
    }
}

async fn add_track(pc: &Arc<RTCPeerConnection>, track: Arc<TrackLocalStaticSample>) -> Result<(), RtcError> {
    let sender = pc
        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| RtcError::Media(format!("Failed to add track: {}", e)))?;

    // RTCP has to be drained for the interceptors to run.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
    Ok(())
}

fn video_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp_line().to_string(),
        rtcp_feedback: vec![],
    }
}

fn audio_capability(codec: AudioCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: codec.clock_rate(),
        channels: codec.channels(),
        sdp_fmtp_line: match codec {
            AudioCodec::Opus => "minptime=10;useinbandfec=1".to_string(),
            AudioCodec::Pcmu => String::new(),
        },
        rtcp_feedback: vec![],
    }
}

fn register_video_codec(media_engine: &mut MediaEngine, codec: VideoCodec) -> Result<(), RtcError> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: video_capability(codec),
                payload_type: codec.rtp_payload_type(),
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| RtcError::Setup(format!("Failed to register {}: {}", codec.as_str(), e)))
}

fn register_audio_codec(media_engine: &mut MediaEngine, codec: AudioCodec) -> Result<(), RtcError> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: audio_capability(codec),
                payload_type: codec.rtp_payload_type(),
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| RtcError::Setup(format!("Failed to register {}: {}", codec.as_str(), e)))
}
