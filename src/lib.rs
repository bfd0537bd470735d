//! rtc-native - WebRTC native client core
//!
//! Parses and validates the command line, selects the capture backend, wires
//! it into the media session manager and hosts the P2P, Sora and Ayame
//! signaling servers on one shared event loop.

pub mod args;
pub mod capture;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod orchestrator;
pub mod render;
pub mod rtc;
pub mod serial;
pub mod signaling;
pub mod web;

// Re-exports
pub use args::{Launch, Startup};
pub use config::{ConnectionSettings, FileConfig, VideoCodec, AudioCodec, HardwareEncoder};
pub use error::AppError;
pub use event_loop::{EventLoop, LoopHandle, LoopState};
pub use logging::LogContext;
pub use rtc::RtcManager;
pub use signaling::{ServerSet, SignalingServer};
