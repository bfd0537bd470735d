//! Startup and resource errors
//!
//! Anything that surfaces here aborts startup with exit status 1. Runtime
//! failures inside a signaling server stay in `signaling::ServerError` and are
//! logged at the task boundary instead.

use std::path::PathBuf;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::rtc::RtcError;
use crate::serial::SerialError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to open log file in {dir}: {source}")]
    LogSink {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install logger: {0}")]
    Logger(#[from] log::SetLoggerError),

    #[error("failed to create capturer: {0}")]
    Capture(#[from] CaptureError),

    #[error("Media session manager: {0}")]
    Rtc(#[from] RtcError),

    #[error("Serial data channel: {0}")]
    Serial(#[from] SerialError),

    #[error("Failed to start render thread: {0}")]
    Render(#[source] std::io::Error),

    #[error("Event loop: {0}")]
    EventLoop(#[source] std::io::Error),

    #[error("Failed to daemonize: {0}")]
    Daemon(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
