//! Video capture backend selection
//!
//! Exactly one backend is chosen at startup from the compiled platform
//! support and the runtime `--use-native` preference. Disabled video is not
//! an error: it yields an empty handle.

#[cfg(target_os = "linux")]
pub mod v4l2;

use crate::config::{ConnectionSettings, Size};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Capture construction errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device not found: {0}")]
    DeviceMissing(String),

    #[error("capture device busy: {0}")]
    DeviceBusy(String),

    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),

    #[error("{device} does not offer {width}x{height} as a {class} format")]
    UnsupportedResolution {
        device: String,
        width: u32,
        height: u32,
        class: &'static str,
    },

    #[error("no video capture backend is available on this platform")]
    NoBackend,

    #[error("I/O error on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },
}

/// Backend families that can be compiled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Raw frames from a V4L2 device
    V4l2,
    /// Compressed frames (H264/MJPEG) straight from the device
    Native,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::V4l2 => "v4l2",
            BackendKind::Native => "native",
        }
    }
}

/// What the orchestrator asks the backend to open
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Device path or card name; `None` picks the first capture device
    pub device: Option<String>,
    pub size: Size,
    pub framerate: u32,
}

impl CaptureRequest {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            device: settings.video_device.clone(),
            size: settings.size(),
            framerate: settings.framerate,
        }
    }
}

/// Negotiated capture format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    pub size: Size,
    pub fourcc: String,
    pub framerate: u32,
}

/// A constructed capture source
#[derive(Debug)]
pub enum VideoCapture {
    #[cfg(target_os = "linux")]
    V4l2(v4l2::V4l2Capture),
    #[cfg(all(target_os = "linux", feature = "native-capture"))]
    Native(v4l2::V4l2Capture),
}

impl VideoCapture {
    pub fn backend(&self) -> BackendKind {
        match *self {
            #[cfg(target_os = "linux")]
            VideoCapture::V4l2(_) => BackendKind::V4l2,
            #[cfg(all(target_os = "linux", feature = "native-capture"))]
            VideoCapture::Native(_) => BackendKind::Native,
        }
    }

    pub fn device(&self) -> &Path {
        match *self {
            #[cfg(target_os = "linux")]
            VideoCapture::V4l2(ref c) => c.path(),
            #[cfg(all(target_os = "linux", feature = "native-capture"))]
            VideoCapture::Native(ref c) => c.path(),
        }
    }

    pub fn card(&self) -> &str {
        match *self {
            #[cfg(target_os = "linux")]
            VideoCapture::V4l2(ref c) => c.card(),
            #[cfg(all(target_os = "linux", feature = "native-capture"))]
            VideoCapture::Native(ref c) => c.card(),
        }
    }

    pub fn format(&self) -> &CaptureFormat {
        match *self {
            #[cfg(target_os = "linux")]
            VideoCapture::V4l2(ref c) => c.format(),
            #[cfg(all(target_os = "linux", feature = "native-capture"))]
            VideoCapture::Native(ref c) => c.format(),
        }
    }
}

/// Shared handle to the capture source; `None` when video is disabled
pub type CaptureHandle = Option<Arc<VideoCapture>>;

/// Pick the backend family for this build and preference.
pub fn select_backend(prefer_native: bool) -> Result<BackendKind, CaptureError> {
    #[cfg(target_os = "linux")]
    {
        if prefer_native {
            if cfg!(feature = "native-capture") {
                return Ok(BackendKind::Native);
            }
            warn!("--use-native requested but this build has no native capture path, using V4L2");
        }
        Ok(BackendKind::V4l2)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = prefer_native;
        Err(CaptureError::NoBackend)
    }
}

/// Build the capture source for the validated settings.
pub fn create_capturer(settings: &ConnectionSettings) -> Result<CaptureHandle, CaptureError> {
    if settings.no_video {
        info!("Video capture disabled, no capture backend constructed");
        return Ok(None);
    }

    let backend = select_backend(settings.use_native)?;
    let request = CaptureRequest::from_settings(settings);
    let capture = open_backend(backend, &request)?;

    let format = capture.format();
    info!(
        "Capture backend {} on {:?} ({}): {}x{} {} @ {} fps",
        capture.backend().as_str(),
        capture.device(),
        capture.card(),
        format.size.width,
        format.size.height,
        format.fourcc,
        format.framerate
    );

    Ok(Some(Arc::new(capture)))
}

#[cfg(target_os = "linux")]
fn open_backend(backend: BackendKind, request: &CaptureRequest) -> Result<VideoCapture, CaptureError> {
    let path = v4l2::find_device(request.device.as_deref())?;
    match backend {
        BackendKind::V4l2 => {
            v4l2::V4l2Capture::open(&path, request, v4l2::FormatClass::Raw).map(VideoCapture::V4l2)
        }
        #[cfg(feature = "native-capture")]
        BackendKind::Native => {
            v4l2::V4l2Capture::open(&path, request, v4l2::FormatClass::Compressed)
                .map(VideoCapture::Native)
        }
        #[cfg(not(feature = "native-capture"))]
        BackendKind::Native => Err(CaptureError::NoBackend),
    }
}

#[cfg(not(target_os = "linux"))]
fn open_backend(_backend: BackendKind, _request: &CaptureRequest) -> Result<VideoCapture, CaptureError> {
    Err(CaptureError::NoBackend)
}

/// Map an `open(2)` failure on a device node to a capture error
pub(crate) fn open_error(path: &Path, err: std::io::Error) -> CaptureError {
    let device = path.display().to_string();
    match err.kind() {
        std::io::ErrorKind::NotFound => CaptureError::DeviceMissing(device),
        _ if err.raw_os_error() == Some(libc::EBUSY) => CaptureError::DeviceBusy(device),
        _ => CaptureError::Io { device, source: err },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_video_constructs_nothing() {
        let settings = ConnectionSettings {
            no_video: true,
            video_device: Some("/definitely/not/a/device".to_string()),
            ..Default::default()
        };
        let handle = create_capturer(&settings).unwrap();
        assert!(handle.is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn missing_device_is_fatal() {
        let settings = ConnectionSettings {
            video_device: Some("/definitely/not/a/video9".to_string()),
            ..Default::default()
        };
        match create_capturer(&settings) {
            Err(CaptureError::DeviceMissing(device)) => {
                assert_eq!(device, "/definitely/not/a/video9");
            }
            other => panic!("expected DeviceMissing, got {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn backend_selection_follows_features() {
        assert_eq!(select_backend(false).unwrap(), BackendKind::V4l2);
        let expected = if cfg!(feature = "native-capture") {
            BackendKind::Native
        } else {
            BackendKind::V4l2
        };
        assert_eq!(select_backend(true).unwrap(), expected);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn no_backend_off_linux() {
        assert!(matches!(select_backend(false), Err(CaptureError::NoBackend)));
    }

    #[test]
    fn open_error_mapping() {
        let path = Path::new("/dev/video7");
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(open_error(path, missing), CaptureError::DeviceMissing(_)));

        let busy = std::io::Error::from_raw_os_error(libc::EBUSY);
        assert!(matches!(open_error(path, busy), CaptureError::DeviceBusy(_)));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(open_error(path, denied), CaptureError::Io { .. }));
    }
}
