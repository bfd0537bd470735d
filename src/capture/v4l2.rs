//! V4L2 capture devices
//!
//! Opens a `/dev/video*` node, checks it is a streaming capture device and
//! that the requested frame size is offered. Frame delivery itself is owned by
//! the media pipeline; this handle keeps the device open for it.

use super::{open_error, CaptureError, CaptureFormat, CaptureRequest};
use crate::config::Size;
use log::debug;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use v4l::capability::Flags;
use v4l::format::description::Flags as FormatFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Preferred uncompressed formats, best first
const RAW: &[[u8; 4]] = &[*b"YUYV", *b"YU12", *b"NV12", *b"UYVY"];
/// Preferred compressed formats, best first
const COMPRESSED: &[[u8; 4]] = &[*b"H264", *b"MJPG"];

/// Which kind of pixel format the caller will accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    Raw,
    Compressed,
}

impl FormatClass {
    fn as_str(&self) -> &'static str {
        match self {
            FormatClass::Raw => "raw",
            FormatClass::Compressed => "compressed",
        }
    }

    /// Formats in preference order
    fn preferred(&self) -> &'static [[u8; 4]] {
        match self {
            FormatClass::Raw => RAW,
            FormatClass::Compressed => COMPRESSED,
        }
    }
}

/// Frame sizes advertised for one pixel format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSizes {
    Discrete(Vec<Size>),
    Stepwise { min: Size, max: Size, step: Size },
}

impl FrameSizes {
    pub fn supports(&self, size: Size) -> bool {
        match self {
            FrameSizes::Discrete(sizes) => sizes.contains(&size),
            FrameSizes::Stepwise { min, max, step } => {
                let fits = |v: u32, lo: u32, hi: u32, st: u32| {
                    v >= lo && v <= hi && (st <= 1 || (v - lo) % st == 0)
                };
                fits(size.width, min.width, max.width, step.width)
                    && fits(size.height, min.height, max.height, step.height)
            }
        }
    }
}

/// Pixel format offered by a device
#[derive(Debug, Clone)]
pub struct PixelFormat {
    pub fourcc: u32,
    pub compressed: bool,
    pub sizes: FrameSizes,
}

/// Opened V4L2 capture device
pub struct V4l2Capture {
    // Held open for the media pipeline
    _device: Device,
    path: PathBuf,
    card: String,
    format: CaptureFormat,
}

impl fmt::Debug for V4l2Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4l2Capture")
            .field("path", &self.path)
            .field("card", &self.card)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl V4l2Capture {
    /// Open `path` and check it offers the requested size.
    pub fn open(path: &Path, request: &CaptureRequest, class: FormatClass) -> Result<Self, CaptureError> {
        let device = open_device(path)?;
        let name = path.display().to_string();

        let card = query_capture_card(&device)
            .map_err(|e| io_error(path, e))?
            .ok_or_else(|| CaptureError::NotCaptureDevice(name.clone()))?;

        let formats = enum_formats(&device).map_err(|e| io_error(path, e))?;
        let fourcc = choose_format(&formats, class, request.size).ok_or(
            CaptureError::UnsupportedResolution {
                device: name,
                width: request.size.width,
                height: request.size.height,
                class: class.as_str(),
            },
        )?;
        debug!("{:?}: {} format(s) offered, using {}", path, formats.len(), fourcc_to_string(fourcc));

        Ok(Self {
            _device: device,
            path: path.to_path_buf(),
            card,
            format: CaptureFormat {
                size: request.size,
                fourcc: fourcc_to_string(fourcc),
                framerate: request.framerate,
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn format(&self) -> &CaptureFormat {
        &self.format
    }
}

/// Resolve `--video-device`: a path is used as-is, anything else is matched
/// against card names; with nothing given the first capture device wins.
pub fn find_device(name: Option<&str>) -> Result<PathBuf, CaptureError> {
    if let Some(name) = name {
        if name.starts_with('/') {
            return Ok(PathBuf::from(name));
        }
    }

    for path in video_nodes(Path::new("/dev")) {
        let device = match open_device(&path) {
            Ok(device) => device,
            Err(e) => {
                debug!("Skipping {:?}: {}", path, e);
                continue;
            }
        };
        let card = match query_capture_card(&device) {
            Ok(Some(card)) => card,
            _ => continue,
        };
        match name {
            Some(wanted) if wanted != card => continue,
            _ => return Ok(path),
        }
    }

    Err(CaptureError::DeviceMissing(
        name.unwrap_or("/dev/video*").to_string(),
    ))
}

/// `/dev/videoN` nodes sorted by N
fn video_nodes(dir: &Path) -> Vec<PathBuf> {
    let mut nodes: Vec<(u32, PathBuf)> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().to_string();
                    let index = name.strip_prefix("video")?.parse::<u32>().ok()?;
                    Some((index, e.path()))
                })
                .collect()
        })
        .unwrap_or_default();
    nodes.sort_by_key(|(index, _)| *index);
    nodes.into_iter().map(|(_, path)| path).collect()
}

fn open_device(path: &Path) -> Result<Device, CaptureError> {
    Device::with_path(path).map_err(|e| open_error(path, e))
}

fn io_error(path: &Path, err: io::Error) -> CaptureError {
    if err.raw_os_error() == Some(libc::EBUSY) {
        return CaptureError::DeviceBusy(path.display().to_string());
    }
    CaptureError::Io {
        device: path.display().to_string(),
        source: err,
    }
}

/// Card name if the node can stream captured video
fn query_capture_card(device: &Device) -> io::Result<Option<String>> {
    let caps = device.query_caps()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
        return Ok(None);
    }
    Ok(Some(caps.card.trim().to_string()))
}

fn enum_formats(device: &Device) -> io::Result<Vec<PixelFormat>> {
    device
        .enum_formats()?
        .into_iter()
        .map(|desc| {
            Ok(PixelFormat {
                fourcc: u32::from_le_bytes(desc.fourcc.repr),
                compressed: desc.flags.contains(FormatFlags::COMPRESSED),
                sizes: enum_frame_sizes(device, desc.fourcc)?,
            })
        })
        .collect()
}

fn enum_frame_sizes(device: &Device, fourcc: FourCC) -> io::Result<FrameSizes> {
    let mut discrete = Vec::new();
    for frame_size in device.enum_framesizes(fourcc)? {
        match frame_size.size {
            FrameSizeEnum::Discrete(d) => discrete.push(Size {
                width: d.width,
                height: d.height,
            }),
            FrameSizeEnum::Stepwise(s) => return Ok(stepwise(&s)),
        }
    }
    Ok(FrameSizes::Discrete(discrete))
}

fn stepwise(s: &v4l::framesize::Stepwise) -> FrameSizes {
    FrameSizes::Stepwise {
        min: Size { width: s.min_width, height: s.min_height },
        max: Size { width: s.max_width, height: s.max_height },
        step: Size { width: s.step_width, height: s.step_height },
    }
}

/// Best format of `class` offering `size`; preferred fourccs first.
pub fn choose_format(formats: &[PixelFormat], class: FormatClass, size: Size) -> Option<u32> {
    let wanted_compressed = class == FormatClass::Compressed;
    let candidates: Vec<&PixelFormat> = formats
        .iter()
        .filter(|f| f.compressed == wanted_compressed && f.sizes.supports(size))
        .collect();

    for preferred in class.preferred() {
        let fourcc = u32::from_le_bytes(*preferred);
        if candidates.iter().any(|f| f.fourcc == fourcc) {
            return Some(fourcc);
        }
    }
    match class {
        FormatClass::Raw => candidates.first().map(|f| f.fourcc),
        FormatClass::Compressed => None,
    }
}

pub fn fourcc_to_string(fourcc: u32) -> String {
    fourcc
        .to_le_bytes()
        .iter()
        .map(|b| if b.is_ascii_graphic() { *b as char } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fourcc(code: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*code)
    }

    fn vga() -> Size {
        Size { width: 640, height: 480 }
    }

    #[test]
    fn preference_tables_are_static() {
        assert_eq!(FormatClass::Raw.preferred()[0], *b"YUYV");
        assert_eq!(FormatClass::Compressed.preferred(), &[*b"H264", *b"MJPG"]);
    }

    #[test]
    fn stepwise_from_device_ranges() {
        let range = v4l::framesize::Stepwise {
            min_width: 320,
            max_width: 1280,
            step_width: 8,
            min_height: 240,
            max_height: 720,
            step_height: 8,
        };
        let sizes = stepwise(&range);
        assert!(sizes.supports(vga()));
        assert!(!sizes.supports(Size { width: 1920, height: 1080 }));
    }

    #[test]
    fn missing_node_is_reported_as_missing() {
        let request = CaptureRequest {
            device: None,
            size: vga(),
            framerate: 30,
        };
        let result = V4l2Capture::open(Path::new("/dev/definitely-not-video"), &request, FormatClass::Raw);
        assert!(matches!(result, Err(CaptureError::DeviceMissing(_))));
    }

    #[test]
    fn regular_file_is_not_a_capture_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let request = CaptureRequest {
            device: None,
            size: vga(),
            framerate: 30,
        };
        let result = V4l2Capture::open(file.path(), &request, FormatClass::Raw);
        assert!(result.is_err());
    }

    #[test]
    fn stepwise_sizes() {
        let sizes = FrameSizes::Stepwise {
            min: Size { width: 160, height: 120 },
            max: Size { width: 1920, height: 1080 },
            step: Size { width: 16, height: 8 },
        };
        assert!(sizes.supports(vga()));
        assert!(!sizes.supports(Size { width: 650, height: 480 }));
        assert!(!sizes.supports(Size { width: 3840, height: 2160 }));
    }

    #[test]
    fn raw_format_preference() {
        let formats = vec![
            PixelFormat {
                fourcc: fourcc(b"MJPG"),
                compressed: true,
                sizes: FrameSizes::Discrete(vec![vga()]),
            },
            PixelFormat {
                fourcc: fourcc(b"RGB3"),
                compressed: false,
                sizes: FrameSizes::Discrete(vec![vga()]),
            },
            PixelFormat {
                fourcc: fourcc(b"YUYV"),
                compressed: false,
                sizes: FrameSizes::Discrete(vec![vga()]),
            },
        ];
        assert_eq!(choose_format(&formats, FormatClass::Raw, vga()), Some(fourcc(b"YUYV")));
        assert_eq!(
            choose_format(&formats, FormatClass::Compressed, vga()),
            Some(fourcc(b"MJPG"))
        );
        let fhd = Size { width: 1920, height: 1080 };
        assert_eq!(choose_format(&formats, FormatClass::Raw, fhd), None);
    }

    #[test]
    fn fourcc_rendering() {
        assert_eq!(fourcc_to_string(fourcc(b"YUYV")), "YUYV");
        assert_eq!(fourcc_to_string(0x0000_0001), "????");
    }

    #[test]
    fn explicit_path_is_used_verbatim() {
        let path = find_device(Some("/dev/video42")).unwrap();
        assert_eq!(path, PathBuf::from("/dev/video42"));
    }

    #[test]
    fn video_nodes_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["video10", "video2", "videoX", "audio0", "video0"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let nodes: Vec<String> = video_nodes(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(nodes, vec!["video0", "video2", "video10"]);
    }
}
