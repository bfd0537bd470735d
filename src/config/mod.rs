//! Configuration management for rtc-native
//!
//! `ConnectionSettings` is built once from the command line and is read-only
//! afterwards. `FileConfig` carries the few knobs that live in the optional
//! TOML file (log sink placement, P2P document root).

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Video codec negotiated with the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
pub enum VideoCodec {
    #[default]
    #[value(name = "VP8")]
    VP8,
    #[value(name = "VP9")]
    VP9,
    #[value(name = "H264")]
    H264,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
            VideoCodec::H264 => "H264",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "video/VP8",
            VideoCodec::VP9 => "video/VP9",
            VideoCodec::H264 => "video/H264",
        }
    }

    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            VideoCodec::VP8 => "",
            VideoCodec::VP9 => "profile-id=0",
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
        }
    }

    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            VideoCodec::VP8 => 96,
            VideoCodec::VP9 => 98,
            VideoCodec::H264 => 102,
        }
    }
}

/// Audio codec negotiated with the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
pub enum AudioCodec {
    #[default]
    #[value(name = "OPUS")]
    Opus,
    #[value(name = "PCMU")]
    Pcmu,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "OPUS",
            AudioCodec::Pcmu => "PCMU",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "audio/opus",
            AudioCodec::Pcmu => "audio/PCMU",
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            AudioCodec::Opus => 48_000,
            AudioCodec::Pcmu => 8_000,
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            AudioCodec::Opus => 2,
            AudioCodec::Pcmu => 1,
        }
    }

    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            AudioCodec::Opus => 111,
            AudioCodec::Pcmu => 0,
        }
    }
}

/// Capture resolution presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
pub enum Resolution {
    #[value(name = "QVGA")]
    Qvga,
    #[default]
    #[value(name = "VGA")]
    Vga,
    #[value(name = "HD")]
    Hd,
    #[value(name = "FHD")]
    Fhd,
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn size(&self) -> Size {
        let (width, height) = match self {
            Resolution::Qvga => (320, 240),
            Resolution::Vga => (640, 480),
            Resolution::Hd => (1280, 720),
            Resolution::Fhd => (1920, 1080),
        };
        Size { width, height }
    }
}

/// What the encoder gives up first when bandwidth is short (experimental)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
pub enum Priority {
    #[default]
    #[value(name = "BALANCE")]
    Balance,
    #[value(name = "FRAMERATE")]
    Framerate,
    #[value(name = "RESOLUTION")]
    Resolution,
}

/// Hardware encoder compiled into this build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareEncoder {
    Software,
    Vaapi,   // Intel VA-API
    Nvenc,   // NVIDIA NVENC
    Qsv,     // Intel Quick Sync
}

impl HardwareEncoder {
    /// Encoder selected at compile time; the first enabled feature wins.
    pub fn compiled() -> Self {
        if cfg!(feature = "vaapi") {
            HardwareEncoder::Vaapi
        } else if cfg!(feature = "nvenc") {
            HardwareEncoder::Nvenc
        } else if cfg!(feature = "qsv") {
            HardwareEncoder::Qsv
        } else {
            HardwareEncoder::Software
        }
    }

    pub fn is_hardware(&self) -> bool {
        *self != HardwareEncoder::Software
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareEncoder::Software => "software",
            HardwareEncoder::Vaapi => "vaapi",
            HardwareEncoder::Nvenc => "nvenc",
            HardwareEncoder::Qsv => "qsv",
        }
    }
}

/// Validated connection settings, immutable after parsing
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSettings {
    /// Skip video capture entirely
    pub no_video: bool,

    /// Do not send audio
    pub no_audio: bool,

    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,

    /// Video bitrate in kbps; `None` lets the encoder decide
    pub video_bitrate: Option<u32>,

    /// Audio bitrate in kbps; `None` lets the encoder decide
    pub audio_bitrate: Option<u32>,

    pub resolution: Resolution,
    pub framerate: u32,
    pub priority: Priority,

    /// Arbitrary JSON handed to signaling servers that support it
    pub metadata: Option<serde_json::Value>,

    /// Capture device path or card name
    pub video_device: Option<String>,

    /// Prefer the hardware-native capture path when one is compiled in
    pub use_native: bool,

    pub serial: Option<SerialSettings>,
    pub render: Option<RenderSettings>,

    pub p2p: Option<P2pSettings>,
    pub sora: Option<SoraSettings>,
    pub ayame: Option<AyameSettings>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            no_video: false,
            no_audio: false,
            video_codec: VideoCodec::default(),
            audio_codec: AudioCodec::default(),
            video_bitrate: None,
            audio_bitrate: None,
            resolution: Resolution::default(),
            framerate: 30,
            priority: Priority::default(),
            metadata: None,
            video_device: None,
            use_native: false,
            serial: None,
            render: None,
            p2p: None,
            sora: None,
            ayame: None,
        }
    }
}

impl ConnectionSettings {
    pub fn size(&self) -> Size {
        self.resolution.size()
    }

    /// True if at least one signaling mode was selected
    pub fn has_signaling(&self) -> bool {
        self.p2p.is_some() || self.sora.is_some() || self.ayame.is_some()
    }
}

/// Peer-to-peer mode
#[derive(Debug, Clone, Serialize)]
pub struct P2pSettings {
    /// Listen port on 0.0.0.0
    pub port: u16,

    /// Static file root; falls back to the config file value
    pub document_root: Option<PathBuf>,
}

/// Sora SFU mode
#[derive(Debug, Clone, Serialize)]
pub struct SoraSettings {
    pub signaling_url: String,
    pub channel_id: String,

    /// Connect at startup and reconnect after a drop
    pub auto_connect: bool,

    /// Local control port on 127.0.0.1; 0 binds an ephemeral port
    pub port: Option<u16>,
}

/// Ayame relay mode
#[derive(Debug, Clone, Serialize)]
pub struct AyameSettings {
    pub signaling_url: String,
    pub room_id: String,
    pub client_id: String,
    pub signaling_key: Option<String>,
}

/// Serial device relayed over the data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialSettings {
    pub device: PathBuf,
    pub rate: u32,
}

/// Baud rates accepted by `--serial`
pub const SERIAL_RATES: [u32; 13] = [
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 500000, 576000, 921600,
];

impl std::str::FromStr for SerialSettings {
    type Err = String;

    /// Parses `DEVICE,RATE`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, rate) = s
            .rsplit_once(',')
            .ok_or_else(|| format!("Value {} is not in DEVICE,RATE form", s))?;
        if device.is_empty() {
            return Err(format!("Value {} has an empty device", s));
        }
        let rate: u32 = rate
            .trim()
            .parse()
            .map_err(|_| format!("Value {} has a non-numeric rate", s))?;
        if !SERIAL_RATES.contains(&rate) {
            return Err(format!("Rate {} not in {:?}", rate, SERIAL_RATES));
        }
        Ok(SerialSettings {
            device: PathBuf::from(device),
            rate,
        })
    }
}

/// Local render window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

/// Settings read from the optional TOML file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub p2p: P2pFileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rotating log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,

    /// Base file name; files are `<prefix>_0` .. `<prefix>_<max_files - 1>`
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,

    /// Size cap per file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Number of files retained
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            file_prefix: default_log_prefix(),
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pFileConfig {
    /// Static file root for the P2P web client
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,
}

impl Default for P2pFileConfig {
    fn default() -> Self {
        Self {
            document_root: default_document_root(),
        }
    }
}

impl FileConfig {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(FileConfig::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.logging.file_prefix.is_empty() {
            return Err("Logging file_prefix must not be empty".into());
        }

        if self.logging.max_file_size == 0 {
            return Err("Logging max_file_size must be non-zero".into());
        }

        if self.logging.max_files == 0 {
            return Err("Logging max_files must be non-zero".into());
        }

        Ok(())
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./")
}

fn default_log_prefix() -> String {
    "webrtc_logs".to_string()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_files() -> usize {
    10
}

fn default_document_root() -> PathBuf {
    PathBuf::from("html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolution_sizes() {
        assert_eq!(Resolution::Qvga.size(), Size { width: 320, height: 240 });
        assert_eq!(Resolution::Vga.size(), Size { width: 640, height: 480 });
        assert_eq!(Resolution::Hd.size(), Size { width: 1280, height: 720 });
        assert_eq!(Resolution::Fhd.size(), Size { width: 1920, height: 1080 });
    }

    #[test]
    fn serial_settings_parse() {
        let serial: SerialSettings = "/dev/ttyUSB0,9600".parse().unwrap();
        assert_eq!(serial.device, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(serial.rate, 9600);

        assert!("/dev/ttyUSB0".parse::<SerialSettings>().is_err());
        assert!("/dev/ttyUSB0,fast".parse::<SerialSettings>().is_err());
        assert!("/dev/ttyUSB0,9601".parse::<SerialSettings>().is_err());
        assert!(",9600".parse::<SerialSettings>().is_err());
    }

    #[test]
    fn file_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FileConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.logging.file_prefix, "webrtc_logs");
        assert_eq!(cfg.logging.max_file_size, 10 * 1024 * 1024);
        assert_eq!(cfg.logging.max_files, 10);
        assert_eq!(cfg.p2p.document_root, PathBuf::from("html"));
    }

    #[test]
    fn file_config_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc-native.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[logging]\nmax_files = 3\n\n[p2p]\ndocument_root = \"/srv/www\"").unwrap();

        let cfg = FileConfig::load(&path).unwrap();
        assert_eq!(cfg.logging.max_files, 3);
        assert_eq!(cfg.logging.file_prefix, "webrtc_logs");
        assert_eq!(cfg.p2p.document_root, PathBuf::from("/srv/www"));
    }

    #[test]
    fn file_config_rejects_zero_retention() {
        let mut cfg = FileConfig::default();
        cfg.logging.max_files = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hardware_encoder_matches_features() {
        let hw = HardwareEncoder::compiled();
        let any = cfg!(any(feature = "vaapi", feature = "nvenc", feature = "qsv"));
        assert_eq!(hw.is_hardware(), any);
    }
}
