use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::{
    AudioCodec, AyameSettings, ConnectionSettings, HardwareEncoder, P2pSettings, Priority, RenderSettings,
    Resolution, SerialSettings, SoraSettings, VideoCodec,
};

#[derive(Parser, Debug)]
#[command(name = "rtc-native")]
#[command(author = "rtc-native contributors")]
#[command(about = "WebRTC Native Client", long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Print build identification and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub version: bool,

    /// Do not capture or send video
    #[arg(long, action)]
    pub no_video: bool,

    /// Do not send audio
    #[arg(long, action)]
    pub no_audio: bool,

    /// Video codec
    #[arg(long, value_enum, default_value_t = VideoCodec::VP8)]
    pub video_codec: VideoCodec,

    /// Audio codec
    #[arg(long, value_enum, default_value_t = AudioCodec::Opus)]
    pub audio_codec: AudioCodec,

    /// Video bitrate in kbps
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=30000))]
    pub video_bitrate: Option<u32>,

    /// Audio bitrate in kbps
    #[arg(long, value_parser = clap::value_parser!(u32).range(6..=510))]
    pub audio_bitrate: Option<u32>,

    /// Capture resolution
    #[arg(long, value_enum, default_value_t = Resolution::Vga)]
    pub resolution: Resolution,

    /// Capture framerate
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..=60))]
    pub framerate: u32,

    /// What to give up first under bandwidth pressure (experimental)
    #[arg(long, value_enum, default_value_t = Priority::Balance)]
    pub priority: Priority,

    /// Detach from the terminal after startup
    #[arg(long, action)]
    pub daemon: bool,

    /// Console log severity: 0 sensitive, 1 verbose, 2 info, 3 warning, 4 error, 5 none
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub log_level: u8,

    /// JSON passed to signaling servers
    #[arg(long, hide = true, value_parser = parse_json)]
    pub metadata: Option<serde_json::Value>,

    /// Capture device path or card name
    #[arg(long)]
    pub video_device: Option<String>,

    /// Prefer the hardware-native capture path
    #[arg(long, action)]
    pub use_native: bool,

    /// Relay a serial device over the data channel (DEVICE,RATE)
    #[arg(long, value_name = "DEVICE,RATE")]
    pub serial: Option<SerialSettings>,

    /// Show remote video in a local window
    #[arg(long, action)]
    pub use_sdl: bool,

    /// Render window width
    #[arg(long, default_value_t = 640, value_parser = clap::value_parser!(u32).range(180..=16384))]
    pub window_width: u32,

    /// Render window height
    #[arg(long, default_value_t = 480, value_parser = clap::value_parser!(u32).range(180..=16384))]
    pub window_height: u32,

    /// Render window fullscreen
    #[arg(long, action)]
    pub fullscreen: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "rtc-native.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub mode: Option<Mode>,
}

/// Signaling modes; several may be given in one invocation
#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Serve the web client and negotiate with browsers directly
    P2p {
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Static file root (defaults to the config file value)
        #[arg(long)]
        document_root: Option<PathBuf>,
    },

    /// Connect to a Sora SFU
    Sora {
        /// Signaling URL, e.g. wss://example.com/signaling
        signaling_url: String,

        /// Channel to join
        channel_id: String,

        /// Connect at startup and reconnect after a drop
        #[arg(long, action)]
        auto: bool,

        /// Local control port for POST /connect (0 = ephemeral)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Join a room on an Ayame signaling server
    Ayame {
        /// Signaling URL, e.g. wss://example.com/signaling
        signaling_url: String,

        /// Room to join
        room_id: String,

        /// Client id; random when omitted
        #[arg(long)]
        client_id: Option<String>,

        /// Signaling key
        #[arg(long)]
        signaling_key: Option<String>,
    },
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::P2p { .. } => "p2p",
            Mode::Sora { .. } => "sora",
            Mode::Ayame { .. } => "ayame",
        }
    }
}

/// Parser for every mode after the first
#[derive(Parser, Debug)]
#[command(name = "rtc-native")]
#[command(disable_version_flag = true)]
struct ModeCli {
    #[command(subcommand)]
    mode: Mode,
}

/// What `main` should do
#[derive(Debug)]
pub enum Launch {
    Version,
    /// No mode selected: print this and exit 1
    Help(String),
    Run(Box<Startup>),
}

#[derive(Debug)]
pub struct Startup {
    pub settings: ConnectionSettings,
    pub config_path: PathBuf,
    pub log_level: u8,
    pub daemon: bool,
}

pub fn version_string() -> String {
    let version = option_env!("RTC_NATIVE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let hw = HardwareEncoder::compiled().is_hardware();
    format!(
        "WebRTC Native Client rtc-native version {} USE_HW_ENCODER={}",
        version,
        u8::from(hw)
    )
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|_| format!("Value {} is not JSON Value", s))
}

/// Parse the full argument vector, program name included
pub fn parse<I, T>(args: I) -> Result<Launch, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let prog = args.first().cloned().unwrap_or_else(|| OsString::from("rtc-native"));
    let rest = args.get(1..).unwrap_or_default();

    // --version wins over everything else, including invalid values.
    if rest.iter().any(|a| a == "--version") {
        return Ok(Launch::Version);
    }

    let (top, chunks) = split_modes(rest);
    let mut chunks = chunks.into_iter();

    let mut first = vec![prog.clone()];
    first.extend(top);
    if let Some(chunk) = chunks.next() {
        first.extend(chunk);
    }
    let cli = Cli::try_parse_from(first)?;

    let Some(first_mode) = cli.mode.clone() else {
        return Ok(Launch::Help(Cli::command().render_help().to_string()));
    };

    let mut modes = vec![first_mode];
    for chunk in chunks {
        let mut argv = vec![prog.clone()];
        argv.extend(chunk);
        modes.push(ModeCli::try_parse_from(argv)?.mode);
    }

    let mut seen = HashSet::new();
    for mode in &modes {
        if !seen.insert(mode.name()) {
            return Err(Cli::command().error(
                clap::error::ErrorKind::ArgumentConflict,
                format!("subcommand '{}' given more than once", mode.name()),
            ));
        }
    }

    Ok(Launch::Run(Box::new(cli.into_startup(modes))))
}

impl Cli {
    fn into_startup(self, modes: Vec<Mode>) -> Startup {
        let mut settings = ConnectionSettings {
            no_video: self.no_video,
            no_audio: self.no_audio,
            video_codec: self.video_codec,
            audio_codec: self.audio_codec,
            video_bitrate: self.video_bitrate,
            audio_bitrate: self.audio_bitrate,
            resolution: self.resolution,
            framerate: self.framerate,
            priority: self.priority,
            metadata: self.metadata,
            video_device: self.video_device,
            use_native: self.use_native,
            serial: self.serial,
            render: self.use_sdl.then_some(RenderSettings {
                width: self.window_width,
                height: self.window_height,
                fullscreen: self.fullscreen,
            }),
            ..Default::default()
        };

        for mode in modes {
            match mode {
                Mode::P2p { port, document_root } => {
                    settings.p2p = Some(P2pSettings { port, document_root });
                }
                Mode::Sora {
                    signaling_url,
                    channel_id,
                    auto,
                    port,
                } => {
                    settings.sora = Some(SoraSettings {
                        signaling_url,
                        channel_id,
                        auto_connect: auto,
                        port,
                    });
                }
                Mode::Ayame {
                    signaling_url,
                    room_id,
                    client_id,
                    signaling_key,
                } => {
                    settings.ayame = Some(AyameSettings {
                        signaling_url,
                        room_id,
                        client_id: client_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        signaling_key,
                    });
                }
            }
        }

        Startup {
            settings,
            config_path: self.config,
            log_level: self.log_level,
            daemon: self.daemon,
        }
    }
}

/// Option spellings of `cmd` that consume the following token
fn value_flags(cmd: &clap::Command) -> HashSet<String> {
    let mut flags = HashSet::new();
    for arg in cmd.get_arguments() {
        if arg.is_positional() || !arg.get_action().takes_values() {
            continue;
        }
        if let Some(long) = arg.get_long() {
            flags.insert(format!("--{}", long));
        }
        if let Some(short) = arg.get_short() {
            flags.insert(format!("-{}", short));
        }
    }
    flags
}

/// Split everything after the program name into the top-level flags and one
/// chunk per mode, each chunk starting with the mode name. A mode name only
/// starts a chunk where it cannot be a flag value or a pending positional.
fn split_modes(args: &[OsString]) -> (Vec<OsString>, Vec<Vec<OsString>>) {
    let cmd = Cli::command();
    let top_flags = value_flags(&cmd);

    let mut top = Vec::new();
    let mut chunks: Vec<Vec<OsString>> = Vec::new();
    let mut mode_flags: Option<HashSet<String>> = None;
    let mut positionals_left = 0usize;
    let mut takes_value = false;

    for arg in args {
        let text = arg.to_string_lossy();

        if takes_value {
            takes_value = false;
            chunks.last_mut().unwrap_or(&mut top).push(arg.clone());
            continue;
        }

        if text.starts_with('-') && text.len() > 1 {
            let flags = mode_flags.as_ref().unwrap_or(&top_flags);
            takes_value = !text.contains('=') && flags.contains(&*text);
            chunks.last_mut().unwrap_or(&mut top).push(arg.clone());
            continue;
        }

        if positionals_left == 0 {
            if let Some(sub) = cmd.find_subcommand(&*text) {
                mode_flags = Some(value_flags(sub));
                positionals_left = sub.get_positionals().count();
                chunks.push(vec![arg.clone()]);
                continue;
            }
        }

        positionals_left = positionals_left.saturating_sub(1);
        chunks.last_mut().unwrap_or(&mut top).push(arg.clone());
    }

    (top, chunks)
}
