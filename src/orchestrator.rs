//! Startup and teardown of one run
//!
//! Construction order: event loop and signal hook, capture, render sink,
//! media session manager, serial relay, signaling servers. Anything fatal
//! fails before the loop runs. Teardown is enforced by scopes: the dispatch
//! registration goes first, then the loop with every task it still holds,
//! then the render sink, then the manager and the capture source it owns.

use crate::capture;
use crate::config::{ConnectionSettings, FileConfig};
use crate::error::{AppError, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::render::RenderSink;
use crate::rtc::RtcManager;
use crate::serial::SerialPort;
use crate::signaling::ServerSet;
use log::{error, info, warn};
use std::sync::Arc;

pub fn run(settings: &ConnectionSettings, file: &FileConfig) -> Result<()> {
    run_with(settings, file, |_| {})
}

/// Like `run`, calling `on_ready` with the loop handle just before the loop
/// starts
pub fn run_with<F>(settings: &ConnectionSettings, file: &FileConfig, on_ready: F) -> Result<()>
where
    F: FnOnce(&LoopHandle),
{
    let event_loop = EventLoop::new().map_err(AppError::EventLoop)?;
    event_loop
        .install_signal_handlers()
        .map_err(AppError::EventLoop)?;
    let lp = event_loop.handle();

    let capture = capture::create_capturer(settings)?;

    let render = settings
        .render
        .map(RenderSink::spawn)
        .transpose()
        .map_err(AppError::Render)?;

    let manager = Arc::new(RtcManager::new(
        settings,
        capture,
        render.as_ref().map(RenderSink::handle),
    )?);

    if let Some(serial) = &settings.serial {
        let port = SerialPort::open(serial)?;
        let relay = manager.data().clone();
        let stop = lp.stop_token();
        lp.spawn(async move {
            if let Err(e) = port.relay(relay, stop).await {
                error!("Serial relay failed: {}", e);
            }
        });
    }

    let servers = ServerSet::from_settings(settings, file, &manager);
    info!("Signaling servers: {:?}", servers.names());
    servers.spawn_all(&lp);

    {
        let _registration = render.as_ref().map(|sink| sink.register_dispatch(lp.clone()));
        on_ready(&lp);
        event_loop.run();
    }

    drop(event_loop);

    if let Some(sink) = render {
        if let Some(surface) = sink.finish() {
            info!("Render sink closed with {} track(s) on screen", surface.tracks.len());
        }
    }

    match Arc::try_unwrap(manager) {
        Ok(manager) => drop(manager),
        Err(manager) => warn!(
            "Media session manager still has {} other reference(s) at shutdown",
            Arc::strong_count(&manager) - 1
        ),
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{P2pSettings, RenderSettings};
    use std::time::Duration;

    fn p2p_only(root: &std::path::Path) -> ConnectionSettings {
        ConnectionSettings {
            no_video: true,
            no_audio: true,
            p2p: Some(P2pSettings {
                port: 0,
                document_root: Some(root.to_path_buf()),
            }),
            ..Default::default()
        }
    }

    fn stop_later(lp: &LoopHandle) {
        let lp = lp.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            lp.stop();
        });
    }

    #[test]
    fn runs_until_stopped_without_capture() {
        let root = tempfile::tempdir().unwrap();
        let settings = p2p_only(root.path());
        let mut services = 0;

        run_with(&settings, &FileConfig::default(), |lp| {
            services = lp.services();
            stop_later(lp);
        })
        .unwrap();
        assert_eq!(services, 1);
    }

    #[test]
    fn render_sink_is_torn_down_after_the_loop() {
        let root = tempfile::tempdir().unwrap();
        let settings = ConnectionSettings {
            render: Some(RenderSettings {
                width: 640,
                height: 480,
                fullscreen: false,
            }),
            ..p2p_only(root.path())
        };

        run_with(&settings, &FileConfig::default(), stop_later).unwrap();
    }

    #[test]
    fn missing_capture_device_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let settings = ConnectionSettings {
            no_video: false,
            video_device: Some("/dev/definitely-not-a-camera".to_string()),
            ..p2p_only(root.path())
        };

        let mut started = false;
        let result = run_with(&settings, &FileConfig::default(), |_| started = true);
        assert!(matches!(result, Err(AppError::Capture(_))));
        assert!(!started);
    }

    #[test]
    fn missing_serial_device_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let settings = ConnectionSettings {
            serial: Some(crate::config::SerialSettings {
                device: "/dev/definitely-not-a-tty".into(),
                rate: 9600,
            }),
            ..p2p_only(root.path())
        };

        let result = run_with(&settings, &FileConfig::default(), |_| {});
        assert!(matches!(result, Err(AppError::Serial(_))));
    }
}
