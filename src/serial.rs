//! Serial device relayed over the WebRTC data channel
//!
//! The device is opened through `serialport` at startup, 8N1 without flow
//! control, so a bad path or rate fails before anything runs. Device reads
//! block with a short timeout on the blocking pool; peer writes are handed to
//! the pool one message at a time.

use crate::config::{SerialSettings, SERIAL_RATES};
use crate::rtc::DataRelay;
use bytes::Bytes;
use log::{debug, info, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPortBuilder, StopBits, TTYPort};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How often a blocked device read wakes to check for a stop
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("failed to open {device:?}: {source}")]
    Open {
        device: PathBuf,
        #[source]
        source: serialport::Error,
    },

    #[error("failed to configure {device:?}: {source}")]
    Configure {
        device: PathBuf,
        #[source]
        source: serialport::Error,
    },

    #[error("unsupported baud rate {0}")]
    Rate(u32),

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SerialError {
    /// Sort a `serialport` failure into "could not open" and "could not set up"
    fn from_port(device: PathBuf, source: serialport::Error) -> Self {
        match source.kind() {
            serialport::ErrorKind::NoDevice
            | serialport::ErrorKind::Io(io::ErrorKind::NotFound)
            | serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                SerialError::Open { device, source }
            }
            _ => SerialError::Configure { device, source },
        }
    }
}

fn builder(settings: &SerialSettings) -> Result<SerialPortBuilder, SerialError> {
    if !SERIAL_RATES.contains(&settings.rate) {
        return Err(SerialError::Rate(settings.rate));
    }
    Ok(serialport::new(settings.device.to_string_lossy(), settings.rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT))
}

/// An opened, raw-mode serial device
pub struct SerialPort {
    device: PathBuf,
    port: TTYPort,
}

impl SerialPort {
    pub fn open(settings: &SerialSettings) -> Result<Self, SerialError> {
        let device = settings.device.clone();
        let builder = builder(settings)?;
        if !device.exists() {
            let source = serialport::Error::new(serialport::ErrorKind::NoDevice, "no such device");
            return Err(SerialError::Open { device, source });
        }
        let port = builder
            .open_native()
            .map_err(|e| SerialError::from_port(device.clone(), e))?;

        info!("Serial device {:?} opened at {} baud", device, settings.rate);
        Ok(Self { device, port })
    }

    /// Shuttle bytes between the device and the data channels until stopped
    pub async fn relay(self, relay: DataRelay, stop: CancellationToken) -> Result<(), SerialError> {
        let Self { device, port } = self;
        let mut writer = port
            .try_clone_native()
            .map_err(|e| SerialError::from_port(device.clone(), e))?;

        let reader = tokio::task::spawn_blocking({
            let relay = relay.clone();
            let stop = stop.clone();
            let device = device.clone();
            move || read_loop(port, &relay, &stop, &device)
        });
        let mut inbound = relay.subscribe_from_peers();

        let result = loop {
            let data = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                message = inbound.recv() => match message {
                    Ok(data) => data,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Serial relay dropped {} peer messages", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
            };
            let written = tokio::task::spawn_blocking(move || {
                writer.write_all(&data)?;
                writer.flush()?;
                Ok::<_, io::Error>(writer)
            })
            .await
            .map_err(io::Error::other)?;
            match written {
                Ok(port) => writer = port,
                Err(e) => break Err(SerialError::Io(e)),
            }
        };

        stop.cancel();
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Serial read on {:?} failed: {}", device, e),
            Err(e) => warn!("Serial reader for {:?} panicked: {}", device, e),
        }
        debug!("Serial relay for {:?} stopped", device);
        result
    }
}

fn read_loop(
    mut port: TTYPort,
    relay: &DataRelay,
    stop: &CancellationToken,
    device: &Path,
) -> io::Result<()> {
    let mut buf = [0u8; 1024];
    while !stop.is_cancelled() {
        match port.read(&mut buf) {
            Ok(0) => {
                info!("Serial device {:?} closed", device);
                break;
            }
            Ok(n) => {
                relay.send_to_peers(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::fs::File;
    use std::os::unix::io::FromRawFd;

    /// Master side and slave path of a fresh pseudo-terminal
    fn open_pty() -> (File, PathBuf) {
        unsafe {
            let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(master >= 0);
            assert_eq!(libc::grantpt(master), 0);
            assert_eq!(libc::unlockpt(master), 0);
            let name = libc::ptsname(master);
            assert!(!name.is_null());
            let path = PathBuf::from(CStr::from_ptr(name).to_string_lossy().into_owned());
            (File::from_raw_fd(master), path)
        }
    }

    #[test]
    fn unsupported_rate_is_rejected_before_open() {
        let settings = SerialSettings {
            device: PathBuf::from("/dev/definitely-not-a-tty"),
            rate: 9601,
        };
        assert!(matches!(SerialPort::open(&settings), Err(SerialError::Rate(9601))));
    }

    #[test]
    fn missing_device_fails_to_open() {
        let settings = SerialSettings {
            device: PathBuf::from("/dev/definitely-not-a-tty"),
            rate: 9600,
        };
        assert!(matches!(SerialPort::open(&settings), Err(SerialError::Open { .. })));
    }

    #[test]
    fn regular_file_is_not_a_serial_port() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let settings = SerialSettings {
            device: file.path().to_path_buf(),
            rate: 9600,
        };
        assert!(matches!(
            SerialPort::open(&settings),
            Err(SerialError::Open { .. } | SerialError::Configure { .. })
        ));
    }

    #[test]
    fn port_errors_are_classified() {
        let device = PathBuf::from("/dev/ttyX");
        let missing = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            SerialError::from_port(device.clone(), missing),
            SerialError::Open { .. }
        ));

        let invalid = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad rate");
        assert!(matches!(
            SerialError::from_port(device, invalid),
            SerialError::Configure { .. }
        ));
    }

    #[tokio::test]
    async fn peer_bytes_reach_the_device() {
        let (mut master, slave) = open_pty();
        let port = SerialPort::open(&SerialSettings { device: slave, rate: 115200 }).unwrap();

        let relay = DataRelay::new();
        let stop = CancellationToken::new();
        let task = tokio::spawn(port.relay(relay.clone(), stop.clone()));

        // Let the relay subscribe before sending.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.peer_message(Bytes::from_static(b"hello")), 1);

        let read = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 5];
            master.read_exact(&mut buf).map(|_| buf)
        });
        let buf = tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
