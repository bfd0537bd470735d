//! Data-channel relay between peers and the serial device

use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

const RELAY_CAPACITY: usize = 256;

/// Label of the channel an offering side creates
pub const SERIAL_CHANNEL: &str = "serial";

/// Fans peer messages out to local consumers and local output to every
/// open data channel
#[derive(Clone)]
pub struct DataRelay {
    from_peers: broadcast::Sender<Bytes>,
    to_peers: broadcast::Sender<Bytes>,
}

impl Default for DataRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl DataRelay {
    pub fn new() -> Self {
        let (from_peers, _) = broadcast::channel(RELAY_CAPACITY);
        let (to_peers, _) = broadcast::channel(RELAY_CAPACITY);
        Self { from_peers, to_peers }
    }

    /// Messages arriving from any peer
    pub fn subscribe_from_peers(&self) -> broadcast::Receiver<Bytes> {
        self.from_peers.subscribe()
    }

    /// Send to every attached channel; returns how many channels are listening
    pub fn send_to_peers(&self, data: Bytes) -> usize {
        self.to_peers.send(data).unwrap_or(0)
    }

    /// Hand a message from a peer to local consumers
    pub fn peer_message(&self, data: Bytes) -> usize {
        self.from_peers.send(data).unwrap_or(0)
    }

    pub fn attached_channels(&self) -> usize {
        self.to_peers.receiver_count()
    }

    /// Wire a data channel into the relay in both directions
    pub fn attach(&self, channel: Arc<RTCDataChannel>) {
        let label = channel.label().to_string();
        info!("Data channel {} attached", label);

        let relay = self.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let relay = relay.clone();
            Box::pin(async move {
                relay.peer_message(msg.data);
            })
        }));

        let mut outbound = self.to_peers.subscribe();
        let forward = channel.clone();
        tokio::spawn(async move {
            loop {
                match outbound.recv().await {
                    Ok(data) => match forward.ready_state() {
                        RTCDataChannelState::Open => {
                            if let Err(e) = forward.send(&data).await {
                                warn!("Data channel {} send failed: {}", forward.label(), e);
                            }
                        }
                        RTCDataChannelState::Closing | RTCDataChannelState::Closed => break,
                        _ => debug!("Data channel {} not open, dropped {} bytes", forward.label(), data.len()),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Data channel {} lagged by {} messages", forward.label(), n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        channel.on_close(Box::new(move || {
            let label = label.clone();
            Box::pin(async move {
                info!("Data channel {} closed", label);
            })
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_messages_reach_subscribers() {
        let relay = DataRelay::new();
        let mut rx = relay.subscribe_from_peers();

        assert_eq!(relay.peer_message(Bytes::from_static(b"AT\r\n")), 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"AT\r\n"));
    }

    #[test]
    fn sending_without_channels_is_a_no_op() {
        let relay = DataRelay::new();
        assert_eq!(relay.attached_channels(), 0);
        assert_eq!(relay.send_to_peers(Bytes::from_static(b"x")), 0);
        assert_eq!(relay.peer_message(Bytes::from_static(b"y")), 0);
    }
}
