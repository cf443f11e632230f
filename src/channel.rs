//! Live media channel handle
//!
//! A movie restreamed through this process gets one `Channel`. The publisher
//! pushes media frames into it and every viewer subscribes to a broadcast
//! receiver. Frames are `bytes::Bytes`, so fan-out only bumps a reference
//! count. Closing the channel drops the sender and ends every receiver.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::SendError;

/// Frames buffered per subscriber before it starts lagging
const CHANNEL_CAPACITY: usize = 1024;

/// Media fan-out handle for one movie
#[derive(Debug)]
pub struct Channel {
    name: String,
    tx: Mutex<Option<broadcast::Sender<Bytes>>>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sender(&self) -> MutexGuard<'_, Option<broadcast::Sender<Bytes>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a frame to every subscriber; returns how many received it
    pub fn publish(&self, frame: Bytes) -> Result<usize, SendError> {
        match self.sender().as_ref() {
            // No subscribers is not an error for a live source
            Some(tx) => Ok(tx.send(frame).unwrap_or(0)),
            None => Err(SendError::ChannelClosed),
        }
    }

    /// Receive frames published from now on
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Bytes>, SendError> {
        self.sender()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(SendError::ChannelClosed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Stop the channel; subscribers drain what is buffered and then end
    pub fn close(&self) {
        if self.sender().take().is_some() {
            debug!(channel = %self.name, "Channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let channel = Channel::new("movie-1");
        let mut rx = channel.subscribe().unwrap();
        assert_eq!(channel.subscriber_count(), 1);

        let delivered = channel.publish(Bytes::from_static(b"frame")).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"frame"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let channel = Channel::new("movie-1");
        assert_eq!(channel.publish(Bytes::from_static(b"frame")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_subscribers() {
        let channel = Channel::new("movie-1");
        let mut rx = channel.subscribe().unwrap();

        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(
            channel.publish(Bytes::from_static(b"late")),
            Err(SendError::ChannelClosed)
        );
        assert!(channel.subscribe().is_err());

        // Closing twice is a no-op
        channel.close();
    }
}
