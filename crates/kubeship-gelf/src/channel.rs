use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("forwarding channel closed")]
    Closed,

    #[error("shutdown requested while waiting for channel capacity")]
    Cancelled,
}

/// Destination for messages produced by tail sessions
pub trait MessageForwarder: Send + Sync {
    /// Queue one serialized message, waiting while the destination is full
    fn push(
        &self,
        message: String,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send;
}

/// Producer side of the bounded forwarding queue
#[derive(Clone, Debug)]
pub struct ForwardingChannel {
    tx: mpsc::Sender<String>,
}

/// Consumer side of the bounded forwarding queue
#[derive(Debug)]
pub struct ForwardingReceiver {
    rx: mpsc::Receiver<String>,
}

/// Create a forwarding queue holding at most `capacity` messages
pub fn bounded(capacity: usize) -> (ForwardingChannel, ForwardingReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ForwardingChannel { tx }, ForwardingReceiver { rx })
}

impl ForwardingChannel {
    /// Maximum number of queued messages
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl MessageForwarder for ForwardingChannel {
    async fn push(&self, message: String, cancel: &CancellationToken) -> Result<(), ForwardError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            sent = self.tx.send(message) => sent.map_err(|_| ForwardError::Closed),
        }
    }
}

impl ForwardingReceiver {
    /// Next message in FIFO order, `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let (channel, mut receiver) = bounded(2);
        let cancel = CancellationToken::new();

        channel.push("one".into(), &cancel).await.unwrap();
        channel.push("two".into(), &cancel).await.unwrap();
        assert_eq!(channel.available(), 0);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            channel.push("three".into(), &cancel),
        )
        .await;
        assert!(blocked.is_err(), "third push should wait for capacity");

        let producer = {
            let channel = channel.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { channel.push("three".into(), &cancel).await })
        };

        assert_eq!(receiver.recv().await.as_deref(), Some("one"));
        producer.await.unwrap().unwrap();

        assert_eq!(receiver.recv().await.as_deref(), Some("two"));
        assert_eq!(receiver.recv().await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn test_push_after_receiver_dropped() {
        let (channel, receiver) = bounded(1);
        drop(receiver);

        let err = channel
            .push("lost".into(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ForwardError::Closed);
    }

    #[tokio::test]
    async fn test_cancel_releases_blocked_push() {
        let (channel, _receiver) = bounded(1);
        let cancel = CancellationToken::new();
        channel.push("fill".into(), &cancel).await.unwrap();

        let waiting = {
            let channel = channel.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { channel.push("waits".into(), &cancel).await })
        };
        cancel.cancel();

        assert_eq!(waiting.await.unwrap(), Err(ForwardError::Cancelled));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (channel, _receiver) = bounded(0);
        assert_eq!(channel.capacity(), 1);
    }
}
