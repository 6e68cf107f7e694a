use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ForwardingReceiver;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to send GELF message: {0}")]
    Io(#[from] std::io::Error),

    #[error("GELF message of {size} bytes exceeds the chunking limit")]
    TooLarge { size: usize },

    #[error("could not resolve GELF endpoint {0}")]
    Resolve(String),
}

/// Final destination for serialized GELF messages
pub trait MessageSink: Send + Sync {
    fn send(&self, message: &str) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Spawn the single consumer that drains `receiver` into `sink`
///
/// Messages are delivered in FIFO order. A failed send is logged and the
/// message dropped. The task ends once `cancel` fires or every producer is gone.
pub fn spawn_sender<S>(
    mut receiver: ForwardingReceiver,
    sink: Arc<S>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: MessageSink + 'static,
{
    tokio::spawn(async move {
        let mut sent: u64 = 0;
        let mut dropped: u64 = 0;

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => {
                        debug!("all producers gone");
                        break;
                    }
                },
            };

            match sink.send(&message).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    dropped += 1;
                    warn!(error = %e, "dropping GELF message");
                }
            }
        }

        info!(sent, dropped, "GELF sender stopped");
    })
}
