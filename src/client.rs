//! Client struct definition
//!
//! Represents one registered connection of a user: a bounded outbound queue
//! drained by a dedicated sender task that owns the write half of the
//! transport.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::types::{ClientId, UserId};

/// Upper bound on the flush a graceful close performs
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Connected client information
///
/// Holds the identity of the connection, its outbound queue and the handle
/// of the task writing to the transport.
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Owner of the connection
    pub user_id: UserId,
    /// Display name
    pub name: String,
    /// Hub → sender task queue
    sender: mpsc::Sender<Message>,
    closed: Arc<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Register a transport and start its sender task
    ///
    /// Every queued message is written to `sink` with `write_timeout` as the
    /// deadline. When a write fails or times out the client marks itself
    /// closed and `on_failure` is called with its id.
    pub fn spawn<S>(
        user_id: UserId,
        name: String,
        sink: S,
        capacity: usize,
        write_timeout: Duration,
        on_failure: impl FnOnce(ClientId) + Send + 'static,
    ) -> Arc<Self>
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: fmt::Display,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let client = Arc::new(Self {
            id: ClientId::new(),
            user_id,
            name,
            sender,
            closed: Arc::new(closed),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run_sender(
            client.id,
            receiver,
            sink,
            Arc::clone(&client.closed),
            write_timeout,
            on_failure,
        ));
        *client.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        client
    }

    /// Queue a message without waiting
    pub fn try_send(&self, msg: Message) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::ChannelClosed);
        }
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Reject further messages and let the sender task wind down
    ///
    /// A write in progress and the messages already queued get at most
    /// `CLOSE_GRACE` (capped by the write timeout) to reach the transport
    /// before it is closed. Returns `true` for the call that actually closed
    /// the client.
    pub fn close(&self) -> bool {
        let was_open = !self.closed.send_replace(true);
        if was_open {
            debug!(client = %self.id, user = %self.user_id, "Client closed");
        }
        was_open
    }

    /// Close without flushing: the sender task is cancelled and drops the
    /// transport write half right away
    pub fn abort(&self) -> bool {
        let was_open = self.close();
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the client has been closed
    ///
    /// The connection reader selects on this to stop reading.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run_sender<S>(
    client_id: ClientId,
    mut receiver: mpsc::Receiver<Message>,
    mut sink: S,
    closed: Arc<watch::Sender<bool>>,
    write_timeout: Duration,
    on_failure: impl FnOnce(ClientId),
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut closed_rx = closed.subscribe();
    let grace = CLOSE_GRACE.min(write_timeout);
    let mut deadline = None;
    let mut failed = false;

    loop {
        let msg = tokio::select! {
            biased;
            _ = closed_rx.wait_for(|closed| *closed) => break,
            msg = receiver.recv() => msg,
        };
        let Some(msg) = msg else {
            break;
        };

        let written = {
            let send = write(client_id, &mut sink, msg, write_timeout);
            tokio::pin!(send);
            let finished = tokio::select! {
                written = &mut send => Some(written),
                _ = closed_rx.wait_for(|closed| *closed) => None,
            };
            match finished {
                Some(written) => written,
                None => {
                    // Closed mid-write: the write only gets the grace period
                    let until = Instant::now() + grace;
                    deadline = Some(until);
                    tokio::time::timeout_at(until, &mut send).await.unwrap_or(false)
                }
            }
        };
        if deadline.is_some() {
            break;
        }
        if !written {
            failed = true;
            break;
        }
    }

    if failed {
        closed.send_replace(true);
        on_failure(client_id);
    } else {
        // Flush whatever was queued before the close
        let until = deadline.unwrap_or_else(|| Instant::now() + grace);
        receiver.close();
        let flush = async {
            while let Ok(msg) = receiver.try_recv() {
                if !write(client_id, &mut sink, msg, write_timeout).await {
                    return;
                }
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout_at(until, flush).await.is_err() {
            debug!(client = %client_id, "Flush on close cut short");
        }
    }
    debug!(client = %client_id, "Sender task ended");
}

/// Write one message; `false` once the transport is unusable
async fn write<S>(client_id: ClientId, sink: &mut S, msg: Message, write_timeout: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    match tokio::time::timeout(write_timeout, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(client = %client_id, "Write failed: {}", e);
            false
        }
        Err(_) => {
            warn!(client = %client_id, "Write timed out after {:?}", write_timeout);
            false
        }
    }
}
