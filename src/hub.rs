//! Per-room fan-out
//!
//! The hub tracks every registered connection grouped by user and delivers
//! messages to them. Delivery never waits on a recipient: each client has a
//! bounded queue drained by its own sender task, and a client whose queue is
//! full is closed and dropped from the hub instead of slowing the others.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::Sink;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::Config;
use crate::error::{AppError, Result, SendError};
use crate::message::ServerMessage;
use crate::types::{ClientId, RoomId, UserId};

/// Recipient filter for `Hub::broadcast`
#[derive(Debug, Clone, Default)]
pub struct BroadcastConf {
    ignore_client: Option<ClientId>,
    sender: Option<UserId>,
    ignore_self: bool,
}

impl BroadcastConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip one specific connection
    pub fn ignore_client(mut self, client_id: ClientId) -> Self {
        self.ignore_client = Some(client_id);
        self
    }

    /// User on whose behalf the message is sent
    pub fn sender(mut self, user_id: UserId) -> Self {
        self.sender = Some(user_id);
        self
    }

    /// Skip every connection of the sender
    pub fn ignore_self(mut self) -> Self {
        self.ignore_self = true;
        self
    }

    fn accepts(&self, client: &Client) -> bool {
        if self.ignore_client == Some(client.id) {
            return false;
        }
        !(self.ignore_self && self.sender.as_ref() == Some(&client.user_id))
    }
}

struct Shared {
    room_id: RoomId,
    clients: DashMap<UserId, Vec<Arc<Client>>>,
    closed: AtomicBool,
    max_conns_per_user: usize,
    outbound_capacity: usize,
    write_timeout: Duration,
}

impl Shared {
    /// Take one connection of a user out of the registry
    fn take_client(&self, user_id: &UserId, client_id: ClientId) -> Option<Arc<Client>> {
        let removed = {
            let mut conns = self.clients.get_mut(user_id)?;
            let position = conns.iter().position(|c| c.id == client_id);
            let removed = position.map(|i| conns.remove(i));
            removed
        };
        self.clients.remove_if(user_id, |_, conns| conns.is_empty());
        if removed.is_some() {
            debug!(room = %self.room_id, user = %user_id, client = %client_id, "Client unregistered");
        }
        removed
    }

    /// Drop one connection of a user and close it
    fn remove_client(&self, user_id: &UserId, client_id: ClientId) -> bool {
        self.take_client(user_id, client_id)
            .map(|client| client.close())
            .is_some()
    }

    /// Queue `msg` on each client, dropping the ones that cannot take it
    fn deliver(&self, clients: Vec<Arc<Client>>, msg: &Message) {
        for client in clients {
            match client.try_send(msg.clone()) {
                Ok(()) => {}
                Err(SendError::ChannelFull) => {
                    warn!(
                        room = %self.room_id,
                        user = %client.user_id,
                        client = %client.id,
                        "Outbound queue full, dropping client"
                    );
                    // Its transport is not keeping up, so nothing is flushed
                    self.take_client(&client.user_id, client.id);
                    client.abort();
                }
                Err(SendError::ChannelClosed) => {
                    self.remove_client(&client.user_id, client.id);
                }
            }
        }
    }
}

/// Connection registry and message router of one room
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    pub fn new(room_id: RoomId, config: &Config) -> Self {
        debug!(room = %room_id, "Hub created");
        Self {
            shared: Arc::new(Shared {
                room_id,
                clients: DashMap::new(),
                closed: AtomicBool::new(false),
                max_conns_per_user: config.max_conns_per_user.max(1),
                outbound_capacity: config.outbound_capacity,
                write_timeout: config.write_timeout,
            }),
        }
    }

    /// Register a connection of `user_id` writing to `sink`
    ///
    /// When the user already holds the maximum number of connections, the
    /// oldest one is closed.
    pub fn reg_client<S>(&self, user_id: UserId, name: String, sink: S) -> Result<Arc<Client>>
    where
        S: Sink<Message> + Send + Unpin + 'static,
        S::Error: fmt::Display,
    {
        if self.is_closed() {
            return Err(AppError::HubClosed);
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let owner = user_id.clone();
        let client = Client::spawn(
            user_id.clone(),
            name,
            sink,
            self.shared.outbound_capacity,
            self.shared.write_timeout,
            move |client_id| {
                if let Some(shared) = weak.upgrade() {
                    shared.remove_client(&owner, client_id);
                }
            },
        );

        let evicted: Vec<Arc<Client>> = {
            let mut conns = self.shared.clients.entry(user_id.clone()).or_default();
            conns.push(Arc::clone(&client));
            let excess = conns.len().saturating_sub(self.shared.max_conns_per_user);
            let evicted: Vec<_> = conns.drain(..excess).collect();
            evicted
        };
        for old in evicted {
            info!(room = %self.shared.room_id, user = %user_id, client = %old.id, "Connection limit reached, closing oldest");
            old.close();
        }

        // Lost a race with `close`
        if self.is_closed() {
            self.shared.remove_client(&user_id, client.id);
            return Err(AppError::HubClosed);
        }

        info!(room = %self.shared.room_id, user = %user_id, client = %client.id, "Client registered");
        Ok(client)
    }

    /// Remove every connection of a user and close them
    pub fn unreg_client(&self, user_id: &UserId) {
        if let Some((_, conns)) = self.shared.clients.remove(user_id) {
            for client in &conns {
                client.close();
            }
            info!(room = %self.shared.room_id, user = %user_id, connections = conns.len(), "User unregistered");
        }
    }

    /// Remove a single connection, leaving the user's others in place
    pub fn remove_client(&self, client: &Client) -> bool {
        self.shared.remove_client(&client.user_id, client.id)
    }

    /// Send `msg` to every registered connection accepted by `conf`
    pub fn broadcast(&self, msg: &ServerMessage, conf: &BroadcastConf) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::HubClosed);
        }
        let frame = Message::Text(serde_json::to_string(msg)?.into());

        let recipients: Vec<Arc<Client>> = self
            .shared
            .clients
            .iter()
            .flat_map(|item| item.value().clone())
            .filter(|client| conf.accepts(client))
            .collect();
        self.shared.deliver(recipients, &frame);
        Ok(())
    }

    /// Send `msg` to every connection of one user; no-op without connections
    pub fn send_to_user(&self, user_id: &UserId, msg: &ServerMessage) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::HubClosed);
        }
        let Some(conns) = self.shared.clients.get(user_id).map(|c| c.value().clone()) else {
            return Ok(());
        };
        let frame = Message::Text(serde_json::to_string(msg)?.into());
        self.shared.deliver(conns, &frame);
        Ok(())
    }

    /// Number of distinct users with at least one connection
    pub fn client_num(&self) -> i64 {
        i64::try_from(self.shared.clients.len()).unwrap_or(i64::MAX)
    }

    /// Number of open connections of one user
    pub fn conn_num(&self, user_id: &UserId) -> usize {
        self.shared.clients.get(user_id).map_or(0, |c| c.len())
    }

    /// Reject further use and close every connection
    ///
    /// Sender tasks are cancelled, so each transport is released right away
    /// even when a write to it is stuck. Only the first call does anything.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let users: Vec<UserId> = self
            .shared
            .clients
            .iter()
            .map(|item| item.key().clone())
            .collect();
        let mut closed = 0;
        for user_id in users {
            if let Some((_, conns)) = self.shared.clients.remove(&user_id) {
                for client in conns {
                    client.abort();
                    closed += 1;
                }
            }
        }
        info!(room = %self.shared.room_id, connections = closed, "Hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("room_id", &self.shared.room_id)
            .field("users", &self.shared.clients.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::sink;
    use tokio::sync::mpsc;

    use super::*;

    type Inbox = mpsc::UnboundedReceiver<Message>;

    fn hub_with(max_conns_per_user: usize, outbound_capacity: usize) -> Hub {
        let config = Config {
            max_conns_per_user,
            outbound_capacity,
            write_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        Hub::new(RoomId::generate(), &config)
    }

    fn hub() -> Hub {
        hub_with(4, 16)
    }

    fn test_sink() -> (
        impl Sink<Message, Error = SendError> + Send + Unpin + 'static,
        Inbox,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Box::pin(sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| SendError::ChannelClosed)?;
            Ok::<_, SendError>(tx)
        }));
        (sink, rx)
    }

    fn stuck_sink() -> impl Sink<Message, Error = SendError> + Send + Unpin + 'static {
        Box::pin(sink::unfold((), |(), _msg: Message| async move {
            std::future::pending::<()>().await;
            Ok::<_, SendError>(())
        }))
    }

    /// A sink that never completes a write and reports when it is dropped
    fn stuck_sink_with_guard() -> (
        impl Sink<Message, Error = SendError> + Send + Unpin + 'static,
        mpsc::Receiver<()>,
    ) {
        let (guard, dropped) = mpsc::channel::<()>(1);
        let sink = Box::pin(sink::unfold(guard, |guard, _msg: Message| async move {
            std::future::pending::<()>().await;
            Ok::<_, SendError>(guard)
        }));
        (sink, dropped)
    }

    fn register(hub: &Hub, user: &str) -> (Arc<Client>, Inbox) {
        let (sink, rx) = test_sink();
        let client = hub
            .reg_client(UserId::from(user), user.to_string(), sink)
            .unwrap();
        (client, rx)
    }

    fn chat(content: &str) -> ServerMessage {
        ServerMessage::Chat {
            from: "system".to_string(),
            content: content.to_string(),
        }
    }

    async fn recv_text(rx: &mut Inbox) -> String {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Message::Text(text))) => text.to_string(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let hub = hub();
        let (_a, mut rx_a) = register(&hub, "alice");
        let (_b, mut rx_b) = register(&hub, "bob");
        assert_eq!(hub.client_num(), 2);

        hub.broadcast(&chat("hello"), &BroadcastConf::new()).unwrap();

        assert!(recv_text(&mut rx_a).await.contains("hello"));
        assert!(recv_text(&mut rx_b).await.contains("hello"));
    }

    #[tokio::test]
    async fn test_broadcast_filters() {
        let hub = hub();
        let (a1, mut rx_a1) = register(&hub, "alice");
        let (_a2, mut rx_a2) = register(&hub, "alice");
        let (_b, mut rx_b) = register(&hub, "bob");

        let conf = BroadcastConf::new()
            .sender(UserId::from("alice"))
            .ignore_self();
        hub.broadcast(&chat("first"), &conf).unwrap();
        hub.broadcast(&chat("second"), &BroadcastConf::new().ignore_client(a1.id))
            .unwrap();

        assert!(recv_text(&mut rx_b).await.contains("first"));
        assert!(recv_text(&mut rx_b).await.contains("second"));
        assert!(recv_text(&mut rx_a2).await.contains("second"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_a1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_user() {
        let hub = hub();
        let (_a1, mut rx_a1) = register(&hub, "alice");
        let (_a2, mut rx_a2) = register(&hub, "alice");
        let (_b, mut rx_b) = register(&hub, "bob");

        hub.send_to_user(&UserId::from("alice"), &chat("psst")).unwrap();
        hub.send_to_user(&UserId::from("nobody"), &chat("void")).unwrap();

        assert!(recv_text(&mut rx_a1).await.contains("psst"));
        assert!(recv_text(&mut rx_a2).await.contains("psst"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_limit_evicts_oldest() {
        let hub = hub_with(2, 16);
        let (first, _rx1) = register(&hub, "alice");
        let (second, _rx2) = register(&hub, "alice");
        let (third, _rx3) = register(&hub, "alice");

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(!third.is_closed());
        assert_eq!(hub.conn_num(&UserId::from("alice")), 2);
        assert_eq!(hub.client_num(), 1);
    }

    #[tokio::test]
    async fn test_unreg_client_removes_all_connections() {
        let hub = hub();
        let (a1, _rx_a1) = register(&hub, "alice");
        let (a2, _rx_a2) = register(&hub, "alice");
        let (_b, _rx_b) = register(&hub, "bob");
        assert_eq!(hub.client_num(), 2);

        hub.unreg_client(&UserId::from("alice"));
        assert_eq!(hub.client_num(), 1);
        assert!(a1.is_closed());
        assert!(a2.is_closed());

        // Idempotent
        hub.unreg_client(&UserId::from("alice"));
        assert_eq!(hub.client_num(), 1);
    }

    #[tokio::test]
    async fn test_remove_single_client() {
        let hub = hub();
        let (a1, _rx_a1) = register(&hub, "alice");
        let (a2, _rx_a2) = register(&hub, "alice");

        assert!(hub.remove_client(&a1));
        assert!(!hub.remove_client(&a1));
        assert!(a1.is_closed());
        assert!(!a2.is_closed());
        assert_eq!(hub.client_num(), 1);

        assert!(hub.remove_client(&a2));
        assert_eq!(hub.client_num(), 0);
    }

    #[tokio::test]
    async fn test_slow_client_is_dropped() {
        let hub = hub_with(4, 1);
        let slow = hub
            .reg_client(UserId::from("slow"), "slow".to_string(), stuck_sink())
            .unwrap();
        let (_fast, mut rx_fast) = register(&hub, "fast");

        // The slow client's sender task takes the first message and blocks on it
        hub.broadcast(&chat("1"), &BroadcastConf::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.broadcast(&chat("2"), &BroadcastConf::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.broadcast(&chat("3"), &BroadcastConf::new()).unwrap();

        assert!(slow.is_closed());
        assert_eq!(hub.client_num(), 1);
        for expected in ["1", "2", "3"] {
            assert!(recv_text(&mut rx_fast).await.contains(expected));
        }
    }

    #[tokio::test]
    async fn test_failed_write_unregisters_client() {
        let hub = hub();
        let (client, rx) = register(&hub, "alice");
        drop(rx);

        hub.broadcast(&chat("lost"), &BroadcastConf::new()).unwrap();
        wait_until(|| hub.client_num() == 0).await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_close_rejects_and_closes_everything() {
        let hub = hub();
        let (a, _rx_a) = register(&hub, "alice");
        let (b, _rx_b) = register(&hub, "bob");

        hub.close();
        assert!(hub.is_closed());
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(hub.client_num(), 0);

        let (sink, _rx) = test_sink();
        assert!(matches!(
            hub.reg_client(UserId::from("carol"), "carol".to_string(), sink),
            Err(AppError::HubClosed)
        ));
        assert!(matches!(
            hub.broadcast(&chat("x"), &BroadcastConf::new()),
            Err(AppError::HubClosed)
        ));

        // Second close is a no-op
        hub.close();
    }

    #[tokio::test]
    async fn test_close_releases_stuck_transport() {
        // write_timeout is 5s, far beyond the wait below
        let hub = hub();
        let (sink, mut dropped) = stuck_sink_with_guard();
        let client = hub
            .reg_client(UserId::from("alice"), "alice".to_string(), sink)
            .unwrap();
        hub.broadcast(&chat("stuck"), &BroadcastConf::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.close();
        let released = tokio::time::timeout(Duration::from_millis(200), dropped.recv()).await;
        assert_eq!(released, Ok(None));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_slow_client_transport_is_released() {
        let hub = hub_with(4, 1);
        let (sink, mut dropped) = stuck_sink_with_guard();
        let slow = hub
            .reg_client(UserId::from("slow"), "slow".to_string(), sink)
            .unwrap();

        hub.broadcast(&chat("1"), &BroadcastConf::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.broadcast(&chat("2"), &BroadcastConf::new()).unwrap();
        hub.broadcast(&chat("3"), &BroadcastConf::new()).unwrap();

        assert!(slow.is_closed());
        let released = tokio::time::timeout(Duration::from_millis(200), dropped.recv()).await;
        assert_eq!(released, Ok(None));
    }
}
