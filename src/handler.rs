//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, the join
//! exchange, then dispatch of playback and chat messages to the joined room.
//! Outbound traffic goes through the room hub; this task only reads.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::current::Status;
use crate::error::{AppError, Result};
use crate::hub::BroadcastConf;
use crate::message::{ClientMessage, ErrorCode, ServerMessage};
use crate::room::Room;
use crate::rooms::Rooms;
use crate::types::{MovieId, Permission, RoomId, UserId};

/// How long a new connection may take to send its join message
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// A joined connection
struct Session {
    rooms: Arc<Rooms>,
    room: Arc<Room>,
    client: Arc<Client>,
    user_id: UserId,
    /// Room version the join was validated against
    version: u32,
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, waits for a `join`, registers the
/// connection with the room and serves it until either side goes away.
pub async fn handle_connection(stream: TcpStream, rooms: Arc<Rooms>) -> Result<()> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let join = match tokio::time::timeout(JOIN_TIMEOUT, read_message(&mut ws_receiver)).await {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            debug!("{} left before joining", peer_addr);
            return Ok(());
        }
        Err(_) => {
            debug!("{} did not join in time", peer_addr);
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };

    let joined = match join {
        Ok(ClientMessage::Join {
            room_id,
            user_id,
            password,
        }) => join_room(Arc::clone(&rooms), room_id, user_id, password).await,
        Ok(_) => Err(not_joined()),
        Err(e) => Err(ServerMessage::from(AppError::Json(e))),
    };
    let (room, user_id, version) = match joined {
        Ok(joined) => joined,
        Err(reply) => {
            let json = serde_json::to_string(&reply)?;
            ws_sender.send(Message::Text(json.into())).await?;
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };

    let client = room.reg_client(user_id.clone(), user_id.to_string(), ws_sender)?;
    let session = Arc::new(Session {
        rooms,
        room,
        client,
        user_id,
        version,
    });
    info!(
        room = %session.room.id(),
        user = %session.user_id,
        client = %session.client.id,
        "Client joined from {}", peer_addr
    );

    reply(
        &session,
        &ServerMessage::Joined {
            room_id: session.room.id().to_string(),
            client_id: session.client.id.to_string(),
            version: session.version,
            current: session.room.current(),
        },
    );
    broadcast_people_num(&session.room);

    serve(&session, &mut ws_receiver).await;

    session.room.remove_client(&session.client);
    session.client.close();
    // The room's TTL counts from the last connection leaving
    session.rooms.touch(&session.room);
    broadcast_people_num(&session.room);
    info!(
        room = %session.room.id(),
        user = %session.user_id,
        client = %session.client.id,
        "Client disconnected"
    );

    Ok(())
}

/// Validate a join request
///
/// Runs on the blocking pool: loading may hit the database and password
/// checks are deliberately slow.
async fn join_room(
    rooms: Arc<Rooms>,
    room_id: String,
    user_id: String,
    password: String,
) -> std::result::Result<(Arc<Room>, UserId, u32), ServerMessage> {
    let task = tokio::task::spawn_blocking(move || {
        let room = rooms.load_or_init_room_by_id(&RoomId::from(room_id.as_str()))?;
        let version = room.version();
        if !room.check_password(&password) {
            return Err(AppError::PasswordIncorrect);
        }
        Ok((room, UserId::from(user_id.as_str()), version))
    });

    match task.await {
        Ok(result) => result.map_err(|e| {
            debug!("Join rejected: {}", e);
            ServerMessage::from(e)
        }),
        Err(e) => {
            warn!("Join task failed: {}", e);
            Err(ServerMessage::from(AppError::HubClosed))
        }
    }
}

/// Next client message, or `None` once the connection is gone
async fn read_message(
    reader: &mut WsReader,
) -> Option<std::result::Result<ClientMessage, serde_json::Error>> {
    while let Some(msg_result) = reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text)),
            Ok(Message::Close(_)) => return None,
            // Pong is handled automatically by tungstenite
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error: {}", e);
                return None;
            }
        }
    }
    None
}

async fn serve(session: &Arc<Session>, reader: &mut WsReader) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = session.client.closed() => break,
            msg = read_message(reader) => msg,
        };
        let Some(msg) = msg else {
            break;
        };
        session.rooms.touch(&session.room);

        if !session.room.check_version(session.version) {
            reply(
                session,
                &ServerMessage::Error {
                    code: ErrorCode::VersionMismatch,
                    message: "Room password changed, join again".to_string(),
                },
            );
            break;
        }

        match msg {
            Ok(msg) => {
                if let Err(e) = dispatch_blocking(session, msg).await {
                    if matches!(e, AppError::HubClosed) {
                        break;
                    }
                    debug!(client = %session.client.id, "Request failed: {}", e);
                    reply(session, &ServerMessage::from(e));
                }
            }
            Err(e) => {
                warn!(client = %session.client.id, "Invalid JSON: {}", e);
                reply(session, &ServerMessage::from(AppError::Json(e)));
            }
        }
    }
}

/// Run `dispatch` on the blocking pool
///
/// Permission checks and movie changes may query the database.
async fn dispatch_blocking(session: &Arc<Session>, msg: ClientMessage) -> Result<()> {
    let session = Arc::clone(session);
    let client_id = session.client.id;
    match tokio::task::spawn_blocking(move || dispatch(&session, msg)).await {
        Ok(result) => result,
        Err(e) => {
            warn!(client = %client_id, "Dispatch task failed: {}", e);
            Err(AppError::Io(e.into()))
        }
    }
}

fn dispatch(session: &Session, msg: ClientMessage) -> Result<()> {
    let room = &session.room;
    match msg {
        ClientMessage::Join { .. } => {
            reply(
                session,
                &ServerMessage::Error {
                    code: ErrorCode::InvalidMessage,
                    message: "Already joined".to_string(),
                },
            );
            Ok(())
        }
        ClientMessage::Chat { content } => {
            require(session, Permission::SEND_CHAT)?;
            room.broadcast(
                &ServerMessage::Chat {
                    from: session.user_id.to_string(),
                    content,
                },
                &BroadcastConf::new(),
            )
        }
        ClientMessage::SetStatus {
            playing,
            seek,
            rate,
            time_diff,
        } => {
            require(session, Permission::SET_CURRENT_STATUS)?;
            let status = room.set_status(playing, seek, rate, time_diff);
            broadcast_status(session, status)
        }
        ClientMessage::SetSeekRate {
            seek,
            rate,
            time_diff,
        } => {
            require(session, Permission::SET_CURRENT_STATUS)?;
            let status = room.set_seek_rate(seek, rate, time_diff);
            broadcast_status(session, status)
        }
        ClientMessage::ChangeMovie { movie_id } => {
            require(session, Permission::SET_CURRENT_MOVIE)?;
            let current = room.change_current_movie(&MovieId::from(movie_id.as_str()))?;
            room.broadcast(&ServerMessage::Current { current }, &BroadcastConf::new())
        }
        ClientMessage::Current => {
            reply(
                session,
                &ServerMessage::Current {
                    current: room.current(),
                },
            );
            Ok(())
        }
    }
}

fn require(session: &Session, permission: Permission) -> Result<()> {
    if session.room.has_permission(&session.user_id, permission) {
        Ok(())
    } else {
        Err(AppError::PermissionDenied)
    }
}

fn broadcast_status(session: &Session, status: Status) -> Result<()> {
    session.room.broadcast(
        &ServerMessage::Status {
            sender: session.user_id.to_string(),
            status,
        },
        &BroadcastConf::new().ignore_client(session.client.id),
    )
}

fn broadcast_people_num(room: &Room) {
    let msg = ServerMessage::PeopleNum {
        num: room.client_num(),
    };
    if let Err(e) = room.broadcast(&msg, &BroadcastConf::new()) {
        debug!(room = %room.id(), "People count not sent: {}", e);
    }
}

/// Queue a message for this connection only
fn reply(session: &Session, msg: &ServerMessage) {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize message: {}", e);
            return;
        }
    };
    if let Err(e) = session.client.try_send(Message::Text(json.into())) {
        debug!(client = %session.client.id, "Reply dropped: {}", e);
    }
}

fn not_joined() -> ServerMessage {
    ServerMessage::Error {
        code: ErrorCode::NotJoined,
        message: "Join a room first".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::Stream;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;

    use super::*;
    use crate::config::Config;
    use crate::db::MemoryDatabase;
    use crate::types::{BaseMovie, CreateRoomConfig, MovieRow, RoomRole};

    async fn start_server() -> (String, Arc<Rooms>) {
        let db = Arc::new(MemoryDatabase::new());
        let config = Arc::new(Config {
            password_cost: 4,
            ..Config::default()
        });
        let rooms = Arc::new(Rooms::new(db, config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_rooms = Arc::clone(&rooms);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let rooms = Arc::clone(&accept_rooms);
                tokio::spawn(handle_connection(stream, rooms));
            }
        });
        (format!("ws://{addr}"), rooms)
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn join(room: &Room, user: &str, password: &str) -> Message {
        Message::Text(
            serde_json::json!({
                "type": "join",
                "room_id": room.id().to_string(),
                "user_id": user,
                "password": password,
            })
            .to_string()
            .into(),
        )
    }

    #[tokio::test]
    async fn test_join_and_chat() {
        let (url, rooms) = start_server().await;
        let room = rooms
            .create_room("r", "", CreateRoomConfig::new(UserId::from("alice")))
            .unwrap();

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(join(&room, "alice", "")).await.unwrap();
        let joined = next_json(&mut ws).await;
        assert_eq!(joined["type"], "joined");
        assert_eq!(joined["version"], 0);
        assert_eq!(next_json(&mut ws).await["type"], "people_num");

        ws.send(Message::Text(r#"{"type":"chat","content":"hi"}"#.into()))
            .await
            .unwrap();
        let chat = next_json(&mut ws).await;
        assert_eq!(chat["type"], "chat");
        assert_eq!(chat["from"], "alice");
        assert_eq!(chat["content"], "hi");
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let (url, rooms) = start_server().await;
        let room = rooms
            .create_room("r", "pw", CreateRoomConfig::new(UserId::from("alice")))
            .unwrap();

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(join(&room, "alice", "nope")).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "password_incorrect");
    }

    #[tokio::test]
    async fn test_message_before_join() {
        let (url, _) = start_server().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(Message::Text(r#"{"type":"current"}"#.into()))
            .await
            .unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["code"], "not_joined");
    }

    #[tokio::test]
    async fn test_status_reaches_other_members() {
        let (url, rooms) = start_server().await;
        let room = rooms
            .create_room("r", "", CreateRoomConfig::new(UserId::from("alice")))
            .unwrap();
        room.set_user_role(&UserId::from("bob"), RoomRole::Member)
            .unwrap();
        let movie = room
            .add_movie(MovieRow::new(
                UserId::from("alice"),
                BaseMovie {
                    name: "m".to_string(),
                    ..BaseMovie::default()
                },
            ))
            .unwrap();

        let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
        alice.send(join(&room, "alice", "")).await.unwrap();
        assert_eq!(next_json(&mut alice).await["type"], "joined");
        assert_eq!(next_json(&mut alice).await["num"], 1);

        let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
        bob.send(join(&room, "bob", "")).await.unwrap();
        assert_eq!(next_json(&mut bob).await["type"], "joined");
        assert_eq!(next_json(&mut bob).await["num"], 2);
        assert_eq!(next_json(&mut alice).await["num"], 2);

        // Members may not switch movies
        bob.send(Message::Text(
            serde_json::json!({"type": "change_movie", "movie_id": movie.id.to_string()})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
        assert_eq!(next_json(&mut bob).await["code"], "permission_denied");

        alice
            .send(Message::Text(
                serde_json::json!({"type": "change_movie", "movie_id": movie.id.to_string()})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let current = next_json(&mut bob).await;
        assert_eq!(current["type"], "current");
        assert_eq!(current["current"]["movie_id"], movie.id.to_string());
        assert_eq!(next_json(&mut alice).await["type"], "current");

        bob.send(Message::Text(
            r#"{"type":"set_status","playing":false,"seek":42.0,"rate":1.0}"#.into(),
        ))
        .await
        .unwrap();
        let status = next_json(&mut alice).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["sender"], "bob");
        assert_eq!(status["status"]["seek"], 42.0);
    }

    #[tokio::test]
    async fn test_password_change_ends_session() {
        let (url, rooms) = start_server().await;
        let room = rooms
            .create_room("r", "", CreateRoomConfig::new(UserId::from("alice")))
            .unwrap();

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(join(&room, "alice", "")).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "joined");
        assert_eq!(next_json(&mut ws).await["type"], "people_num");

        room.set_password("new").unwrap();
        ws.send(Message::Text(r#"{"type":"current"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["code"], "version_mismatch");
    }

    #[tokio::test]
    async fn test_activity_refreshes_room_ttl() {
        let db = Arc::new(MemoryDatabase::new());
        let config = Arc::new(Config {
            room_ttl: Duration::from_millis(100),
            password_cost: 4,
            ..Config::default()
        });
        let rooms = Arc::new(Rooms::new(db, config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_rooms = Arc::clone(&rooms);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_rooms)));
            }
        });

        let room = rooms
            .create_room("r", "", CreateRoomConfig::new(UserId::from("alice")))
            .unwrap();
        let (mut ws, _) = connect_async(format!("ws://{addr}").as_str()).await.unwrap();
        ws.send(join(&room, "alice", "")).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "joined");
        assert_eq!(next_json(&mut ws).await["type"], "people_num");

        // Past the TTL the room is only kept because it is in use
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rooms.load_room_by_id(room.id()).is_err());

        ws.send(Message::Text(r#"{"type":"current"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "current");
        let loaded = rooms.load_room_by_id(room.id()).unwrap();
        assert!(Arc::ptr_eq(&loaded, &room));
    }
}
