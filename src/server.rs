use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientEvent, RosterUser, ServerEvent};
use crate::storage::{RoomSnapshot, SnapshotStore};

const DEFAULT_LANGUAGE: &str = "plaintext";
const DEFAULT_THEME: &str = "dark";

/// Live state of one room channel. Last writer wins at whole-buffer
/// granularity; there is no merge.
struct RoomChannel {
    code: String,
    language: String,
    theme: String,
    roster: HashMap<Uuid, String>,
}

impl RoomChannel {
    fn from_snapshot(snapshot: Option<RoomSnapshot>) -> Self {
        match snapshot {
            Some(snapshot) => Self {
                code: snapshot.code,
                language: snapshot.language,
                theme: snapshot.theme,
                roster: HashMap::new(),
            },
            None => Self {
                code: String::new(),
                language: DEFAULT_LANGUAGE.to_string(),
                theme: DEFAULT_THEME.to_string(),
                roster: HashMap::new(),
            },
        }
    }

    fn roster_users(&self) -> Vec<RosterUser> {
        let mut users: Vec<RosterUser> = self
            .roster
            .iter()
            .map(|(user_id, username)| RosterUser {
                user_id: *user_id,
                username: username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            code: self.code.clone(),
            language: self.language.clone(),
            theme: self.theme.clone(),
        }
    }
}

struct SharedState {
    rooms: HashMap<Uuid, RoomChannel>,
    store: SnapshotStore,
}

pub async fn run(addr: &str, data_dir: &str) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "relay listening");
    run_with_listener(listener, SnapshotStore::new(data_dir)).await
}

/// Accept loop over an already-bound listener, so tests can pick the port.
pub async fn run_with_listener(
    listener: TcpListener,
    store: SnapshotStore,
) -> Result<(), Box<dyn Error>> {
    let state = Arc::new(Mutex::new(SharedState {
        rooms: HashMap::new(),
        store,
    }));

    let (broadcast_tx, _) = broadcast::channel::<(Uuid, ServerEvent)>(256);

    // Connection tasks live in the set so dropping the accept loop severs
    // every live session with it.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "connection accepted");
                let state = Arc::clone(&state);
                let broadcast_tx = broadcast_tx.clone();
                let broadcast_rx = broadcast_tx.subscribe();
                connections.spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, state, broadcast_tx, broadcast_rx).await
                    {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                });
            }
            Some(_finished) = connections.join_next() => {}
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<Mutex<SharedState>>,
    broadcast_tx: broadcast::Sender<(Uuid, ServerEvent)>,
    mut broadcast_rx: broadcast::Receiver<(Uuid, ServerEvent)>,
) -> Result<(), Box<dyn Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let writer_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(_) => continue,
            };
            if writer.write_all(json.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    // The first frame must authenticate the connection. On refusal the
    // sender is dropped so the writer drains the error frame before the
    // connection closes.
    let (user_id, username) = match lines.next_line().await? {
        Some(line) => match serde_json::from_str::<ClientEvent>(&line) {
            Ok(ClientEvent::Hello {
                token,
                user_id,
                username,
            }) => {
                if token.trim().is_empty() {
                    let _ = out_tx.send(ServerEvent::Error {
                        message: "invalid token".to_string(),
                    });
                    drop(out_tx);
                    let _ = writer_task.await;
                    return Ok(());
                }
                (user_id, username)
            }
            _ => {
                let _ = out_tx.send(ServerEvent::Error {
                    message: "expected hello".to_string(),
                });
                drop(out_tx);
                let _ = writer_task.await;
                return Ok(());
            }
        },
        None => {
            writer_task.abort();
            return Ok(());
        }
    };
    info!(user = %username, "authenticated");

    let mut current_room: Option<Uuid> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(user = %username, error = %err, "read error");
                        break;
                    }
                };
                let event: ClientEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(user = %username, error = %err, "skipping malformed frame");
                        continue;
                    }
                };
                handle_client_event(
                    event,
                    user_id,
                    &username,
                    &mut current_room,
                    &state,
                    &broadcast_tx,
                    &out_tx,
                ).await;
            }
            event = broadcast_rx.recv() => {
                if let Ok((room_id, event)) = event {
                    if current_room == Some(room_id) {
                        let _ = out_tx.send(event);
                    }
                }
            }
        }
    }

    detach_from_room(user_id, &username, &mut current_room, &state, &broadcast_tx).await;
    writer_task.abort();
    Ok(())
}

async fn handle_client_event(
    event: ClientEvent,
    user_id: Uuid,
    username: &str,
    current_room: &mut Option<Uuid>,
    state: &Arc<Mutex<SharedState>>,
    broadcast_tx: &broadcast::Sender<(Uuid, ServerEvent)>,
    out_tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    match event {
        ClientEvent::Hello { .. } => {
            // Already authenticated; a second hello is meaningless.
        }
        ClientEvent::JoinRoom { room_id, .. } => {
            // One room per connection: joining implies leaving.
            detach_from_room(user_id, username, current_room, state, broadcast_tx).await;

            let mut guard = state.lock().await;
            if !guard.rooms.contains_key(&room_id) {
                let snapshot = match guard.store.load(room_id) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        warn!(room = %room_id, error = %err, "snapshot load failed");
                        None
                    }
                };
                guard.rooms.insert(room_id, RoomChannel::from_snapshot(snapshot));
            }
            let room = guard.rooms.get_mut(&room_id).expect("room exists");
            room.roster.insert(user_id, username.to_string());

            let joined = ServerEvent::Joined {
                room_id,
                code: room.code.clone(),
                language: room.language.clone(),
                theme: room.theme.clone(),
                users: room.roster_users(),
            };
            drop(guard);

            *current_room = Some(room_id);
            let _ = out_tx.send(joined);
            let _ = broadcast_tx.send((
                room_id,
                ServerEvent::UserJoined {
                    message: format!("{username} joined"),
                    user_id,
                    username: username.to_string(),
                },
            ));
            info!(room = %room_id, user = %username, "joined room");
        }
        ClientEvent::LeaveRoom => {
            detach_from_room(user_id, username, current_room, state, broadcast_tx).await;
        }
        ClientEvent::CodeChange { text, language } => {
            let Some(room_id) = *current_room else { return };
            let mut guard = state.lock().await;
            let Some(room) = guard.rooms.get_mut(&room_id) else {
                return;
            };
            room.code = text.clone();
            room.language = language.clone();
            let snapshot = room.snapshot();
            if let Err(err) = guard.store.save(room_id, &snapshot) {
                warn!(room = %room_id, error = %err, "snapshot save failed");
            }
            drop(guard);
            // Echoed to every member, the sender included.
            let _ = broadcast_tx.send((room_id, ServerEvent::CodeChange { text, language }));
        }
        ClientEvent::LanguageChange { language } => {
            let Some(room_id) = *current_room else { return };
            let mut guard = state.lock().await;
            let Some(room) = guard.rooms.get_mut(&room_id) else {
                return;
            };
            room.language = language.clone();
            let snapshot = room.snapshot();
            if let Err(err) = guard.store.save(room_id, &snapshot) {
                warn!(room = %room_id, error = %err, "snapshot save failed");
            }
            drop(guard);
            let _ = broadcast_tx.send((room_id, ServerEvent::LanguageChange { language }));
        }
        ClientEvent::ThemeChange { theme } => {
            let Some(room_id) = *current_room else { return };
            let mut guard = state.lock().await;
            let Some(room) = guard.rooms.get_mut(&room_id) else {
                return;
            };
            room.theme = theme.clone();
            let snapshot = room.snapshot();
            if let Err(err) = guard.store.save(room_id, &snapshot) {
                warn!(room = %room_id, error = %err, "snapshot save failed");
            }
            drop(guard);
            let _ = broadcast_tx.send((room_id, ServerEvent::ThemeChange { theme }));
        }
        ClientEvent::Chat { message } => {
            let Some(room_id) = *current_room else { return };
            let _ = broadcast_tx.send((
                room_id,
                ServerEvent::Chat {
                    user_id,
                    username: username.to_string(),
                    message,
                },
            ));
        }
        ClientEvent::SnapshotRequest => {
            let Some(room_id) = *current_room else { return };
            let guard = state.lock().await;
            if let Some(room) = guard.rooms.get(&room_id) {
                let _ = out_tx.send(ServerEvent::Snapshot {
                    code: room.code.clone(),
                    language: room.language.clone(),
                    theme: room.theme.clone(),
                });
            }
        }
    }
}

async fn detach_from_room(
    user_id: Uuid,
    username: &str,
    current_room: &mut Option<Uuid>,
    state: &Arc<Mutex<SharedState>>,
    broadcast_tx: &broadcast::Sender<(Uuid, ServerEvent)>,
) {
    let Some(room_id) = current_room.take() else {
        return;
    };
    let mut guard = state.lock().await;
    if let Some(room) = guard.rooms.get_mut(&room_id) {
        room.roster.remove(&user_id);
    }
    drop(guard);
    let _ = broadcast_tx.send((
        room_id,
        ServerEvent::UserLeft {
            message: format!("{username} left"),
            user_id,
        },
    ));
    info!(room = %room_id, user = %username, "left room");
}
