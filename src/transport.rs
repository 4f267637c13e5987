use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{ClientEvent, RosterUser, ServerEvent};
use crate::room::Identity;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Live link status as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Inbound events delivered to the controller. `Connected`/`Disconnected`
/// fire once per edge, not once per retry attempt.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    RoomJoined {
        room_id: Uuid,
        code: String,
        language: String,
        theme: String,
        users: Vec<RosterUser>,
    },
    CodeChange {
        text: String,
        language: String,
    },
    LanguageChange {
        language: String,
    },
    ThemeChange {
        theme: String,
    },
    UserJoined {
        user_id: Uuid,
        username: String,
        message: String,
    },
    UserLeft {
        user_id: Uuid,
        message: String,
    },
    Chat {
        user_id: Uuid,
        username: String,
        message: String,
    },
    Snapshot {
        code: String,
        language: String,
        theme: String,
    },
    ServerError {
        message: String,
    },
}

#[derive(Debug)]
pub(crate) enum Command {
    Send(ClientEvent),
    Shutdown,
}

/// Cheap, cloneable sender half of the transport. All emission is
/// fire-and-forget: nothing here blocks or waits for acknowledgment.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportHandle {
    /// Associates this connection with a room channel. Joining a new room
    /// implicitly leaves the previous one. If the link is not up yet the
    /// join is queued and flushed as soon as it is.
    pub fn join_room(&self, room_id: Uuid, user_id: Uuid) {
        self.send(ClientEvent::JoinRoom { room_id, user_id });
    }

    /// Detaches from the current room channel. Safe to call repeatedly or
    /// when no room is joined.
    pub fn leave_room(&self) {
        self.send(ClientEvent::LeaveRoom);
    }

    pub fn send_code_change(&self, text: &str, language: &str) {
        self.send(ClientEvent::CodeChange {
            text: text.to_string(),
            language: language.to_string(),
        });
    }

    pub fn change_language(&self, language: &str) {
        self.send(ClientEvent::LanguageChange {
            language: language.to_string(),
        });
    }

    pub fn change_theme(&self, theme: &str) {
        self.send(ClientEvent::ThemeChange {
            theme: theme.to_string(),
        });
    }

    pub fn send_chat(&self, message: &str) {
        self.send(ClientEvent::Chat {
            message: message.to_string(),
        });
    }

    /// Asks the relay for the room's current text and configuration. Used
    /// after a reconnect, since dropped broadcasts are never replayed.
    pub fn request_snapshot(&self) {
        self.send(ClientEvent::SnapshotRequest);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, event: ClientEvent) {
        let _ = self.commands.send(Command::Send(event));
    }
}

/// Opens a persistent connection to the relay and keeps it alive: lost
/// links are redialed with a short delay, the identity is re-announced and
/// the last joined room is re-entered automatically. Dropping the handle
/// and the event receiver tears the connection down.
///
/// Connecting is idempotent by construction: one call owns one link, and
/// the handle exposes no way to dial again.
pub fn connect(
    addr: String,
    identity: Identity,
) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    tokio::spawn(run_link(addr, identity, cmd_rx, event_tx, state_tx));

    (
        TransportHandle {
            commands: cmd_tx,
            state: state_rx,
        },
        event_rx,
    )
}

async fn run_link(
    addr: String,
    identity: Identity,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectionState>,
) {
    // Room to re-enter after a reconnect; also where pre-connect joins wait.
    let mut joined_room: Option<(Uuid, Uuid)> = None;
    let mut announced_down = false;

    loop {
        let _ = state.send(ConnectionState::Connecting);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                announced_down = false;
                let _ = state.send(ConnectionState::Connected);
                let _ = events.send(TransportEvent::Connected);
                let done = drive_session(
                    stream,
                    &identity,
                    &mut joined_room,
                    &mut commands,
                    &events,
                )
                .await;
                let _ = state.send(ConnectionState::Disconnected);
                let _ = events.send(TransportEvent::Disconnected);
                announced_down = true;
                if done {
                    return;
                }
            }
            Err(err) => {
                debug!(addr = %addr, error = %err, "dial failed");
                let _ = state.send(ConnectionState::Disconnected);
                if !announced_down {
                    let _ = events.send(TransportEvent::Disconnected);
                    announced_down = true;
                }
            }
        }

        // Wait out the retry delay while still tracking join/leave intent.
        let delay = tokio::time::sleep(RETRY_DELAY);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return,
                    Some(Command::Send(event)) => {
                        // Sends while down are lost (at-most-once), but the
                        // room association must survive for the redial.
                        track_room_intent(&event, &mut joined_room);
                    }
                },
            }
        }
    }
}

/// Runs one live session over an established stream. Returns `true` when
/// the transport should shut down for good, `false` to redial.
async fn drive_session(
    stream: TcpStream,
    identity: &Identity,
    joined_room: &mut Option<(Uuid, Uuid)>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> bool {
    let (reader, mut writer) = stream.into_split();

    let hello = ClientEvent::Hello {
        token: identity.token.clone(),
        user_id: identity.user_id,
        username: identity.username.clone(),
    };
    if write_frame(&mut writer, &hello).await.is_err() {
        return false;
    }
    if let Some((room_id, user_id)) = *joined_room {
        let rejoin = ClientEvent::JoinRoom { room_id, user_id };
        if write_frame(&mut writer, &rejoin).await.is_err() {
            return false;
        }
    }

    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None | Some(Command::Shutdown) => {
                    let _ = write_frame(&mut writer, &ClientEvent::LeaveRoom).await;
                    return true;
                }
                Some(Command::Send(event)) => {
                    track_room_intent(&event, joined_room);
                    if write_frame(&mut writer, &event).await.is_err() {
                        return false;
                    }
                }
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => return false,
                };
                match serde_json::from_str::<ServerEvent>(&line) {
                    Ok(event) => {
                        if events.send(map_event(event)).is_err() {
                            return true;
                        }
                    }
                    Err(err) => warn!(error = %err, "skipping malformed frame"),
                }
            }
        }
    }
}

fn track_room_intent(event: &ClientEvent, joined_room: &mut Option<(Uuid, Uuid)>) {
    match event {
        ClientEvent::JoinRoom { room_id, user_id } => {
            *joined_room = Some((*room_id, *user_id));
        }
        ClientEvent::LeaveRoom => {
            *joined_room = None;
        }
        _ => {}
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, event: &ClientEvent) -> std::io::Result<()> {
    let json = serde_json::to_string(event)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await
}

fn map_event(event: ServerEvent) -> TransportEvent {
    match event {
        ServerEvent::Joined {
            room_id,
            code,
            language,
            theme,
            users,
        } => TransportEvent::RoomJoined {
            room_id,
            code,
            language,
            theme,
            users,
        },
        ServerEvent::CodeChange { text, language } => {
            TransportEvent::CodeChange { text, language }
        }
        ServerEvent::LanguageChange { language } => TransportEvent::LanguageChange { language },
        ServerEvent::ThemeChange { theme } => TransportEvent::ThemeChange { theme },
        ServerEvent::UserJoined {
            message,
            user_id,
            username,
        } => TransportEvent::UserJoined {
            user_id,
            username,
            message,
        },
        ServerEvent::UserLeft { message, user_id } => {
            TransportEvent::UserLeft { user_id, message }
        }
        ServerEvent::Chat {
            user_id,
            username,
            message,
        } => TransportEvent::Chat {
            user_id,
            username,
            message,
        },
        ServerEvent::Snapshot {
            code,
            language,
            theme,
        } => TransportEvent::Snapshot {
            code,
            language,
            theme,
        },
        ServerEvent::Error { message } => TransportEvent::ServerError { message },
    }
}

/// Reads inbound frames for tests that stand in for the relay.
#[cfg(test)]
async fn read_frame(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Option<ClientEvent> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => serde_json::from_str(&line).ok(),
    }
}

#[cfg(test)]
pub(crate) fn detached_handle() -> (
    TransportHandle,
    mpsc::UnboundedReceiver<Command>,
    watch::Sender<ConnectionState>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    (
        TransportHandle {
            commands: cmd_tx,
            state: state_rx,
        },
        cmd_rx,
        state_tx,
    )
}
