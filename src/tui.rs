use std::error::Error;
use std::io::{Write, stdout};

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Attribute, Color, SetAttribute, SetBackgroundColor, SetForegroundColor};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, queue};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::api::HttpRoomApi;
use crate::controller::SyncController;
use crate::editor::{EditorBinding, clamp_to_boundary, cursor_line_col};
use crate::room::Identity;
use crate::store::RoomStore;
use crate::transport::{self, TransportEvent, TransportHandle};

enum UiEvent {
    Key(KeyEvent),
    Resize,
}

enum KeyOutcome {
    Redraw,
    Resync,
    DismissError,
    Exit,
    Ignored,
}

struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Result<Self, Box<dyn Error>> {
        terminal::enable_raw_mode()?;
        execute!(stdout(), EnterAlternateScreen, Hide)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(stdout(), Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

pub async fn run(
    relay_addr: &str,
    api_url: &str,
    identity: Identity,
    room_id: Uuid,
) -> Result<(), Box<dyn Error>> {
    let api = HttpRoomApi::new(api_url, &identity.token)?;
    let (handle, mut events) = transport::connect(relay_addr.to_string(), identity.clone());

    let mut controller = SyncController::new(
        room_id,
        identity,
        RoomStore::new(),
        handle.clone(),
        api,
    );
    // A failed fetch is fatal for this view; bail out before taking over
    // the terminal so the caller can point back at the room list.
    controller.open().await?;

    let _term = TerminalGuard::new()?;

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel::<UiEvent>();
    tokio::task::spawn_blocking(move || {
        loop {
            match event::read() {
                Ok(Event::Key(key)) => {
                    if ui_tx.send(UiEvent::Key(key)).is_err() {
                        break;
                    }
                }
                Ok(Event::Resize(_, _)) => {
                    if ui_tx.send(UiEvent::Resize).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let mut binding = EditorBinding::new(controller.store().current_code());
    let mut last_revision = controller.store().revision();
    let mut scroll = 0usize;
    let mut status_msg = String::new();
    let mut dirty = true;

    loop {
        controller.reconcile();

        // Fold authoritative changes into the editor surface.
        if controller.store().revision() != last_revision {
            last_revision = controller.store().revision();
            if binding.apply_authoritative(controller.store().current_code()) {
                dirty = true;
            }
        }

        if dirty {
            render(&controller, &binding, &mut scroll, &status_msg)?;
            dirty = false;
        }

        let deadline = binding.deadline();
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    TransportEvent::Connected => status_msg = "connected".to_string(),
                    TransportEvent::Disconnected => status_msg = "connection lost".to_string(),
                    TransportEvent::UserJoined { message, .. }
                    | TransportEvent::UserLeft { message, .. } => {
                        status_msg = message.clone();
                    }
                    TransportEvent::Chat { username, message, .. } => {
                        status_msg = format!("{username}: {message}");
                    }
                    _ => {}
                }
                controller.on_transport_event(event);
                dirty = true;
            }
            ui = ui_rx.recv() => {
                let Some(ui) = ui else { break };
                match ui {
                    UiEvent::Resize => dirty = true,
                    UiEvent::Key(key) => {
                        if key.kind == KeyEventKind::Release {
                            continue;
                        }
                        match handle_key(key, &mut binding) {
                            KeyOutcome::Exit => break,
                            KeyOutcome::Redraw => dirty = true,
                            KeyOutcome::Resync => {
                                request_resync(&handle, &mut status_msg);
                                dirty = true;
                            }
                            KeyOutcome::DismissError => {
                                controller.dismiss_error();
                                dirty = true;
                            }
                            KeyOutcome::Ignored => {}
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                if let Some(text) = binding.take_due(Instant::now()) {
                    let text = text.to_string();
                    controller.handle_local_edit(&text);
                    dirty = true;
                }
            }
        }
    }

    binding.cancel_pending();
    controller.teardown();
    handle.shutdown();
    Ok(())
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

fn request_resync(handle: &TransportHandle, status_msg: &mut String) {
    handle.request_snapshot();
    status_msg.clear();
    status_msg.push_str("resync requested");
}

fn handle_key(key: KeyEvent, binding: &mut EditorBinding) -> KeyOutcome {
    if key.code == KeyCode::Esc {
        return KeyOutcome::Exit;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('q') => KeyOutcome::Exit,
            KeyCode::Char('r') => KeyOutcome::Resync,
            KeyCode::Char('e') => KeyOutcome::DismissError,
            _ => KeyOutcome::Ignored,
        };
    }

    let now = Instant::now();
    match key.code {
        KeyCode::Left => {
            binding.move_left();
            KeyOutcome::Redraw
        }
        KeyCode::Right => {
            binding.move_right();
            KeyOutcome::Redraw
        }
        KeyCode::Up => {
            binding.move_up();
            KeyOutcome::Redraw
        }
        KeyCode::Down => {
            binding.move_down();
            KeyOutcome::Redraw
        }
        KeyCode::Home => {
            binding.move_line_start();
            KeyOutcome::Redraw
        }
        KeyCode::End => {
            binding.move_line_end();
            KeyOutcome::Redraw
        }
        KeyCode::Backspace => {
            binding.backspace(now);
            KeyOutcome::Redraw
        }
        KeyCode::Delete => {
            binding.delete_forward(now);
            KeyOutcome::Redraw
        }
        KeyCode::Enter => {
            binding.insert_char('\n', now);
            KeyOutcome::Redraw
        }
        KeyCode::Tab => {
            binding.insert_char(' ', now);
            binding.insert_char(' ', now);
            KeyOutcome::Redraw
        }
        KeyCode::Char(ch) => {
            binding.insert_char(ch, now);
            KeyOutcome::Redraw
        }
        _ => KeyOutcome::Ignored,
    }
}

fn render<A: crate::api::RoomApi>(
    controller: &SyncController<A>,
    binding: &EditorBinding,
    scroll: &mut usize,
    status_msg: &str,
) -> Result<(), Box<dyn Error>> {
    let mut out = stdout();
    let (cols, rows) = terminal::size()?;
    let content_height = rows.saturating_sub(1) as usize;

    let text = binding.local_code();
    let (cursor_line, _) = cursor_line_col(text, binding.cursor());
    if cursor_line < *scroll {
        *scroll = cursor_line;
    } else if cursor_line >= *scroll + content_height {
        *scroll = cursor_line + 1 - content_height;
    }

    queue!(out, MoveTo(0, 0), Clear(ClearType::All))?;

    let lines: Vec<&str> = text.split('\n').collect();
    let start = (*scroll).min(lines.len());
    let end = (start + content_height).min(lines.len());
    for (row, line) in lines[start..end].iter().enumerate() {
        let clipped = clip_line(line, cols as usize);
        queue!(out, MoveTo(0, row as u16))?;
        out.write_all(clipped.as_bytes())?;
    }

    render_cursor_block(
        &mut out,
        text,
        *scroll,
        content_height,
        cols as usize,
        binding.cursor(),
    )?;

    let store = controller.store();
    let badge = if store.is_connected() {
        "online"
    } else {
        "OFFLINE"
    };
    let room_name = store
        .active_room()
        .map(|room| room.name.as_str())
        .unwrap_or("?");
    let notice = match store.error() {
        Some(error) => format!("error: {error} (Ctrl+E dismiss)"),
        None => status_msg.to_string(),
    };
    let status = format!(
        "[{}] {} | lang={} users={} | {} | Esc quit, Ctrl+R resync",
        badge,
        room_name,
        store.language(),
        store.connected_users().len(),
        notice,
    );

    queue!(out, MoveTo(0, rows.saturating_sub(1)))?;
    queue!(out, Clear(ClearType::CurrentLine))?;
    if store.error().is_some() {
        queue!(out, SetForegroundColor(Color::Red))?;
    } else if !store.is_connected() {
        queue!(out, SetForegroundColor(Color::Yellow))?;
    }
    out.write_all(clip_line(&status, cols as usize).as_bytes())?;
    queue!(out, SetAttribute(Attribute::Reset))?;

    out.flush()?;
    Ok(())
}

fn render_cursor_block(
    out: &mut std::io::Stdout,
    text: &str,
    scroll: usize,
    content_height: usize,
    cols: usize,
    cursor_byte: usize,
) -> Result<(), Box<dyn Error>> {
    let (line, col) = cursor_line_col(text, cursor_byte);
    if line < scroll || line >= scroll + content_height {
        return Ok(());
    }
    let row = (line - scroll) as u16;
    let col = col.min(cols.saturating_sub(1)) as u16;
    let cell = char_at(text, cursor_byte).unwrap_or(' ');
    queue!(
        out,
        MoveTo(col, row),
        SetBackgroundColor(Color::White),
        SetForegroundColor(Color::Black)
    )?;
    out.write_all(cell.to_string().as_bytes())?;
    queue!(out, SetAttribute(Attribute::Reset))?;
    Ok(())
}

fn clip_line(line: &str, max_width: usize) -> String {
    if max_width == 0 {
        return String::new();
    }
    line.chars().take(max_width).collect()
}

fn char_at(text: &str, pos: usize) -> Option<char> {
    let pos = clamp_to_boundary(text, pos);
    if pos >= text.len() {
        return None;
    }
    text[pos..].chars().next()
}
