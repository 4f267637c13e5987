use tokio::time::{Duration, Instant};

/// Quiet window before a burst of keystrokes becomes one network send.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Binds the raw editor surface to the synchronization controller.
///
/// `local_code` is what the user sees and is updated on every keystroke so
/// typing never waits on the network. Propagation is debounced: a send
/// fires only after `DEBOUNCE_WINDOW` of inactivity, coalescing a burst
/// into one `handle_local_edit` call. After a debounced send one
/// apply-authoritative cycle is skipped so the echo of our own change
/// cannot clobber the cursor mid-word.
#[derive(Debug)]
pub struct EditorBinding {
    local_code: String,
    cursor: usize,
    debounce: Duration,
    deadline: Option<Instant>,
    skip_next_update: bool,
}

impl EditorBinding {
    pub fn new(initial: &str) -> Self {
        Self::with_debounce(initial, DEBOUNCE_WINDOW)
    }

    pub fn with_debounce(initial: &str, debounce: Duration) -> Self {
        Self {
            local_code: initial.to_string(),
            cursor: initial.len(),
            debounce,
            deadline: None,
            skip_next_update: false,
        }
    }

    pub fn local_code(&self) -> &str {
        &self.local_code
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The pending send deadline, if any keystroke is waiting to propagate.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn insert_char(&mut self, ch: char, now: Instant) {
        self.local_code.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
        self.touch(now);
    }

    pub fn backspace(&mut self, now: Instant) {
        if self.cursor == 0 {
            return;
        }
        let start = prev_char_boundary(&self.local_code, self.cursor);
        self.local_code.replace_range(start..self.cursor, "");
        self.cursor = start;
        self.touch(now);
    }

    pub fn delete_forward(&mut self, now: Instant) {
        if self.cursor >= self.local_code.len() {
            return;
        }
        let end = next_char_boundary(&self.local_code, self.cursor);
        self.local_code.replace_range(self.cursor..end, "");
        self.touch(now);
    }

    pub fn move_left(&mut self) {
        self.cursor = prev_char_boundary(&self.local_code, self.cursor);
    }

    pub fn move_right(&mut self) {
        self.cursor = next_char_boundary(&self.local_code, self.cursor);
    }

    pub fn move_up(&mut self) {
        self.cursor = move_cursor_vertical(&self.local_code, self.cursor, -1);
    }

    pub fn move_down(&mut self) {
        self.cursor = move_cursor_vertical(&self.local_code, self.cursor, 1);
    }

    pub fn move_line_start(&mut self) {
        self.cursor = line_start(&self.local_code, self.cursor);
    }

    pub fn move_line_end(&mut self) {
        self.cursor = line_end(&self.local_code, self.cursor);
    }

    /// Returns the buffer to propagate once the quiet window has elapsed,
    /// arming the one-cycle echo shield. Returns `None` while keystrokes
    /// are still coming in.
    pub fn take_due(&mut self, now: Instant) -> Option<&str> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.skip_next_update = true;
                Some(&self.local_code)
            }
            _ => None,
        }
    }

    /// Folds the store's authoritative text into the local buffer.
    ///
    /// The first cycle after a debounced send is skipped (that change is
    /// our own). A genuine remote update overwrites the buffer, clamps
    /// the cursor and drops any unsent local edit; last writer wins.
    /// Returns whether the visible buffer changed.
    pub fn apply_authoritative(&mut self, text: &str) -> bool {
        if self.skip_next_update {
            self.skip_next_update = false;
            return false;
        }
        if self.local_code == text {
            return false;
        }
        self.local_code = text.to_string();
        self.cursor = clamp_to_boundary(&self.local_code, self.cursor);
        self.deadline = None;
        true
    }

    /// Drops a pending unsent edit. Called on teardown.
    pub fn cancel_pending(&mut self) {
        self.deadline = None;
    }

    fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.debounce);
    }
}

pub(crate) fn clamp_to_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

pub(crate) fn prev_char_boundary(text: &str, pos: usize) -> usize {
    let mut pos = clamp_to_boundary(text, pos);
    if pos == 0 {
        return 0;
    }
    pos -= 1;
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

pub(crate) fn next_char_boundary(text: &str, pos: usize) -> usize {
    let mut pos = clamp_to_boundary(text, pos);
    if pos >= text.len() {
        return text.len();
    }
    pos += 1;
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos.min(text.len())
}

pub(crate) fn cursor_line_col(text: &str, cursor_byte: usize) -> (usize, usize) {
    let cursor_byte = clamp_to_boundary(text, cursor_byte);
    let mut line = 0usize;
    let mut col = 0usize;
    for ch in text[..cursor_byte].chars() {
        if ch == '\n' {
            line += 1;
            col = 0;
        } else {
            col += 1;
        }
    }
    (line, col)
}

fn line_start_positions(text: &str) -> Vec<usize> {
    let mut starts = vec![0usize];
    for (idx, ch) in text.char_indices() {
        if ch == '\n' {
            starts.push(idx + ch.len_utf8());
        }
    }
    starts
}

fn line_range(text: &str, starts: &[usize], line_idx: usize) -> (usize, usize) {
    let start = starts.get(line_idx).copied().unwrap_or(0);
    let mut end = if line_idx + 1 < starts.len() {
        starts[line_idx + 1]
    } else {
        text.len()
    };
    if end > start && text.as_bytes()[end - 1] == b'\n' {
        end -= 1;
    }
    (start, end)
}

fn line_start(text: &str, cursor_byte: usize) -> usize {
    let starts = line_start_positions(text);
    let (line_idx, _) = cursor_line_col(text, cursor_byte);
    starts.get(line_idx).copied().unwrap_or(0)
}

fn line_end(text: &str, cursor_byte: usize) -> usize {
    let starts = line_start_positions(text);
    let (line_idx, _) = cursor_line_col(text, cursor_byte);
    let (start, end) = line_range(text, &starts, line_idx);
    end.max(start)
}

fn move_cursor_vertical(text: &str, cursor_byte: usize, direction: i32) -> usize {
    let starts = line_start_positions(text);
    let (line_idx, col) = cursor_line_col(text, cursor_byte);
    let target_line = if direction < 0 {
        if line_idx == 0 {
            return cursor_byte;
        }
        line_idx - 1
    } else {
        if line_idx + 1 >= starts.len() {
            return cursor_byte;
        }
        line_idx + 1
    };
    let (start, end) = line_range(text, &starts, target_line);
    let line_text = &text[start..end];
    let mut byte_offset = 0usize;
    let mut count = 0usize;
    for ch in line_text.chars() {
        if count >= col {
            break;
        }
        byte_offset += ch.len_utf8();
        count += 1;
    }
    start + byte_offset
}
