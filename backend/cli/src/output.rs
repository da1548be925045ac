//! Terminal output: colored notes and call tables.

use std::io::IsTerminal;

use callhub_core::{CallDirection, CallStatus};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

/// Color only on a terminal, and never with `NO_COLOR` set.
fn use_color() -> bool {
    std::env::var_os("NO_COLOR").is_none()
        && std::io::stdout().is_terminal()
        && std::env::var("TERM").map_or(true, |term| term != "dumb")
}

/// Display width of `text` with escape sequences removed.
fn visible_width(text: &str) -> usize {
    let mut width = 0;
    let mut in_escape = false;
    for c in text.chars() {
        match (in_escape, c) {
            (false, '\x1b') => in_escape = true,
            (true, 'm') => in_escape = false,
            (true, _) => {}
            (false, _) => width += 1,
        }
    }
    width
}

#[derive(Clone, Copy)]
enum Tone {
    Info,
    Warn,
    Error,
    Success,
}

impl Tone {
    fn marker(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Tone::Info => (CYAN, "ℹ", "INFO"),
            Tone::Warn => (YELLOW, "⚠", "WARN"),
            Tone::Error => (RED, "✗", "ERROR"),
            Tone::Success => (GREEN, "✓", "OK"),
        }
    }
}

fn note(tone: Tone, msg: &str) {
    let (color, glyph, word) = tone.marker();
    let line = if use_color() {
        format!("{color}{BOLD}{glyph}{RESET} {msg}")
    } else {
        format!("{word}: {msg}")
    };
    match tone {
        Tone::Error => eprintln!("{line}"),
        _ => println!("{line}"),
    }
}

pub fn note_info(msg: &str) {
    note(Tone::Info, msg);
}

pub fn note_warn(msg: &str) {
    note(Tone::Warn, msg);
}

pub fn note_error(msg: &str) {
    note(Tone::Error, msg);
}

pub fn note_success(msg: &str) {
    note(Tone::Success, msg);
}

/// Status word, colored by outcome.
pub fn status_label(status: CallStatus) -> String {
    if !use_color() {
        return status.to_string();
    }
    let color = match status {
        CallStatus::Connected => GREEN,
        CallStatus::Connecting | CallStatus::Reconnecting => YELLOW,
        CallStatus::Failed => RED,
        CallStatus::Idle | CallStatus::Disconnected => DIM,
    };
    format!("{color}{status}{RESET}")
}

pub fn direction_label(direction: CallDirection) -> &'static str {
    match direction {
        CallDirection::Inbound => "in",
        CallDirection::Outbound => "out",
    }
}

/// `m:ss`, or `-` when unknown.
pub fn format_duration(seconds: Option<u64>) -> String {
    match seconds {
        Some(s) => format!("{}:{:02}", s / 60, s % 60),
        None => "-".to_string(),
    }
}

/// A table column; numbers read better right-aligned.
pub struct Column {
    title: &'static str,
    right: bool,
}

impl Column {
    pub fn left(title: &'static str) -> Self {
        Self { title, right: false }
    }

    pub fn right(title: &'static str) -> Self {
        Self { title, right: true }
    }

    fn fit(&self, cell: &str, width: usize) -> String {
        let fill = " ".repeat(width.saturating_sub(visible_width(cell)));
        if self.right {
            format!("{fill}{cell}")
        } else {
            format!("{cell}{fill}")
        }
    }
}

/// Header, a dashed rule, then one line per row, each indented two spaces.
pub fn render_table(columns: &[Column], rows: &[Vec<String>]) -> String {
    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| visible_width(cell))
                .chain(std::iter::once(visible_width(column.title)))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |cells: Vec<String>| format!("  {}\n", cells.join("  "));
    let mut table = line(
        columns
            .iter()
            .zip(&widths)
            .map(|(column, &width)| column.fit(column.title, width))
            .collect(),
    );
    table += &line(widths.iter().map(|&width| "-".repeat(width)).collect());
    for row in rows {
        table += &line(
            columns
                .iter()
                .zip(&widths)
                .enumerate()
                .map(|(i, (column, &width))| {
                    column.fit(row.get(i).map_or("", String::as_str), width)
                })
                .collect(),
        );
    }
    table
}
