//! ANSI colors for terminal summaries.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
    Yellow,
    White,
}

impl Color {
    fn code(self) -> u8 {
        match self {
            Color::Red => 31,
            Color::Green => 32,
            Color::Yellow => 33,
            Color::White => 37,
        }
    }
}

pub fn color(text: &str, col: Color, bold: bool) -> String {
    let weight = if bold { 1 } else { 0 };
    format!("\x1b[{};{}m{}\x1b[0m", weight, col.code(), text)
}

pub fn bold(text: &str) -> String {
    format!("\x1b[1m{}\x1b[0m", text)
}

/// Remove ANSI escape sequences, e.g. to compare printed summaries.
pub fn strip(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
