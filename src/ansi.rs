//! ANSI escape sequence interpretation for process output.
//!
//! Decoded text goes in, styled runs come out. The style state is passed in and handed back
//! explicitly so every output stream keeps its own state across chunks and never sees
//! another stream's attributes.

use crossterm::style::{Attribute, Attributes, ContentStyle};
use ratatui::style::{Modifier, Style};
use ratatui::text::Span;

const ESC: char = '\x1b';
/// Single-character control sequence introducer (C1 form of `ESC [`).
const CSI: char = '\u{9b}';
/// Longest incomplete escape sequence held back for the next chunk.
const MAX_PENDING_ESCAPE: usize = 256;

/// A terminal color with 256-color indices already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    BrightBlack,
    BrightRed,
    BrightGreen,
    BrightYellow,
    BrightBlue,
    BrightMagenta,
    BrightCyan,
    BrightWhite,
    Rgb(u8, u8, u8),
}

const PALETTE: [Color; 16] = [
    Color::Black,
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::White,
    Color::BrightBlack,
    Color::BrightRed,
    Color::BrightGreen,
    Color::BrightYellow,
    Color::BrightBlue,
    Color::BrightMagenta,
    Color::BrightCyan,
    Color::BrightWhite,
];

impl Color {
    /// Resolves an xterm 256-color index.
    ///
    /// 0-15 are the fixed palette, 16-231 a 6x6x6 cube, 232-255 a 24-step gray ramp.
    pub fn indexed(index: u8) -> Color {
        match index {
            0..=15 => PALETTE[usize::from(index)],
            16..=231 => {
                let i = index - 16;
                Color::Rgb(cube_level(i / 36), cube_level((i % 36) / 6), cube_level(i % 6))
            }
            _ => {
                let gray = 8 + (index - 232) * 10;
                Color::Rgb(gray, gray, gray)
            }
        }
    }

    fn basic(offset: u32, bright: bool) -> Color {
        let base = if bright { 8 } else { 0 };
        PALETTE[base + (offset & 7) as usize]
    }

    /// The matching ratatui color for the output pane.
    pub fn to_tui(self) -> ratatui::style::Color {
        use ratatui::style::Color as Tui;
        match self {
            Color::Black => Tui::Black,
            Color::Red => Tui::Red,
            Color::Green => Tui::Green,
            Color::Yellow => Tui::Yellow,
            Color::Blue => Tui::Blue,
            Color::Magenta => Tui::Magenta,
            Color::Cyan => Tui::Cyan,
            Color::White => Tui::Gray,
            Color::BrightBlack => Tui::DarkGray,
            Color::BrightRed => Tui::LightRed,
            Color::BrightGreen => Tui::LightGreen,
            Color::BrightYellow => Tui::LightYellow,
            Color::BrightBlue => Tui::LightBlue,
            Color::BrightMagenta => Tui::LightMagenta,
            Color::BrightCyan => Tui::LightCyan,
            Color::BrightWhite => Tui::White,
            Color::Rgb(r, g, b) => Tui::Rgb(r, g, b),
        }
    }

    /// The matching crossterm color for headless printing.
    pub fn to_crossterm(self) -> crossterm::style::Color {
        use crossterm::style::Color as Term;
        match self {
            Color::Black => Term::Black,
            Color::Red => Term::DarkRed,
            Color::Green => Term::DarkGreen,
            Color::Yellow => Term::DarkYellow,
            Color::Blue => Term::DarkBlue,
            Color::Magenta => Term::DarkMagenta,
            Color::Cyan => Term::DarkCyan,
            Color::White => Term::Grey,
            Color::BrightBlack => Term::DarkGrey,
            Color::BrightRed => Term::Red,
            Color::BrightGreen => Term::Green,
            Color::BrightYellow => Term::Yellow,
            Color::BrightBlue => Term::Blue,
            Color::BrightMagenta => Term::Magenta,
            Color::BrightCyan => Term::Cyan,
            Color::BrightWhite => Term::White,
            Color::Rgb(r, g, b) => Term::Rgb { r, g, b },
        }
    }

    /// CSS color value, using a dark-theme palette for the 16 named colors.
    pub fn css(self) -> String {
        let hex = match self {
            Color::Black => "#000000",
            Color::Red => "#cd3131",
            Color::Green => "#0dbc79",
            Color::Yellow => "#e5e510",
            Color::Blue => "#2472c8",
            Color::Magenta => "#bc3fbc",
            Color::Cyan => "#11a8cd",
            Color::White => "#e5e5e5",
            Color::BrightBlack => "#666666",
            Color::BrightRed => "#f14c4c",
            Color::BrightGreen => "#23d18b",
            Color::BrightYellow => "#f5f543",
            Color::BrightBlue => "#3b8eea",
            Color::BrightMagenta => "#d670d6",
            Color::BrightCyan => "#29b8db",
            Color::BrightWhite => "#ffffff",
            Color::Rgb(r, g, b) => return format!("rgb({}, {}, {})", r, g, b),
        };
        hex.to_string()
    }
}

fn cube_level(step: u8) -> u8 {
    if step == 0 {
        0
    } else {
        55 + step * 40
    }
}

/// Graphic attributes in effect for one output stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StyleState {
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
    pub foreground: Option<Color>,
    pub background: Option<Color>,
}

impl StyleState {
    pub fn is_default(&self) -> bool {
        *self == StyleState::default()
    }

    fn apply_op(&mut self, op: SgrOp) {
        match op {
            SgrOp::Reset => *self = StyleState::default(),
            SgrOp::Bold => self.bold = true,
            SgrOp::Dim => self.dim = true,
            SgrOp::Italic => self.italic = true,
            SgrOp::Underline => self.underline = true,
            SgrOp::NormalIntensity => {
                self.bold = false;
                self.dim = false;
            }
            SgrOp::NotItalic => self.italic = false,
            SgrOp::NotUnderlined => self.underline = false,
            SgrOp::Foreground(color) => self.foreground = Some(color),
            SgrOp::Background(color) => self.background = Some(color),
            SgrOp::DefaultForeground => self.foreground = None,
            SgrOp::DefaultBackground => self.background = None,
        }
    }

    /// Converts to a ratatui style for the output pane.
    pub fn to_style(&self) -> Style {
        let mut style = Style::default();
        if let Some(color) = self.foreground {
            style = style.fg(color.to_tui());
        }
        if let Some(color) = self.background {
            style = style.bg(color.to_tui());
        }
        let mut modifiers = Modifier::empty();
        if self.bold {
            modifiers |= Modifier::BOLD;
        }
        if self.dim {
            modifiers |= Modifier::DIM;
        }
        if self.italic {
            modifiers |= Modifier::ITALIC;
        }
        if self.underline {
            modifiers |= Modifier::UNDERLINED;
        }
        if !modifiers.is_empty() {
            style = style.add_modifier(modifiers);
        }
        style
    }

    /// Converts to a crossterm style for printing straight to a terminal.
    pub fn to_content_style(&self) -> ContentStyle {
        let mut attributes = Attributes::default();
        if self.bold {
            attributes.set(Attribute::Bold);
        }
        if self.dim {
            attributes.set(Attribute::Dim);
        }
        if self.italic {
            attributes.set(Attribute::Italic);
        }
        if self.underline {
            attributes.set(Attribute::Underlined);
        }
        ContentStyle {
            foreground_color: self.foreground.map(Color::to_crossterm),
            background_color: self.background.map(Color::to_crossterm),
            underline_color: None,
            attributes,
        }
    }

    /// Inline CSS for this state, or `None` when nothing is set.
    pub fn css(&self) -> Option<String> {
        let mut rules = Vec::new();
        if self.bold {
            rules.push("font-weight: bold".to_string());
        }
        if self.dim {
            rules.push("opacity: 0.5".to_string());
        }
        if self.italic {
            rules.push("font-style: italic".to_string());
        }
        if self.underline {
            rules.push("text-decoration: underline".to_string());
        }
        if let Some(color) = self.foreground {
            rules.push(format!("color: {}", color.css()));
        }
        if let Some(color) = self.background {
            rules.push(format!("background-color: {}", color.css()));
        }
        if rules.is_empty() {
            None
        } else {
            Some(rules.join("; "))
        }
    }
}

/// A contiguous span of output sharing one style snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledRun {
    pub text: String,
    /// `None` when the stream was in its default state.
    pub style: Option<StyleState>,
}

impl StyledRun {
    #[cfg(test)]
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: None,
        }
    }

    pub fn styled(text: impl Into<String>, style: StyleState) -> Self {
        Self {
            text: text.into(),
            style: (!style.is_default()).then_some(style),
        }
    }

    pub fn to_span(&self) -> Span<'static> {
        match &self.style {
            Some(style) => Span::styled(self.text.clone(), style.to_style()),
            None => Span::raw(self.text.clone()),
        }
    }

    /// HTML markup for this run with the text escaped.
    pub fn to_html(&self) -> String {
        let escaped = escape_html(&self.text);
        match self.style.as_ref().and_then(StyleState::css) {
            Some(css) => format!("<span style=\"{}\">{}</span>", css, escaped),
            None => escaped,
        }
    }
}

/// Concatenated markup for a sequence of runs.
pub fn render_html(runs: &[StyledRun]) -> String {
    runs.iter().map(StyledRun::to_html).collect()
}

/// Escapes `& < > " '` for embedding in markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// One attribute change decoded from an SGR parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgrOp {
    Reset,
    Bold,
    Dim,
    Italic,
    Underline,
    NormalIntensity,
    NotItalic,
    NotUnderlined,
    Foreground(Color),
    Background(Color),
    DefaultForeground,
    DefaultBackground,
}

/// Decodes an SGR parameter string (the part between `ESC [` and `m`).
pub fn parse_sgr(params: &str) -> Vec<SgrOp> {
    let values = parse_params(params);
    let mut ops = Vec::with_capacity(values.len());
    let mut i = 0;
    while i < values.len() {
        let code = values[i];
        i += 1;
        // Unparsable parameters keep their slot but select nothing.
        let Some(code) = code else {
            continue;
        };
        let op = match code {
            0 => SgrOp::Reset,
            1 => SgrOp::Bold,
            2 => SgrOp::Dim,
            3 => SgrOp::Italic,
            4 => SgrOp::Underline,
            22 => SgrOp::NormalIntensity,
            23 => SgrOp::NotItalic,
            24 => SgrOp::NotUnderlined,
            30..=37 => SgrOp::Foreground(Color::basic(code - 30, false)),
            90..=97 => SgrOp::Foreground(Color::basic(code - 90, true)),
            40..=47 => SgrOp::Background(Color::basic(code - 40, false)),
            100..=107 => SgrOp::Background(Color::basic(code - 100, true)),
            39 => SgrOp::DefaultForeground,
            49 => SgrOp::DefaultBackground,
            38 | 48 => {
                let Some((consumed, color)) = parse_extended_color(&values[i..]) else {
                    continue;
                };
                i += consumed;
                if code == 38 {
                    SgrOp::Foreground(color)
                } else {
                    SgrOp::Background(color)
                }
            }
            _ => continue,
        };
        ops.push(op);
    }
    ops
}

fn parse_params(params: &str) -> Vec<Option<u32>> {
    if params.is_empty() {
        return vec![Some(0)];
    }
    params
        .split(';')
        .map(|part| {
            if part.is_empty() {
                Some(0)
            } else {
                part.parse::<u32>().ok()
            }
        })
        .collect()
}

// Returns how many parameters after the 38/48 introducer were consumed.
fn parse_extended_color(values: &[Option<u32>]) -> Option<(usize, Color)> {
    let channel = |at: usize| -> Option<u8> { u8::try_from((*values.get(at)?)?).ok() };
    match (*values.first()?)? {
        5 => Some((2, Color::indexed(channel(1)?))),
        2 => Some((4, Color::Rgb(channel(1)?, channel(2)?, channel(3)?))),
        _ => None,
    }
}

enum Escape<'a> {
    Sgr(&'a str),
    Ignored,
    Incomplete,
}

// `rest` starts at ESC or CSI. Returns the sequence and its length in bytes.
fn scan_escape(rest: &str) -> (Escape<'_>, usize) {
    let mut chars = rest.char_indices();
    let body_start = match chars.next() {
        Some((_, CSI)) => CSI.len_utf8(),
        Some(_) => match chars.next() {
            None => return (Escape::Incomplete, rest.len()),
            Some((at, '[')) => at + 1,
            Some((at, ']')) => return scan_osc(rest, at + 1),
            Some((at, _)) => return scan_other(rest, at),
        },
        None => return (Escape::Incomplete, 0),
    };
    let body = &rest[body_start..];
    for (end, ch) in body.char_indices() {
        match ch {
            '@'..='~' => {
                let len = body_start + end + 1;
                return if ch == 'm' {
                    (Escape::Sgr(&body[..end]), len)
                } else {
                    (Escape::Ignored, len)
                };
            }
            ' '..='?' => continue,
            // Not a valid control sequence: drop the introducer, keep the text.
            _ => return (Escape::Ignored, body_start + end),
        }
    }
    (Escape::Incomplete, rest.len())
}

// Operating system command: runs until BEL or ST.
fn scan_osc(rest: &str, start: usize) -> (Escape<'_>, usize) {
    let body = &rest[start..];
    for (i, ch) in body.char_indices() {
        match ch {
            '\x07' | '\u{9c}' => return (Escape::Ignored, start + i + ch.len_utf8()),
            ESC => {
                let after = &body[i + 1..];
                if after.starts_with('\\') {
                    return (Escape::Ignored, start + i + 2);
                }
                if after.is_empty() {
                    return (Escape::Incomplete, rest.len());
                }
                return (Escape::Ignored, start + i);
            }
            _ => {}
        }
    }
    (Escape::Incomplete, rest.len())
}

// Two-character and nF escapes: intermediates 0x20-0x2F, then one final byte.
fn scan_other(rest: &str, start: usize) -> (Escape<'_>, usize) {
    for (i, ch) in rest[start..].char_indices() {
        match ch {
            ' '..='/' => continue,
            '0'..='~' => return (Escape::Ignored, start + i + 1),
            _ => return (Escape::Ignored, start + i),
        }
    }
    (Escape::Incomplete, rest.len())
}

/// Converts `text` into styled runs, starting from `state`.
///
/// Returns the runs and the state in effect at the end of `text`. Escape sequences and
/// control characters other than `\n`, `\r` and `\t` never appear in run text. A trailing
/// incomplete escape sequence is dropped; use [`AnsiStream`] to carry it into the next chunk.
pub fn apply(state: StyleState, text: &str) -> (Vec<StyledRun>, StyleState) {
    let mut state = state;
    let mut runs: Vec<StyledRun> = Vec::new();
    let mut buffer = String::new();
    let mut idx = 0;

    while let Some(ch) = text[idx..].chars().next() {
        if ch == ESC || ch == CSI {
            let (escape, len) = scan_escape(&text[idx..]);
            if let Escape::Sgr(params) = escape {
                let mut next = state;
                for op in parse_sgr(params) {
                    next.apply_op(op);
                }
                if next != state {
                    flush_run(&mut runs, &mut buffer, &state);
                    state = next;
                }
            }
            idx += len.max(ch.len_utf8());
            continue;
        }
        if !ch.is_control() || matches!(ch, '\n' | '\r' | '\t') {
            buffer.push(ch);
        }
        idx += ch.len_utf8();
    }
    flush_run(&mut runs, &mut buffer, &state);
    (runs, state)
}

fn flush_run(runs: &mut Vec<StyledRun>, buffer: &mut String, state: &StyleState) {
    if buffer.is_empty() {
        return;
    }
    let run = StyledRun::styled(std::mem::take(buffer), *state);
    match runs.last_mut() {
        Some(last) if last.style == run.style => last.text.push_str(&run.text),
        _ => runs.push(run),
    }
}

/// Style state plus any escape sequence split across a chunk boundary.
#[derive(Debug, Default)]
pub struct AnsiStream {
    style: StyleState,
    pending: String,
}

impl AnsiStream {
    pub fn style(&self) -> StyleState {
        self.style
    }

    /// Interprets decoded text, holding back an escape sequence cut off at the end.
    pub fn push(&mut self, text: &str) -> Vec<StyledRun> {
        let mut combined = std::mem::take(&mut self.pending);
        combined.push_str(text);
        if let Some(at) = incomplete_escape_start(&combined) {
            if combined.len() - at <= MAX_PENDING_ESCAPE {
                self.pending = combined.split_off(at);
            }
        }
        let (runs, style) = apply(self.style, &combined);
        self.style = style;
        runs
    }

    /// Emits whatever text is still held and resets the stream.
    pub fn finish(&mut self) -> Vec<StyledRun> {
        let pending = std::mem::take(&mut self.pending);
        let (runs, _) = apply(self.style, &pending);
        self.style = StyleState::default();
        runs
    }
}

fn incomplete_escape_start(text: &str) -> Option<usize> {
    let at = text.rfind(|c| c == ESC || c == CSI)?;
    match scan_escape(&text[at..]) {
        (Escape::Incomplete, _) => Some(at),
        _ => None,
    }
}
