use std::io::{self, Stdout, Write};

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::style::{
    Attribute, Color as TermColor, Print, ResetColor, SetAttribute, SetBackgroundColor,
    SetForegroundColor,
};
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, Clear, ClearType, DisableLineWrap, EnableLineWrap,
    EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::{execute, queue};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;

/// Where frames go. The live terminal and tests implement it.
pub trait Screen {
    fn size(&self) -> io::Result<(u16, u16)>;
    fn draw(&mut self, frame: &[Line<'static>]) -> io::Result<()>;
}

/// Writes one frame from the top-left anchor. Every line is clipped to
/// `width` and followed by an erase to end of line, and everything below
/// the last line is erased.
pub fn write_frame<W: Write>(out: &mut W, frame: &[Line<'_>], width: u16) -> io::Result<()> {
    let width = usize::from(width);
    for (row, line) in frame.iter().enumerate() {
        let row = u16::try_from(row).unwrap_or(u16::MAX);
        queue!(out, MoveTo(0, row))?;
        let mut remaining = width;
        for span in &line.spans {
            if remaining == 0 {
                break;
            }
            let style = line.style.patch(span.style);
            let text = span
                .content
                .chars()
                .take(remaining)
                .collect::<String>();
            remaining -= text.chars().count();
            apply_style(out, style)?;
            queue!(out, Print(text), SetAttribute(Attribute::Reset), ResetColor)?;
        }
        queue!(out, Clear(ClearType::UntilNewLine))?;
    }
    queue!(out, Clear(ClearType::FromCursorDown))?;
    out.flush()
}

fn apply_style<W: Write>(out: &mut W, style: Style) -> io::Result<()> {
    if let Some(fg) = style.fg {
        queue!(out, SetForegroundColor(term_color(fg)))?;
    }
    if let Some(bg) = style.bg {
        queue!(out, SetBackgroundColor(term_color(bg)))?;
    }
    let modifiers = [
        (Modifier::BOLD, Attribute::Bold),
        (Modifier::DIM, Attribute::Dim),
        (Modifier::ITALIC, Attribute::Italic),
        (Modifier::UNDERLINED, Attribute::Underlined),
        (Modifier::REVERSED, Attribute::Reverse),
    ];
    for (modifier, attribute) in modifiers {
        if style.add_modifier.contains(modifier) {
            queue!(out, SetAttribute(attribute))?;
        }
    }
    Ok(())
}

fn term_color(color: Color) -> TermColor {
    match color {
        Color::Reset => TermColor::Reset,
        Color::Black => TermColor::Black,
        Color::Red => TermColor::DarkRed,
        Color::Green => TermColor::DarkGreen,
        Color::Yellow => TermColor::DarkYellow,
        Color::Blue => TermColor::DarkBlue,
        Color::Magenta => TermColor::DarkMagenta,
        Color::Cyan => TermColor::DarkCyan,
        Color::Gray => TermColor::Grey,
        Color::DarkGray => TermColor::DarkGrey,
        Color::LightRed => TermColor::Red,
        Color::LightGreen => TermColor::Green,
        Color::LightYellow => TermColor::Yellow,
        Color::LightBlue => TermColor::Blue,
        Color::LightMagenta => TermColor::Magenta,
        Color::LightCyan => TermColor::Cyan,
        Color::White => TermColor::White,
        Color::Rgb(r, g, b) => TermColor::Rgb { r, g, b },
        Color::Indexed(index) => TermColor::AnsiValue(index),
    }
}

/// The live terminal: alternate screen, raw mode, hidden cursor. Restored
/// on `leave` or drop.
pub struct TerminalScreen {
    out: Stdout,
    active: bool,
}

impl TerminalScreen {
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut screen = Self {
            out: io::stdout(),
            active: true,
        };
        execute!(
            screen.out,
            EnterAlternateScreen,
            DisableLineWrap,
            Hide,
            Clear(ClearType::All)
        )?;
        Ok(screen)
    }

    /// Restores the terminal so the summary prints to the normal scrollback.
    pub fn leave(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        disable_raw_mode()?;
        execute!(self.out, LeaveAlternateScreen, EnableLineWrap, Show)
    }
}

impl Drop for TerminalScreen {
    fn drop(&mut self) {
        let _ = self.leave();
    }
}

impl Screen for TerminalScreen {
    fn size(&self) -> io::Result<(u16, u16)> {
        terminal::size()
    }

    fn draw(&mut self, frame: &[Line<'static>]) -> io::Result<()> {
        let (width, _) = terminal::size()?;
        write_frame(&mut self.out, frame, width)
    }
}

#[cfg(test)]
mod tests {
    use ratatui::text::Span;

    use super::*;

    fn written(frame: &[Line<'_>], width: u16) -> String {
        let mut out = Vec::new();
        write_frame(&mut out, frame, width).expect("frame");
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn every_line_is_followed_by_an_erase_to_end_of_line() {
        let output = written(
            &[
                Line::from("provisioning"),
                Line::default(),
                Line::from("sup-M1-0"),
            ],
            40,
        );

        assert_eq!(output.matches("\u{1b}[K").count(), 3);
        assert!(output.starts_with("\u{1b}[1;1H"));
        assert!(output.contains("\u{1b}[2;1H"));
        assert!(output.contains("\u{1b}[3;1Hsup-M1-0"));
        assert!(output.ends_with("\u{1b}[K\u{1b}[J"));
    }

    #[test]
    fn wide_lines_are_clipped_to_the_terminal_width() {
        let output = written(
            &[Line::from(vec![
                Span::raw("sup-M1-0 "),
                Span::raw("installing"),
            ])],
            12,
        );

        assert!(output.contains("sup-M1-0 "));
        assert!(output.contains("ins"));
        assert!(!output.contains("inst"));
    }

    #[test]
    fn styles_map_to_terminal_attributes() {
        let output = written(
            &[Line::from(Span::styled(
                "✕",
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            ))],
            10,
        );

        assert!(output.contains("\u{1b}[38;5;1m"));
        assert!(output.contains("\u{1b}[1m"));
        assert!(output.contains("✕"));
    }
}
