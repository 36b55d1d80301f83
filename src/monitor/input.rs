use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Result of one bounded wait for user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Elapsed,
    Cancel,
    Other,
}

/// The driver's single timed wait: it returns early only when input
/// arrives.
pub trait InputSource {
    fn wait(&mut self, timeout: Duration) -> io::Result<Wait>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyboardInput;

impl InputSource for KeyboardInput {
    fn wait(&mut self, timeout: Duration) -> io::Result<Wait> {
        if !event::poll(timeout)? {
            return Ok(Wait::Elapsed);
        }
        Ok(match event::read()? {
            Event::Key(key) if is_cancel_key(&key) => Wait::Cancel,
            _ => Wait::Other,
        })
    }
}

/// `q`, `Esc` and `Ctrl-C`. Raw mode delivers Ctrl-C as a key.
pub fn is_cancel_key(key: &KeyEvent) -> bool {
    if key.kind == KeyEventKind::Release {
        return false;
    }
    match key.code {
        KeyCode::Char('c') | KeyCode::Char('C') => key.modifiers.contains(KeyModifiers::CONTROL),
        KeyCode::Char('q') | KeyCode::Esc => !key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}
