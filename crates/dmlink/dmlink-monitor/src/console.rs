//! User-facing terminal abstraction.
//!
//! The monitor core never touches a terminal API directly. It writes
//! drained log bytes to a [`Console`] and asks it for input when the
//! firmware requests some. The crossterm implementation drives the real
//! terminal (raw mode for key-at-a-time prompts, echo suppression for
//! passwords); the scripted implementation answers from queues and
//! records everything, which is what the protocol tests run against.

use std::collections::VecDeque;
use std::io::{self, Write};

/// Terminal surface the monitor talks to.
///
/// Input calls may return `ErrorKind::WouldBlock` to signal "nothing to
/// give right now"; the monitor leaves the firmware's request pending
/// and asks again next tick.
pub trait Console {
    /// Writes drained (and timestamp-decorated) log bytes.
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Reads one line of input, terminator included. `echo` mirrors the
    /// firmware's prompt hint.
    fn read_line(&mut self, echo: bool) -> io::Result<String>;

    /// Reads a single key.
    fn read_key(&mut self, echo: bool) -> io::Result<u8>;

    /// Puts the terminal back the way the user had it. Idempotent, and
    /// called on every shutdown path including interrupts.
    fn restore(&mut self);
}

/// Real terminal: stdout for output, stdin/crossterm for input.
pub struct TerminalConsole {
    raw_mode: bool,
}

impl TerminalConsole {
    pub fn new() -> Self {
        Self { raw_mode: false }
    }

    fn enter_raw(&mut self) -> io::Result<()> {
        if !self.raw_mode {
            crossterm::terminal::enable_raw_mode()?;
            self.raw_mode = true;
        }
        Ok(())
    }

    fn leave_raw(&mut self) {
        if self.raw_mode {
            let _ = crossterm::terminal::disable_raw_mode();
            self.raw_mode = false;
        }
    }

    /// Collects key events until Enter. Used instead of stdin's line
    /// reader whenever echo must be suppressed.
    fn read_line_raw(&mut self, echo: bool) -> io::Result<String> {
        use crossterm::event::{read, Event, KeyCode};

        self.enter_raw()?;
        let mut line = String::new();
        loop {
            if let Event::Key(key) = read()? {
                match key.code {
                    KeyCode::Enter => break,
                    KeyCode::Backspace => {
                        if line.pop().is_some() && echo {
                            let mut out = io::stdout();
                            out.write_all(b"\x08 \x08")?;
                            out.flush()?;
                        }
                    }
                    KeyCode::Char(c) => {
                        line.push(c);
                        if echo {
                            let mut out = io::stdout();
                            write!(out, "{c}")?;
                            out.flush()?;
                        }
                    }
                    _ => {}
                }
            }
        }
        self.leave_raw();
        let mut out = io::stdout();
        out.write_all(b"\r\n")?;
        out.flush()?;
        line.push('\n');
        Ok(line)
    }
}

impl Default for TerminalConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for TerminalConsole {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut out = io::stdout();
        out.write_all(bytes)?;
        out.flush()
    }

    fn read_line(&mut self, echo: bool) -> io::Result<String> {
        if echo {
            // Canonical mode: the terminal handles editing and echo.
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            Ok(line)
        } else {
            self.read_line_raw(false)
        }
    }

    fn read_key(&mut self, echo: bool) -> io::Result<u8> {
        use crossterm::event::{read, Event, KeyCode};

        self.enter_raw()?;
        let key = loop {
            if let Event::Key(key) = read()? {
                match key.code {
                    KeyCode::Enter => break b'\n',
                    KeyCode::Char(c) if c.is_ascii() => break c as u8,
                    _ => {}
                }
            }
        };
        self.leave_raw();
        if echo {
            let mut out = io::stdout();
            out.write_all(&[key])?;
            out.flush()?;
        }
        Ok(key)
    }

    fn restore(&mut self) {
        self.leave_raw();
    }
}

impl Drop for TerminalConsole {
    fn drop(&mut self) {
        self.leave_raw();
    }
}

/// Scripted console: canned input, captured output.
///
/// Input calls pop from the queues and return `WouldBlock` when empty,
/// so a monitor under test keeps ticking instead of blocking on a
/// keyboard that is not there.
#[derive(Default)]
pub struct ScriptedConsole {
    pub lines: VecDeque<String>,
    pub keys: VecDeque<u8>,
    pub output: Vec<u8>,
    /// Echo hints observed, in call order. Lets tests assert that a
    /// password prompt really arrived with echo suppressed.
    pub echo_log: Vec<bool>,
    pub restored: bool,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Captured output as text.
    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Console for ScriptedConsole {
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.extend_from_slice(bytes);
        Ok(())
    }

    fn read_line(&mut self, echo: bool) -> io::Result<String> {
        self.echo_log.push(echo);
        match self.lines.pop_front() {
            Some(mut line) => {
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                Ok(line)
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no scripted line")),
        }
    }

    fn read_key(&mut self, echo: bool) -> io::Result<u8> {
        self.echo_log.push(echo);
        self.keys
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no scripted key"))
    }

    fn restore(&mut self) {
        self.restored = true;
    }
}
