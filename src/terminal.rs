//! An interactive serial terminal for MicroPython devices.
//!
//! Unix only. The controlling terminal is put into a raw-ish mode (no echo,
//! no line buffering, Ctrl+C delivered as input rather than a signal) and a
//! `poll(2)` loop shuttles bytes between stdin and the device. A few
//! niceties are layered on top: multi-line bracketed pastes are replayed
//! through the REPL's paste mode, and Ctrl+L gets a clear-screen emulation.

use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{
    tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use termcolor::{BufferWriter, Color, ColorSpec, WriteColor};

use crate::connection::{timeout_override, Connection};
use crate::repl::{expect, interrupt_and_enter_repl, paste_exec, ReplError};

const CLEAR: &str = "\x1b[2J";
const CURSOR_HOME: &str = "\x1b[H";

const BRACKETED_PASTE_ENABLE: &str = "\x1b[?2004h";
const BRACKETED_PASTE_DISABLE: &str = "\x1b[?2004l";
const BRACKETED_PASTE_BEGIN: &str = "\x1b[200~";
const BRACKETED_PASTE_END: &str = "\x1b[201~";

/// Ctrl+], the default exit key.
pub const DEFAULT_EXIT_SEQUENCE: &str = "\x1d";

/// Options for [`serial_terminal`].
pub struct TerminalOptions {
    /// Input sequences which exit the terminal; the matched sequence is
    /// returned rather than forwarded to the device.
    pub exit_on: Vec<String>,
    /// Replay multi-line pastes through the REPL's paste mode.
    pub automatic_paste_mode: bool,
    /// Emulate clear-screen-on-Ctrl+L.
    pub emulate_ctrl_l: bool,
    /// Whether the terminal's own status messages may use color.
    pub color: termcolor::ColorChoice,
}

impl Default for TerminalOptions {
    fn default() -> TerminalOptions {
        TerminalOptions {
            exit_on: vec![DEFAULT_EXIT_SEQUENCE.to_string()],
            automatic_paste_mode: true,
            emulate_ctrl_l: true,
            color: termcolor::ColorChoice::Auto,
        }
    }
}

/// Print one dim grey status line to stdout, honouring the color choice.
///
/// Status lines are how the terminal (and the sync command wrapping it)
/// distinguishes its own chatter from device output.
pub fn print_status(color: termcolor::ColorChoice, message: &str) -> io::Result<()> {
    // termcolor leaves tty detection to the caller
    let color = match color {
        termcolor::ColorChoice::Auto if !io::stdout().is_terminal() => {
            termcolor::ColorChoice::Never
        }
        other => other,
    };

    let writer = BufferWriter::stdout(color);
    let mut buffer = writer.buffer();
    buffer.set_color(ColorSpec::new().set_fg(Some(Color::Black)).set_intense(true))?;
    write!(buffer, "{message}")?;
    buffer.reset()?;
    writeln!(buffer)?;
    writer.print(&buffer)
}

/// Restores the terminal's attributes when dropped.
struct TerminalModeGuard {
    original: Termios,
}

impl TerminalModeGuard {
    /// Disable echo, line buffering and conversion of keyboard interrupts
    /// into signals for the controlling terminal.
    fn enter() -> anyhow::Result<TerminalModeGuard> {
        let stdin = io::stdin();
        let original = tcgetattr(&stdin).context("not a terminal")?;

        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;

        Ok(TerminalModeGuard { original })
    }
}

impl Drop for TerminalModeGuard {
    fn drop(&mut self) {
        if let Err(err) = tcsetattr(&io::stdin(), SetArg::TCSANOW, &self.original) {
            log::warn!("failed to restore terminal attributes: {}", err);
        }
    }
}

/// Enables bracketed paste reporting for its lifetime.
struct BracketedPasteGuard;

impl BracketedPasteGuard {
    fn enter() -> io::Result<BracketedPasteGuard> {
        let mut stdout = io::stdout();
        stdout.write_all(BRACKETED_PASTE_ENABLE.as_bytes())?;
        stdout.flush()?;
        Ok(BracketedPasteGuard)
    }
}

impl Drop for BracketedPasteGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(BRACKETED_PASTE_DISABLE.as_bytes());
        let _ = stdout.flush();
    }
}

/// Matches a set of text sequences against a character stream, buffering
/// characters which might be the start of a match until the ambiguity is
/// resolved.
pub(crate) struct SequenceMatcher {
    sequences: Vec<String>,
    buffer: String,
}

pub(crate) enum Matched {
    /// Characters which definitely do not start any sequence.
    Output(String),
    /// A complete sequence was found; preceding passthrough text included.
    Sequence(String, String),
}

impl SequenceMatcher {
    pub fn new(sequences: Vec<String>) -> SequenceMatcher {
        SequenceMatcher {
            sequences,
            buffer: String::new(),
        }
    }

    /// Feed one character; returns what can be released so far.
    pub fn push(&mut self, ch: char) -> Matched {
        self.buffer.push(ch);
        let mut output = String::new();

        loop {
            if self.buffer.is_empty() {
                return Matched::Output(output);
            }
            if let Some(sequence) = self
                .sequences
                .iter()
                .find(|sequence| **sequence == self.buffer)
            {
                let sequence = sequence.clone();
                self.buffer.clear();
                return Matched::Sequence(output, sequence);
            }
            if self
                .sequences
                .iter()
                .any(|sequence| sequence.starts_with(self.buffer.as_str()))
            {
                // Could still become a match: keep buffering
                return Matched::Output(output);
            }
            // The head character can no longer start a match: release it and
            // re-examine the rest.
            let head = self.buffer.remove(0);
            output.push(head);
        }
    }
}

fn borrow_fd(fd: std::os::unix::io::RawFd) -> BorrowedFd<'static> {
    // SAFETY: the descriptor comes from a live Connection which outlives the
    // poll call it is used in.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// Incremental UTF-8 decoding with a carry buffer for split code points.
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn new() -> Utf8Decoder {
        Utf8Decoder {
            pending: Vec::new(),
        }
    }

    fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[..valid_up_to])
                            .expect("validated prefix"),
                    );
                    match err.error_len() {
                        // An invalid sequence: replace it and carry on
                        Some(error_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + error_len);
                        }
                        // Incomplete tail: keep it for the next read
                        None => {
                            self.pending.drain(..valid_up_to);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// The bare-minimum terminal: shuttle bytes until an exit sequence is typed.
///
/// Translates newlines to/from the CRLF the device expects and decodes the
/// device's UTF-8 output incrementally. Returns the matched exit sequence,
/// which is not forwarded to the device.
fn raw_serial_terminal(
    conn: &mut dyn Connection,
    exit_on: &[String],
) -> anyhow::Result<String> {
    let _mode = TerminalModeGuard::enter()?;
    let mut matcher = SequenceMatcher::new(exit_on.to_vec());
    let mut device_decoder = Utf8Decoder::new();
    let mut stdin_decoder = Utf8Decoder::new();

    let conn_fd = conn
        .raw_fd()
        .context("connection closed")?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        let mut fds = [
            PollFd::new(stdin.as_fd(), PollFlags::POLLIN),
            PollFd::new(borrow_fd(conn_fd), PollFlags::POLLIN),
        ];
        poll(&mut fds, PollTimeout::NONE)?;
        let stdin_ready = fds[0]
            .revents()
            .is_some_and(|events| !events.is_empty());
        let conn_ready = fds[1]
            .revents()
            .is_some_and(|events| !events.is_empty());

        if stdin_ready {
            let mut buf = [0u8; 1024];
            let count = stdin.lock().read(&mut buf)?;
            if count == 0 {
                anyhow::bail!("stdin closed");
            }
            let text = stdin_decoder.decode(&buf[..count]);
            let mut to_send = String::new();
            let mut matched = None;
            for ch in text.chars() {
                match matcher.push(ch) {
                    Matched::Output(output) => to_send.push_str(&output),
                    Matched::Sequence(output, sequence) => {
                        to_send.push_str(&output);
                        matched = Some(sequence);
                        break;
                    }
                }
            }
            if !to_send.is_empty() {
                // The device wants DOS-style newlines
                let to_send = to_send.replace('\n', "\r\n");
                conn.write(to_send.as_bytes())?;
                conn.flush()?;
            }
            if let Some(sequence) = matched {
                return Ok(sequence);
            }
        }

        if conn_ready {
            let data = conn.read_buffered()?;
            if data.is_empty() {
                anyhow::bail!("connection closed");
            }
            // Restore UNIX-style newlines
            let text = device_decoder.decode(&data).replace('\r', "");
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
    }
}

/// Read the remainder of a bracketed paste from stdin and send it to the
/// device: single-line pastes go verbatim, multi-line pastes go through the
/// REPL's paste mode (with a mock echo printed locally).
fn handle_bracketed_paste(
    conn: &mut dyn Connection,
    color: termcolor::ColorChoice,
) -> anyhow::Result<()> {
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();

    let mut buffer = String::new();
    let mut decoder = Utf8Decoder::new();
    while !buffer.ends_with(BRACKETED_PASTE_END) {
        let mut byte = [0u8; 1];
        if stdin.read(&mut byte)? == 0 {
            anyhow::bail!("stdin closed during paste");
        }
        buffer.push_str(&decoder.decode(&byte));
    }
    let content = &buffer[..buffer.len() - BRACKETED_PASTE_END.len()];

    // 'Single line' meaning all the non-whitespace is on one line
    let single_line = content.trim_matches(['\r', '\n']).lines().count() <= 1;

    if single_line {
        conn.write(content.replace('\n', "\r\n").as_bytes())?;
        return Ok(());
    }

    let result = (|| -> Result<(), ReplError> {
        // Make sure there is a clean prompt (no half-finished line edits)
        let interruption_output = interrupt_and_enter_repl(conn)?;
        stdout.write_all(&interruption_output)?;
        stdout.flush()?;

        paste_exec(conn, content)?;
        let mut echo = String::from("\n");
        for line in content.lines() {
            echo.push_str(&format!("=== {line}\n"));
        }
        stdout.write_all(echo.as_bytes())?;
        stdout.flush()?;
        Ok(())
    })();

    if result.is_err() {
        writeln!(stdout)?;
        stdout.flush()?;
        print_status(color, "upyt error: Failed paste using paste mode.")?;
    }
    Ok(())
}

/// Crudely emulate clear-screen: wipe the display and press return for a
/// fresh prompt.
fn handle_ctrl_l_emulation(conn: &mut dyn Connection) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "{CLEAR}{CURSOR_HOME}")?;
    stdout.flush()?;

    conn.write(b"\r\n")?;

    // Absorb the echoed newline so the new prompt lands on the first line.
    // We might not be at the REPL, so the echo is not guaranteed: short
    // timeout, failure ignored.
    let mut conn = timeout_override(conn, Duration::from_millis(100))?;
    let _ = expect(&mut *conn, b"\r\n");
    Ok(())
}

/// Run the serial terminal until one of the configured exit sequences is
/// typed; that sequence is returned.
pub fn serial_terminal(
    conn: &mut dyn Connection,
    options: &TerminalOptions,
) -> anyhow::Result<String> {
    let _paste_guard = if options.automatic_paste_mode {
        Some(BracketedPasteGuard::enter()?)
    } else {
        None
    };

    let mut exit_on = Vec::new();
    if options.automatic_paste_mode {
        exit_on.push(BRACKETED_PASTE_BEGIN.to_string());
    }
    if options.emulate_ctrl_l {
        exit_on.push("\x0c".to_string());
    }
    exit_on.extend(options.exit_on.iter().cloned());

    loop {
        let sequence = raw_serial_terminal(conn, &exit_on)?;
        if sequence == BRACKETED_PASTE_BEGIN {
            handle_bracketed_paste(conn, options.color)?;
        } else if sequence == "\x0c" && options.emulate_ctrl_l {
            handle_ctrl_l_emulation(conn)?;
        } else {
            return Ok(sequence);
        }
    }
}
