//! Low-level driver for the MicroPython REPL.
//!
//! The driver owns no state on the device: every routine re-synchronises the
//! prompt when called, and raw mode is a scoped acquisition that restores the
//! friendly prompt on every exit path.

use std::io;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::connection::{timeout_override, Connection};

/// The friendly-mode prompt, preceded by the newline that ends whatever came
/// before it.
const PROMPT: &[u8] = b"\r\n>>> ";

/// Banner printed on entry to raw mode, including the raw prompt.
const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

#[derive(Debug, Error)]
pub enum ReplError {
    /// The REPL produced bytes which do not match the expected framing. The
    /// unexpected bytes are carried for diagnostics.
    #[error("unexpected output from REPL: {}", String::from_utf8_lossy(.0))]
    UnexpectedOutput(Vec<u8>),

    /// No REPL prompt was reached despite repeated interrupts.
    #[error("no REPL prompt received (device said {})", String::from_utf8_lossy(.0))]
    NoRepl(Vec<u8>),

    /// The connected board runs a MicroPython too old for raw paste mode.
    #[error("device does not support raw paste mode")]
    RawPasteNotSupported(Vec<u8>),

    /// The device refused part of the code passed to [`raw_paste_exec`].
    #[error("device did not accept all code ({} bytes unsent)", remaining.len())]
    SomeCodeNotSent {
        stdout: String,
        stderr: String,
        remaining: Vec<u8>,
    },

    /// Code strings must not contain ASCII 0x04 (Ctrl+D): it would
    /// desynchronise the raw paste protocol.
    #[error("code must not contain ASCII 0x04 (Ctrl+D)")]
    EotInCode,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read from a connection, checking that exactly the expected value arrives.
pub fn expect(conn: &mut dyn Connection, value: &[u8]) -> Result<Vec<u8>, ReplError> {
    let actual = conn.read(value.len())?;
    if actual != value {
        return Err(ReplError::UnexpectedOutput(actual));
    }
    Ok(actual)
}

/// Read from a connection until the supplied value arrives, returning
/// everything read. Times out into [`ReplError::UnexpectedOutput`].
pub fn expect_endswith(conn: &mut dyn Connection, value: &[u8]) -> Result<Vec<u8>, ReplError> {
    let actual = conn.read_until(value)?;
    if !actual.ends_with(value) {
        return Err(ReplError::UnexpectedOutput(actual));
    }
    Ok(actual)
}

/// Attempt a keyboard interrupt to get to a fresh REPL prompt.
///
/// On success the device is sat at an interactive prompt with an empty input
/// buffer. All terminal output produced before the final prompt (e.g.
/// KeyboardInterrupt tracebacks) is returned for optional logging.
///
/// Makes `num_attempts` attempts, each with a `timeout`-long wait: more than
/// one attempt is needed when, for example, an exception handler is itself
/// blocking.
pub fn interrupt_and_enter_repl(conn: &mut dyn Connection) -> Result<Vec<u8>, ReplError> {
    interrupt_and_enter_repl_with(conn, 2, Duration::from_millis(100))
}

pub fn interrupt_and_enter_repl_with(
    conn: &mut dyn Connection,
    num_attempts: usize,
    timeout: Duration,
) -> Result<Vec<u8>, ReplError> {
    // Flush any pending input (previous command output, stale prompts)
    let mut unmatched_output = conn.read_buffered()?;

    let mut conn = timeout_override(conn, timeout)?;
    for _attempt in 0..num_attempts {
        conn.write(b"\x03")?;

        // Wait for the first hint of a prompt
        match expect_endswith(&mut *conn, PROMPT) {
            Ok(output) => {
                unmatched_output.extend_from_slice(&output[..output.len() - PROMPT.len()]);
            }
            Err(ReplError::UnexpectedOutput(output)) => {
                // No sign of a prompt; the exception handler may itself need
                // interrupting.
                unmatched_output.extend_from_slice(&output);
                continue;
            }
            Err(err) => return Err(err),
        }

        // To make sure this is not just an old prompt hanging about in the
        // buffer, produce some unique output and watch for it.
        let nonce: u32 = rand::thread_rng().gen_range(0x10..=0xFF_FFFF);
        conn.write(format!("0x{nonce:x}\r").as_bytes())?;
        let expected = format!("0x{nonce:x}\r\n{nonce}\r\n>>> ");
        match expect_endswith(&mut *conn, expected.as_bytes()) {
            Ok(output) => {
                unmatched_output.extend_from_slice(&output[..output.len() - expected.len()]);
                return Ok(unmatched_output);
            }
            Err(ReplError::UnexpectedOutput(output)) => {
                unmatched_output.extend_from_slice(&output);
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(ReplError::NoRepl(unmatched_output))
}

/// Scoped raw-mode acquisition.
///
/// Obtained from [`raw_mode`]; leaving happens either explicitly through
/// [`RawMode::exit`] (propagating any framing error) or implicitly on drop
/// (best effort, logged).
pub struct RawMode<'a> {
    conn: &'a mut dyn Connection,
    active: bool,
}

/// Enter raw mode. The returned guard restores the friendly prompt when it
/// goes out of scope.
pub fn raw_mode(conn: &mut dyn Connection) -> Result<RawMode<'_>, ReplError> {
    conn.write(b"\x01")?; // Ctrl+A
    expect_endswith(conn, RAW_BANNER)?;
    Ok(RawMode { conn, active: true })
}

impl RawMode<'_> {
    pub fn connection(&mut self) -> &mut dyn Connection {
        &mut *self.conn
    }

    /// Leave raw mode, checking the device returns to the friendly prompt.
    pub fn exit(mut self) -> Result<(), ReplError> {
        self.leave()
    }

    fn leave(&mut self) -> Result<(), ReplError> {
        self.active = false;
        // Ctrl+D ends the current code block (if any), Ctrl+B exits raw mode.
        self.conn.write(b"\x04\x02")?;
        expect_endswith(self.conn, PROMPT)?;
        Ok(())
    }
}

impl Drop for RawMode<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.leave() {
                log::warn!("failed to leave raw mode: {}", err);
            }
        }
    }
}

/// Execute code via raw paste mode. Must already be in raw mode.
///
/// Names defined by the executed code stay in scope until the surrounding raw
/// mode is exited. Returns the code's output and any exception traceback as
/// separate strings; the traceback is non-empty iff the device raised.
///
/// The executed code must complete, and all its output arrive, within the
/// connection's timeout.
pub fn raw_paste_exec(
    conn: &mut dyn Connection,
    code: &str,
) -> Result<(String, String), ReplError> {
    // Rejected before the handshake: failing here leaves the device at the
    // raw prompt, not in raw paste mode waiting for a payload.
    let code_bytes = code.as_bytes();
    if code_bytes.contains(&0x04) {
        return Err(ReplError::EotInCode);
    }

    // Request raw paste mode (Ctrl+E, 'A', Ctrl+A)
    conn.write(b"\x05A\x01")?;
    let response = conn.read(2)?;
    if response != b"R\x01" {
        return Err(ReplError::RawPasteNotSupported(response));
    }

    let window_bytes = conn.read(2)?;
    if window_bytes.len() != 2 {
        return Err(ReplError::UnexpectedOutput(window_bytes));
    }
    let window_increment = u16::from_le_bytes([window_bytes[0], window_bytes[1]]) as usize;
    let mut window = window_increment;

    // Send all of the code, never exceeding the device's advertised window of
    // unacknowledged bytes.
    //
    // NB: if the final block happened to use up the whole window we must also
    // wait for it to re-open before sending end-of-code, otherwise the
    // end-of-code byte might overrun the device's buffer.
    let mut remaining: &[u8] = code_bytes;
    while !remaining.is_empty() || window == 0 {
        if window == 0 {
            let response = conn.read(1)?;
            match response.as_slice() {
                [0x01] => {
                    window += window_increment;
                    continue;
                }
                [0x04] => break, // Device doesn't want any more data
                _ => return Err(ReplError::UnexpectedOutput(response)),
            }
        }

        let count = remaining.len().min(window);
        let written = conn.write(&remaining[..count])?;
        remaining = &remaining[written..];
        window -= written;
    }

    // End transmission
    conn.write(b"\x04")?;
    loop {
        let response = conn.read(1)?;
        match response.as_slice() {
            // A window size increment; no longer interesting
            [0x01] => continue,
            // End of transmission acknowledged
            [0x04] => break,
            _ => return Err(ReplError::UnexpectedOutput(response)),
        }
    }

    // Read the response: output, then exceptions, then the raw-REPL shell
    let mut code_output = expect_endswith(conn, b"\x04")?;
    code_output.pop();
    let mut exception_output = expect_endswith(conn, b"\x04")?;
    exception_output.pop();
    expect_endswith(conn, b">")?;

    let stdout = String::from_utf8_lossy(&code_output).into_owned();
    let stderr = String::from_utf8_lossy(&exception_output).into_owned();

    if remaining.is_empty() {
        Ok((stdout, stderr))
    } else {
        Err(ReplError::SomeCodeNotSent {
            stdout,
            stderr,
            remaining: remaining.to_vec(),
        })
    }
}

/// Execute code via the friendly REPL's paste mode.
///
/// Unlike [`raw_paste_exec`] the output is not captured: it arrives on the
/// connection interleaved with the usual echo, which suits the interactive
/// terminal. Each pasted line is echoed back prefixed with `=== `; the echo
/// is awaited per line as crude flow control.
pub fn paste_exec(conn: &mut dyn Connection, code: &str) -> Result<(), ReplError> {
    conn.write(b"\x05")?; // Ctrl+E
    expect_endswith(conn, b"=== ")?;

    for line in code.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        conn.write(line.as_bytes())?;
        conn.write(b"\r\n")?;
        expect_endswith(conn, b"=== ")?;
    }

    conn.write(b"\x04")?; // Ctrl+D: execute
    Ok(())
}

/// Interrupt any running process and soft-reset such that the device boots
/// directly into the REPL, without running `main.py`.
///
/// Returns whatever `boot.py` printed. Output prior to the reset is
/// discarded.
pub fn soft_reset_directly_into_repl(conn: &mut dyn Connection) -> Result<String, ReplError> {
    interrupt_and_enter_repl(conn)?;

    // When reset from raw mode, main.py is not executed.
    let mut raw = raw_mode(conn)?;

    raw.connection().write(b"\x04")?; // Ctrl+D: soft reset
    // "OK" from the raw REPL, then the boot message.
    expect(raw.connection(), b"OK\r\nMPY: soft reboot\r\n")?;

    // Everything up to the next raw-REPL banner is boot.py's output.
    let output = expect_endswith(raw.connection(), RAW_BANNER)?;
    let boot_output = &output[..output.len() - RAW_BANNER.len()];
    let boot_output = String::from_utf8_lossy(boot_output).into_owned();

    raw.exit()?;
    Ok(boot_output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[test]
    fn expect_matches() {
        let mut conn = FakeDevice::new();
        conn.queue_output(b"yes");
        assert_eq!(expect(&mut conn, b"yes").unwrap(), b"yes");
    }

    #[test]
    fn expect_mismatch_carries_actual_bytes() {
        let mut conn = FakeDevice::new();
        conn.queue_output(b"no");
        match expect(&mut conn, b"yes") {
            Err(ReplError::UnexpectedOutput(actual)) => assert_eq!(actual, b"no"),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn expect_endswith_matches() {
        let mut conn = FakeDevice::new();
        conn.queue_output(b"well...yes");
        assert_eq!(expect_endswith(&mut conn, b"yes").unwrap(), b"well...yes");
    }

    #[test]
    fn expect_endswith_mismatch() {
        let mut conn = FakeDevice::new();
        conn.queue_output(b"well...no");
        match expect_endswith(&mut conn, b"yes") {
            Err(ReplError::UnexpectedOutput(actual)) => assert_eq!(actual, b"well...no"),
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn interrupt_reaches_prompt() {
        let mut conn = FakeDevice::new();
        let noise = interrupt_and_enter_repl(&mut conn).unwrap();
        assert_eq!(noise, b"");
    }

    #[test]
    fn interrupt_returns_pending_noise() {
        let mut conn = FakeDevice::new();
        conn.queue_output(b"Traceback: something went wrong");
        let noise = interrupt_and_enter_repl(&mut conn).unwrap();
        assert_eq!(noise, b"Traceback: something went wrong");
    }

    #[test]
    fn interrupt_restores_previous_timeout() {
        let mut conn = FakeDevice::new();
        let before = conn.timeout();
        interrupt_and_enter_repl(&mut conn).unwrap();
        assert_eq!(conn.timeout(), before);
    }

    #[test]
    fn interrupt_fails_on_silent_device() {
        let mut conn = FakeDevice::new();
        conn.set_wedged(true);
        match interrupt_and_enter_repl(&mut conn) {
            Err(ReplError::NoRepl(_)) => (),
            other => panic!("expected NoRepl, got {other:?}"),
        }
    }

    #[test]
    fn raw_mode_enters_and_exits() {
        let mut conn = FakeDevice::new();
        interrupt_and_enter_repl(&mut conn).unwrap();
        let raw = raw_mode(&mut conn).unwrap();
        raw.exit().unwrap();
        assert!(!conn.in_raw_mode());
    }

    #[test]
    fn raw_mode_exits_on_drop() {
        let mut conn = FakeDevice::new();
        interrupt_and_enter_repl(&mut conn).unwrap();
        {
            let _raw = raw_mode(&mut conn).unwrap();
            assert!(conn.in_raw_mode());
        }
        assert!(!conn.in_raw_mode());
    }

    #[test]
    fn raw_paste_exec_returns_scripted_output() {
        let mut conn = FakeDevice::new();
        conn.script_exec(|_code| ("hello\r\n".to_string(), String::new()));
        interrupt_and_enter_repl(&mut conn).unwrap();

        let mut raw = raw_mode(&mut conn).unwrap();
        let (out, err) = raw_paste_exec(raw.connection(), "print('hello')").unwrap();
        assert_eq!(out, "hello\r\n");
        assert_eq!(err, "");
        raw.exit().unwrap();
    }

    #[test]
    fn raw_paste_exec_reports_exceptions() {
        let mut conn = FakeDevice::new();
        conn.script_exec(|_code| {
            (
                "success\r\n".to_string(),
                "Traceback (most recent call last):\r\nException: Failure!\r\n".to_string(),
            )
        });
        interrupt_and_enter_repl(&mut conn).unwrap();

        let mut raw = raw_mode(&mut conn).unwrap();
        let (out, err) = raw_paste_exec(raw.connection(), "boom()").unwrap();
        assert_eq!(out, "success\r\n");
        assert!(err.ends_with("Exception: Failure!\r\n"));
        raw.exit().unwrap();
    }

    #[test]
    fn raw_paste_exec_flow_controls_large_code() {
        // Code much longer than the advertised window must arrive complete.
        let mut conn = FakeDevice::new();
        conn.set_window_size(32);
        interrupt_and_enter_repl(&mut conn).unwrap();

        let code = format!("print({})", vec!["1"; 1000].join("+"));
        let mut raw = raw_mode(&mut conn).unwrap();
        raw_paste_exec(raw.connection(), &code).unwrap();
        raw.exit().unwrap();

        assert_eq!(conn.executed(), vec![code]);
    }

    #[test]
    fn raw_paste_exec_code_multiple_of_window() {
        let window = 32;
        let mut conn = FakeDevice::new();
        conn.set_window_size(window);
        interrupt_and_enter_repl(&mut conn).unwrap();

        let code = format!("{:#<width$}", "print(123)", width = window as usize * 8);
        let mut raw = raw_mode(&mut conn).unwrap();
        raw_paste_exec(raw.connection(), &code).unwrap();
        raw.exit().unwrap();

        assert_eq!(conn.executed(), vec![code]);
    }

    #[test]
    fn raw_paste_exec_rejects_ctrl_d() {
        let mut conn = FakeDevice::new();
        interrupt_and_enter_repl(&mut conn).unwrap();
        let mut raw = raw_mode(&mut conn).unwrap();
        match raw_paste_exec(raw.connection(), "oh noes\x04") {
            Err(ReplError::EotInCode) => (),
            other => panic!("expected EotInCode, got {other:?}"),
        }
        raw.exit().unwrap();
    }

    #[test]
    fn soft_reset_skips_main_and_returns_boot_output() {
        let mut conn = FakeDevice::new();
        conn.set_boot_output(b"booted!\r\n");
        let boot = soft_reset_directly_into_repl(&mut conn).unwrap();
        assert_eq!(boot, "booted!\r\n");
        assert!(!conn.in_raw_mode());
    }
}
