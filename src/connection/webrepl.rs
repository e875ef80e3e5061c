//! WebREPL backend.
//!
//! The WebREPL protocol is intended to just be serial-over-WebSockets, except
//! that the device sends arbitrary (possibly non-UTF-8, possibly split
//! mid-codepoint) serial bytes inside *text* frames. Conformant WebSocket
//! libraries rightly reject that, so this module carries a minimal,
//! compatibly non-conformant client that is just enough to talk to
//! MicroPython and nothing more.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use data_encoding::BASE64;
use rand::RngCore;
use sha1::{Digest, Sha1};

use super::{read_with_deadline, Connection, ConnectionError};

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Opcode> {
        match bits {
            0 => Some(Opcode::Continuation),
            1 => Some(Opcode::Text),
            2 => Some(Opcode::Binary),
            8 => Some(Opcode::Close),
            9 => Some(Opcode::Ping),
            10 => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0,
            Opcode::Text => 1,
            Opcode::Binary => 2,
            Opcode::Close => 8,
            Opcode::Ping => 9,
            Opcode::Pong => 10,
        }
    }
}

#[derive(Debug)]
struct Frame {
    fin: bool,
    opcode: Opcode,
    payload: Vec<u8>,
}

/// Receive and decode one complete frame, blocking indefinitely.
fn read_frame(stream: &mut impl Read) -> Result<Frame, ConnectionError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(ConnectionError::ReservedBits(header[0]));
    }
    let opcode = Opcode::from_bits(header[0] & 0x0f).ok_or_else(|| {
        ConnectionError::Protocol(format!("unknown opcode {:#x}", header[0] & 0x0f))
    })?;

    let masked = header[1] & 0x80 != 0;
    let mut length = (header[1] & 0x7f) as u64;
    if length == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        length = u16::from_be_bytes(ext) as u64;
    } else if length == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        length = u64::from_be_bytes(ext);
    }

    let mut masking_key = [0u8; 4];
    if masked {
        stream.read_exact(&mut masking_key)?;
    }

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload)?;
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= masking_key[i % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Encode and send one frame.
fn write_frame(stream: &mut impl Write, frame: &Frame, use_mask: bool) -> io::Result<()> {
    let length = frame.payload.len();

    let mut out = Vec::with_capacity(length + 14);
    out.push(((frame.fin as u8) << 7) | frame.opcode.bits());

    let mask_bit = (use_mask as u8) << 7;
    if length < 126 {
        out.push(mask_bit | length as u8);
    } else if length < 1 << 16 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(length as u64).to_be_bytes());
    }

    let mut masking_key = [0u8; 4];
    if use_mask {
        rand::thread_rng().fill_bytes(&mut masking_key);
        out.extend_from_slice(&masking_key);
    }

    out.extend(
        frame
            .payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ masking_key[i % 4]),
    );

    stream.write_all(&out)
}

/// The `Sec-WebSocket-Accept` digest expected for a given client key.
fn accept_digest(client_key_b64: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(client_key_b64);
    hasher.update(WEBSOCKET_GUID);
    hasher.finalize().into()
}

fn parse_ws_url(url: &str) -> Result<(String, u16, String), ConnectionError> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| ConnectionError::Spec(format!("not a ws:// URL: {url}")))?;

    let (netloc, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };

    let (host, port) = match netloc.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ConnectionError::Spec(format!("invalid port {port:?} in {url:?}"))
            })?;
            (host, port)
        }
        None => (netloc, 8266),
    };

    if host.is_empty() {
        return Err(ConnectionError::Spec(format!(
            "WebSocket URL must include a host: {url}"
        )));
    }

    Ok((host.to_string(), port, path.to_string()))
}

/// Perform a basic WebSocket opening handshake. Just conformant enough to
/// satisfy MicroPython's WebSocket implementation.
fn websocket_handshake(
    sock: &mut TcpStream,
    host: &str,
    path: &str,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    sock.set_read_timeout(Some(timeout))?;

    let mut client_key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut client_key);
    let client_key_b64 = BASE64.encode(&client_key);
    let expected_accept = accept_digest(client_key_b64.as_bytes());

    sock.write_all(
        format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {client_key_b64}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        )
        .as_bytes(),
    )?;

    // Wait for the server response headers
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        match sock.read(&mut byte) {
            Ok(0) => {
                return Err(ConnectionError::Handshake(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(_) => buf.push(byte[0]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let response = String::from_utf8_lossy(&buf);
    let mut lines = response.trim_end().lines();
    let status = lines.next().unwrap_or("");
    if status != "HTTP/1.1 101 Switching Protocols" {
        return Err(ConnectionError::Handshake(format!(
            "unexpected status line: {status}"
        )));
    }

    let mut upgrade = None;
    let mut connection = None;
    let mut accept = None;
    for line in lines {
        let (name, value) = line.split_once(':').unwrap_or((line, ""));
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade = Some(value.trim().to_string()),
            "connection" => connection = Some(value.trim().to_string()),
            "sec-websocket-accept" => accept = Some(value.trim().to_string()),
            _ => (),
        }
    }

    if upgrade.as_deref() != Some("websocket") {
        return Err(ConnectionError::Handshake(format!(
            "invalid upgrade header: {upgrade:?}"
        )));
    }
    if connection.as_deref() != Some("Upgrade") {
        return Err(ConnectionError::Handshake(format!(
            "invalid connection header: {connection:?}"
        )));
    }
    let server_key = BASE64
        .decode(accept.unwrap_or_default().as_bytes())
        .unwrap_or_default();
    if server_key != expected_accept {
        return Err(ConnectionError::Handshake(
            "incorrect sec-websocket-accept key".to_string(),
        ));
    }

    Ok(())
}

/// Background receiver: decodes frames forever, feeding the bytes carried by
/// text frames into the pipe. Answers pings with pongs and close with close.
fn receiver_loop(mut sock: TcpStream, mut pipe: UnixStream, sender: SharedSender) {
    loop {
        let frame = match read_frame(&mut sock) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("WebREPL receiver stopping: {}", err);
                break;
            }
        };

        match frame.opcode {
            Opcode::Text => {
                if pipe.write_all(&frame.payload).is_err() {
                    break;
                }
            }
            Opcode::Ping => {
                // Answer and keep receiving.
                let Ok(mut guard) = sender.lock() else { break };
                if let Some(out) = guard.as_mut() {
                    let pong = Frame {
                        fin: true,
                        opcode: Opcode::Pong,
                        payload: frame.payload,
                    };
                    if write_frame(out, &pong, true).is_err() {
                        break;
                    }
                }
            }
            Opcode::Close => {
                let Ok(mut guard) = sender.lock() else { break };
                if let Some(out) = guard.as_mut() {
                    let close = Frame {
                        fin: true,
                        opcode: Opcode::Close,
                        payload: Vec::new(),
                    };
                    let _ = write_frame(out, &close, true);
                    let _ = out.shutdown(Shutdown::Both);
                }
                *guard = None;
                break;
            }
            other => {
                log::warn!("unsupported WebSocket frame received: {:?}", other);
                break;
            }
        }
    }
    // Dropping `pipe` here closes the write end: readers see end-of-stream.
}

type SharedSender = Arc<Mutex<Option<TcpStream>>>;

/// A [`Connection`] speaking the MicroPython WebREPL protocol.
///
/// Sends are serialised by a mutex shared with the receiver thread (which
/// needs it for pong and close replies); the receive side is owned by that
/// thread, which drains text-frame payloads into a local socket pair read by
/// this struct one byte stream at a time.
#[derive(Debug)]
pub struct WebReplConnection {
    sender: SharedSender,
    pipe: Option<UnixStream>,
    timeout: Duration,
}

impl WebReplConnection {
    pub fn connect(ws_url: &str, password: &str) -> Result<Self, ConnectionError> {
        let (host, port, path) = parse_ws_url(ws_url)?;

        let mut sock = TcpStream::connect((host.as_str(), port))?;
        sock.set_nodelay(true)?;

        websocket_handshake(&mut sock, &host, &path, HANDSHAKE_TIMEOUT)?;
        sock.set_read_timeout(None)?;

        let (pipe_read, pipe_write) = UnixStream::pair()?;
        let sender: SharedSender = Arc::new(Mutex::new(Some(sock.try_clone()?)));

        let thread_sender = Arc::clone(&sender);
        thread::Builder::new()
            .name("webrepl-recv".to_string())
            .spawn(move || receiver_loop(sock, pipe_write, thread_sender))?;

        let mut conn = WebReplConnection {
            sender,
            pipe: Some(pipe_read),
            timeout: DEFAULT_TIMEOUT,
        };

        if let Err(err) = conn.authenticate(password) {
            let _ = conn.close();
            return Err(err);
        }

        Ok(conn)
    }

    fn authenticate(&mut self, password: &str) -> Result<(), ConnectionError> {
        self.read_until(b": ")?;
        self.write(format!("{password}\n").as_bytes())?;

        let response = self.read_until(b"\r\n")?;
        if response != b"\r\n" {
            return Err(auth_error(response));
        }
        let response = self.read_until(b"\r\n")?;
        if response != b"WebREPL connected\r\n" {
            return Err(auth_error(response));
        }

        // Not a real prompt: a fixed part of the message WebREPL prints once
        // it has authenticated.
        let response = self.read_until(b">>> ")?;
        if response != b">>> " {
            return Err(auth_error(response));
        }

        Ok(())
    }

    fn read_pipe_bytes(
        &mut self,
        mut stop: impl FnMut(&[u8]) -> bool,
    ) -> io::Result<Vec<u8>> {
        let timeout = self.timeout;
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(Vec::new());
        };

        read_with_deadline(
            timeout,
            |remaining| {
                pipe.set_read_timeout(Some(remaining))?;
                let mut byte = [0u8; 1];
                loop {
                    match pipe.read(&mut byte) {
                        Ok(0) => return Ok(None),
                        Ok(_) => return Ok(Some(byte[0])),
                        Err(err)
                            if matches!(
                                err.kind(),
                                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                            ) =>
                        {
                            return Ok(None)
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                    }
                }
            },
            |buf| stop(buf),
        )
    }
}

fn auth_error(response: Vec<u8>) -> ConnectionError {
    ConnectionError::Authentication(String::from_utf8_lossy(&response).into_owned())
}

impl Connection for WebReplConnection {
    fn read(&mut self, num_bytes: usize) -> io::Result<Vec<u8>> {
        self.read_pipe_bytes(|buf| buf.len() >= num_bytes)
    }

    fn read_until(&mut self, sentinel: &[u8]) -> io::Result<Vec<u8>> {
        self.read_pipe_bytes(|buf| buf.ends_with(sentinel))
    }

    fn read_buffered(&mut self) -> io::Result<Vec<u8>> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(Vec::new());
        };

        pipe.set_nonblocking(true)?;
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let result = loop {
            match pipe.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(count) => out.extend_from_slice(&buf[..count]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(err),
            }
        };
        pipe.set_nonblocking(false)?;
        result.map(|_| out)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .sender
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "WebREPL sender poisoned"))?;
        let Some(sock) = guard.as_mut() else {
            return Ok(0);
        };

        let frame = Frame {
            fin: true,
            // Text, to match what the device itself does; the payload is not
            // required to be UTF-8.
            opcode: Opcode::Text,
            payload: data.to_vec(),
        };
        write_frame(sock, &frame, true)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Ok(mut guard) = self.sender.lock() {
            if let Some(sock) = guard.take() {
                let _ = sock.shutdown(Shutdown::Both);
            }
        }
        self.pipe = None;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.pipe.as_ref().map(|pipe| pipe.as_raw_fd())
    }
}
