//! In-process test doubles.
//!
//! [`FakeDevice`] implements [`Connection`] over an in-memory state machine
//! speaking the real REPL byte protocol: prompts, raw-mode entry/exit, the
//! flow-controlled raw paste sub-protocol and soft reset. What "executing"
//! code means is delegated to a pluggable handler; [`fake_board`] supplies a
//! handler that interprets the filesystem facade's helper calls against an
//! in-memory file tree, close enough to real firmware to exercise the whole
//! stack end to end.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::codec::{bytes_to_evalable, parse_bytes_expr, str_literal};
use crate::connection::Connection;

const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

type ExecHandler = Box<dyn FnMut(&str) -> (String, String) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Friendly,
    Raw,
    RawPaste,
}

pub(crate) struct FakeDevice {
    inbox: VecDeque<u8>,
    outbox: VecDeque<u8>,
    mode: Mode,
    line: Vec<u8>,
    paste_code: Vec<u8>,
    paste_consumed: usize,
    window_size: u16,
    wedged: bool,
    boot_output: Vec<u8>,
    exec_handler: ExecHandler,
    executed: Vec<String>,
    timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for FakeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDevice")
            .field("mode", &self.mode)
            .field("wedged", &self.wedged)
            .field("timeout", &self.timeout)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FakeDevice {
    pub fn new() -> FakeDevice {
        FakeDevice {
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            mode: Mode::Friendly,
            line: Vec::new(),
            paste_code: Vec::new(),
            paste_consumed: 0,
            window_size: 128,
            wedged: false,
            boot_output: Vec::new(),
            exec_handler: Box::new(|_code| (String::new(), String::new())),
            executed: Vec::new(),
            timeout: Duration::from_secs(1),
            closed: false,
        }
    }

    /// Pre-load bytes as if the device had already printed them.
    pub fn queue_output(&mut self, data: &[u8]) {
        self.outbox.extend(data);
    }

    /// Replace the handler deciding what executed code prints.
    pub fn script_exec(&mut self, handler: impl FnMut(&str) -> (String, String) + Send + 'static) {
        self.exec_handler = Box::new(handler);
    }

    /// When wedged the device ignores all input, like a program with
    /// interrupts disabled.
    pub fn set_wedged(&mut self, wedged: bool) {
        self.wedged = wedged;
    }

    pub fn set_window_size(&mut self, window_size: u16) {
        self.window_size = window_size;
    }

    pub fn set_boot_output(&mut self, output: &[u8]) {
        self.boot_output = output.to_vec();
    }

    /// Code blocks executed via raw paste so far.
    pub fn executed(&self) -> Vec<String> {
        self.executed.clone()
    }

    pub fn in_raw_mode(&self) -> bool {
        self.mode != Mode::Friendly
    }

    fn process(&mut self) {
        while let Some(&byte) = self.inbox.front() {
            if self.wedged {
                self.inbox.pop_front();
                continue;
            }
            match self.mode {
                Mode::Friendly => {
                    self.inbox.pop_front();
                    match byte {
                        0x03 => {
                            self.line.clear();
                            self.outbox.extend(b"\r\n>>> ");
                        }
                        0x01 => {
                            self.line.clear();
                            self.outbox.extend(RAW_BANNER);
                            self.mode = Mode::Raw;
                        }
                        0x04 => {
                            self.outbox.extend(b"\r\n");
                            self.outbox.extend(b"MPY: soft reboot\r\n");
                            self.outbox.extend(self.boot_output.clone());
                            self.outbox.extend(b">>> ");
                        }
                        b'\r' => {
                            let text = String::from_utf8_lossy(&self.line).into_owned();
                            self.line.clear();
                            self.outbox.extend(text.as_bytes());
                            self.outbox.extend(b"\r\n");
                            if let Some(hex_digits) = text.strip_prefix("0x") {
                                if let Ok(value) = u32::from_str_radix(hex_digits, 16) {
                                    self.outbox.extend(format!("{value}\r\n").as_bytes());
                                }
                            }
                            self.outbox.extend(b">>> ");
                        }
                        other => self.line.push(other),
                    }
                }
                Mode::Raw => match byte {
                    0x04 => {
                        // Ctrl+D followed immediately by Ctrl+B is the raw
                        // mode exit sequence; alone it soft resets.
                        if self.inbox.get(1) == Some(&0x02) {
                            self.inbox.pop_front();
                            self.inbox.pop_front();
                            self.outbox.extend(b"\r\n>>> ");
                            self.mode = Mode::Friendly;
                        } else {
                            self.inbox.pop_front();
                            self.outbox.extend(b"OK\r\nMPY: soft reboot\r\n");
                            self.outbox.extend(self.boot_output.clone());
                            self.outbox.extend(RAW_BANNER);
                        }
                    }
                    0x02 => {
                        self.inbox.pop_front();
                        self.outbox.extend(b"\r\n>>> ");
                        self.mode = Mode::Friendly;
                    }
                    0x05 => {
                        // Raw paste request is three bytes: ENQ 'A' SOH
                        if self.inbox.len() < 3 {
                            return;
                        }
                        self.inbox.pop_front();
                        let a = self.inbox.pop_front();
                        let soh = self.inbox.pop_front();
                        if a != Some(b'A') || soh != Some(0x01) {
                            continue;
                        }
                        self.outbox.extend(b"R\x01");
                        self.outbox.extend(self.window_size.to_le_bytes());
                        self.paste_code.clear();
                        self.paste_consumed = 0;
                        self.mode = Mode::RawPaste;
                    }
                    _ => {
                        self.inbox.pop_front();
                    }
                },
                Mode::RawPaste => {
                    self.inbox.pop_front();
                    if byte == 0x04 {
                        self.outbox.push_back(0x04);
                        let code = String::from_utf8_lossy(&self.paste_code).into_owned();
                        let (stdout, stderr) = (self.exec_handler)(&code);
                        self.executed.push(code);
                        self.outbox.extend(stdout.as_bytes());
                        self.outbox.push_back(0x04);
                        self.outbox.extend(stderr.as_bytes());
                        self.outbox.push_back(0x04);
                        self.outbox.push_back(b'>');
                        self.mode = Mode::Raw;
                    } else {
                        self.paste_code.push(byte);
                        self.paste_consumed += 1;
                        if self.paste_consumed == self.window_size as usize {
                            self.paste_consumed = 0;
                            self.outbox.push_back(0x01);
                        }
                    }
                }
            }
        }
    }
}

impl Connection for FakeDevice {
    fn read(&mut self, num_bytes: usize) -> io::Result<Vec<u8>> {
        let count = num_bytes.min(self.outbox.len());
        Ok(self.outbox.drain(..count).collect())
    }

    fn read_until(&mut self, sentinel: &[u8]) -> io::Result<Vec<u8>> {
        let buffered: Vec<u8> = self.outbox.iter().copied().collect();
        let end = buffered
            .windows(sentinel.len().max(1))
            .position(|window| window == sentinel)
            .map(|index| index + sentinel.len())
            .unwrap_or(buffered.len());
        Ok(self.outbox.drain(..end).collect())
    }

    fn read_buffered(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.outbox.drain(..).collect())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.inbox.extend(data);
        self.process();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.outbox.clear();
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        None
    }
}

/// The filesystem state behind [`fake_board`].
#[derive(Default)]
pub(crate) struct BoardState {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Fail the next N `remove_recursive` calls with the device-side timeout
    /// sentinel.
    pub remove_timeouts: usize,

    read_file: Option<(String, usize)>,
    read_hashing: Option<Sha256>,
    write_file: Option<(String, Vec<u8>)>,
    pending_dirs: Option<Vec<String>>,
    pending_files: Option<Vec<String>>,
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

fn oserror(message: &str) -> (String, String) {
    (
        String::new(),
        format!(
            "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nOSError: {message}\r\n"
        ),
    )
}

fn exception(message: &str) -> (String, String) {
    (
        String::new(),
        format!(
            "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nException: {message}\r\n"
        ),
    )
}

impl BoardState {
    pub fn write_file(&mut self, path: &str, content: &[u8]) {
        let path = normalize(path);
        let mut dir = parent(&path);
        while dir != "/" {
            self.dirs.insert(dir.clone());
            dir = parent(&dir);
        }
        self.files.insert(path, content.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<&Vec<u8>> {
        self.files.get(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize(path);
        path == "/" || self.dirs.contains(&path)
    }

    fn children(&self, path: &str) -> (Vec<String>, Vec<String>) {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let immediate = |full: &str| -> Option<String> {
            let rest = full.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };
        let dirs = self.dirs.iter().filter_map(|d| immediate(d)).collect();
        let files = self.files.keys().filter_map(|f| immediate(f)).collect();
        (dirs, files)
    }

    fn remove_tree(&mut self, path: &str) {
        let path = normalize(path);
        let prefix = format!("{path}/");
        self.files
            .retain(|name, _| name != &path && !name.starts_with(&prefix));
        self.dirs
            .retain(|name| name != &path && !name.starts_with(&prefix));
    }

    /// Interpret one statement of the facade's device-side Python.
    fn statement(&mut self, stmt: &str) -> (String, String) {
        let stmt = stmt.trim();

        // Helper definitions and imports define names, printing nothing.
        if stmt.starts_with("def ")
            || stmt.starts_with("import ")
            || stmt.starts_with("from ")
            || stmt.starts_with("if hasattr(os, 'sync')")
            || stmt == "r = fi.read"
            || stmt == "s = fi.seek"
            || stmt.starts_with("w = ")
            || stmt == "hasher = hashlib.sha256()"
        {
            return (String::new(), String::new());
        }
        if stmt == "r = make_read_and_hash(r, hasher)" {
            self.read_hashing = Some(Sha256::new());
            return (String::new(), String::new());
        }

        if let Some(args) = call_args(stmt, "mkdir") {
            return self.do_mkdir(&args);
        }
        if let Some(args) = call_args(stmt, "remove_recursive") {
            return self.do_remove_recursive(&args);
        }
        if let Some(args) = call_args(stmt, "os.rename") {
            return self.do_rename(&args);
        }
        if let Some(args) = call_args(stmt, "os.remove") {
            let path = normalize(&parse_str_arg(&args[0]));
            return match self.files.remove(&path) {
                Some(_) => (String::new(), String::new()),
                None => oserror("[Errno 2] ENOENT"),
            };
        }
        if let Some(args) = call_args(stmt, "get_type") {
            let path = parse_str_arg(&args[0]);
            let kind = if self.is_dir(&path) {
                "d"
            } else if self.file(&path).is_some() {
                "f"
            } else {
                "a"
            };
            return (format!("{kind}\r\n"), String::new());
        }
        if let Some(args) = call_args(stmt, "file_len") {
            let path = parse_str_arg(&args[0]);
            return match self.file(&path) {
                Some(content) => (format!("{}\r\n", content.len()), String::new()),
                None => oserror("[Errno 2] ENOENT"),
            };
        }
        if let Some(args) = call_args(stmt, "get_temp_file_name") {
            let prefix = parse_str_arg(&args[0]);
            for i in 0.. {
                let name = format!("{prefix}.{i}");
                if self.file(&name).is_none() && !self.is_dir(&name) {
                    return (format!("{name}\r\n"), String::new());
                }
            }
            unreachable!();
        }
        if stmt.starts_with("d, f = map(iter, ls(") {
            let path = parse_str_arg(
                stmt.trim_start_matches("d, f = map(iter, ls(")
                    .trim_end_matches("))"),
            );
            if !self.is_dir(&path) {
                return oserror("[Errno 2] ENOENT");
            }
            let (dirs, files) = self.children(&normalize(&path));
            self.pending_dirs = Some(dirs);
            self.pending_files = Some(files);
            return (String::new(), String::new());
        }
        if let Some(args) = call_args(stmt, "pns") {
            let size: usize = args[1].trim().parse().unwrap_or(512);
            let source = match args[0].trim() {
                "d" => &mut self.pending_dirs,
                _ => &mut self.pending_files,
            };
            let mut printed = String::from("[");
            let mut so_far = 0;
            if let Some(items) = source.as_mut() {
                while so_far < size && !items.is_empty() {
                    let item = items.remove(0);
                    so_far += item.len();
                    printed.push_str(&str_literal(&item));
                    printed.push(',');
                }
            }
            printed.push(']');
            return (printed, String::new());
        }

        // File handles. The facade opens 'f' for whole-file transfers and
        // 'fi'/'fo' for updates.
        if let Some((_var, rest)) = stmt.split_once(" = open(") {
            let args = split_args(rest.trim_end_matches(')'));
            let path = parse_str_arg(&args[0]);
            let open_mode = parse_str_arg(&args[1]);
            return match open_mode.as_str() {
                "rb" => {
                    if self.is_dir(&path) {
                        oserror("[Errno 21] EISDIR")
                    } else if self.file(&path).is_none() {
                        oserror("[Errno 2] ENOENT")
                    } else {
                        self.read_file = Some((normalize(&path), 0));
                        self.read_hashing = None;
                        (String::new(), String::new())
                    }
                }
                "wb" => {
                    if self.is_dir(&path) {
                        oserror("[Errno 21] EISDIR")
                    } else if !self.is_dir(&parent(&normalize(&path))) {
                        oserror("[Errno 2] ENOENT")
                    } else {
                        self.write_file = Some((normalize(&path), Vec::new()));
                        (String::new(), String::new())
                    }
                }
                other => oserror(&format!("bad mode {other}")),
            };
        }
        if stmt.ends_with(".close()") {
            // Write handles are named 'f' or 'fo'; read handles 'f' or 'fi'.
            let var = stmt.trim_end_matches(".close()");
            if matches!(var, "f" | "fo") && self.write_file.is_some() {
                if let Some((path, content)) = self.write_file.take() {
                    self.files.insert(path, content);
                }
            } else {
                self.read_file = None;
            }
            return (String::new(), String::new());
        }
        if let Some(args) = call_args(stmt, "s") {
            let target: usize = args[0].trim().parse().unwrap_or(0);
            if let Some((_path, pos)) = self.read_file.as_mut() {
                *pos = target;
            }
            return (String::new(), String::new());
        }
        if let Some(args) = call_args(stmt, "w") {
            let data = match self.eval_bytes(&args[0]) {
                Ok(data) => data,
                Err(message) => return exception(&message),
            };
            match self.write_file.as_mut() {
                Some((_path, buffer)) => {
                    buffer.extend_from_slice(&data);
                    (String::new(), String::new())
                }
                None => exception("write to closed file"),
            }
        } else if let Some(args) = call_args(stmt, "pnb") {
            let count: usize = args[1].trim().parse().unwrap_or(512);
            match self.read_bytes(count) {
                Ok(data) => (format!("{}\r\n", bytes_to_evalable(&data)), String::new()),
                Err(message) => exception(&message),
            }
        } else if stmt == "print(h(hasher.digest()))" {
            let digest = self
                .read_hashing
                .take()
                .map(|hasher| hex::encode(hasher.finalize()))
                .unwrap_or_default();
            (format!("b'{digest}'\r\n"), String::new())
        } else {
            exception(&format!("unhandled statement: {stmt}"))
        }
    }

    fn eval_bytes(&mut self, expr: &str) -> Result<Vec<u8>, String> {
        let expr = expr.trim();
        if let Some(args) = call_args(expr, "r") {
            let count: usize = args[0].trim().parse().map_err(|_| "bad read size")?;
            return self.read_bytes(count);
        }
        parse_bytes_expr(expr).map_err(|err| err.to_string())
    }

    fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, String> {
        let (path, pos) = self.read_file.as_mut().ok_or("read from closed file")?;
        let content = self.files.get(path).ok_or("file vanished")?;
        let start = (*pos).min(content.len());
        let end = (start + count).min(content.len());
        *pos = end;
        let data = content[start..end].to_vec();
        if let Some(hasher) = self.read_hashing.as_mut() {
            hasher.update(&data);
        }
        Ok(data)
    }

    fn do_mkdir(&mut self, args: &[String]) -> (String, String) {
        let path = normalize(&parse_str_arg(&args[0]));
        let parents = args[1].trim() == "True";
        let exist_ok = args[2].trim() == "True";

        if parents {
            let mut dir = parent(&path);
            let mut to_create = Vec::new();
            while dir != "/" {
                to_create.push(dir.clone());
                dir = parent(&dir);
            }
            for dir in to_create.into_iter().rev() {
                self.dirs.insert(dir);
            }
        }
        if self.is_dir(&path) || self.file(&path).is_some() {
            if exist_ok && self.is_dir(&path) {
                return (String::new(), String::new());
            }
            return oserror("[Errno 17] EEXIST");
        }
        if !self.is_dir(&parent(&path)) {
            return oserror("[Errno 2] ENOENT");
        }
        self.dirs.insert(path);
        (String::new(), String::new())
    }

    fn do_remove_recursive(&mut self, args: &[String]) -> (String, String) {
        let path = parse_str_arg(&args[0]);
        if self.remove_timeouts > 0 {
            self.remove_timeouts -= 1;
            return exception("Timeout");
        }
        let normalized = normalize(&path);
        if !self.is_dir(&normalized) && self.file(&normalized).is_none() {
            return oserror("[Errno 2] ENOENT");
        }
        self.remove_tree(&normalized);
        (String::new(), String::new())
    }

    fn do_rename(&mut self, args: &[String]) -> (String, String) {
        let from = normalize(&parse_str_arg(&args[0]));
        let to = normalize(&parse_str_arg(&args[1]));
        if let Some(content) = self.files.remove(&from) {
            self.files.insert(to, content);
            (String::new(), String::new())
        } else if self.dirs.remove(&from) {
            self.dirs.insert(to);
            (String::new(), String::new())
        } else {
            oserror("[Errno 2] ENOENT")
        }
    }
}

/// Extract the argument list of `name(...)` when `stmt` is exactly that call
/// (or an expression of it wrapped in nothing else).
fn call_args(stmt: &str, name: &str) -> Option<Vec<String>> {
    let rest = stmt.strip_prefix(name)?.strip_prefix('(')?;
    let inner = rest.strip_suffix(')')?;
    Some(split_args(inner))
}

/// Split a Python argument list at top-level commas, respecting quotes and
/// nesting.
fn split_args(inner: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in inner.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => args.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        args.push(current);
    }
    args
}

fn parse_str_arg(arg: &str) -> String {
    let arg = arg.trim();
    let Some(stripped) = arg
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
    else {
        return arg.to_string();
    };
    stripped.replace("\\\\", "\u{0}").replace("\\'", "'").replace('\u{0}', "\\")
}

/// A [`FakeDevice`] whose executed code is interpreted against an in-memory
/// board filesystem. Returns the device and a handle on its state.
pub(crate) fn fake_board() -> (FakeDevice, Arc<Mutex<BoardState>>) {
    let state = Arc::new(Mutex::new(BoardState::default()));
    let handler_state = Arc::clone(&state);

    let mut device = FakeDevice::new();
    device.script_exec(move |code| {
        let trimmed = code.trim_start();
        // Multi-line function definitions and imports just bind names.
        if trimmed.starts_with("def ")
            || trimmed.starts_with("import ")
            || trimmed.starts_with("from ")
        {
            return (String::new(), String::new());
        }

        let mut state = handler_state.lock().expect("board state poisoned");
        for line in code.split('\n') {
            // Only the open-plus-alias lines pack several statements into
            // one line; splitting anything else could cut a literal apart.
            let statements: Vec<&str> = if line.contains(" = open(") {
                line.split("; ").collect()
            } else {
                vec![line]
            };
            for stmt in statements {
                if stmt.trim().is_empty() {
                    continue;
                }
                let (stdout, stderr) = state.statement(stmt);
                if !stdout.is_empty() || !stderr.is_empty() {
                    // Output or a raised exception ends the block early,
                    // like the real interpreter's raise would.
                    return (stdout, stderr);
                }
            }
        }
        (String::new(), String::new())
    });

    (device, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_mkdir_and_children() {
        let mut board = BoardState::default();
        assert_eq!(board.statement("mkdir('/a', False, False)"), (String::new(), String::new()));
        assert_eq!(board.statement("mkdir('/a/b', False, False)"), (String::new(), String::new()));
        let (_, err) = board.statement("mkdir('/a', False, False)");
        assert!(err.contains("OSError"));
        assert!(board.is_dir("/a/b"));
        assert_eq!(board.children("/"), (vec!["a".to_string()], vec![]));
    }

    #[test]
    fn board_file_write_read() {
        let mut board = BoardState::default();
        board.statement("f = open('/x', 'wb')");
        board.statement("w(b'hi there')");
        board.statement("f.close()");
        assert_eq!(board.file("/x").unwrap(), b"hi there");
    }

    #[test]
    fn split_args_respects_quotes_and_nesting() {
        assert_eq!(
            split_args("'a,b', True, uh(b'ff,00')"),
            vec!["'a,b'", " True", " uh(b'ff,00')"]
        );
    }

    #[test]
    fn multi_statement_lines_are_processed() {
        let mut board = BoardState::default();
        board.write_file("/data", b"0123456789");
        let result = board.statement("fi = open('/data', 'rb')");
        assert_eq!(result, (String::new(), String::new()));
        assert!(board.read_file.is_some());
    }
}
