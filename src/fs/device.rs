//! The on-device filesystem facade.
//!
//! [`DeviceFs`] drives a device already in raw mode. Most operations lean on
//! small helper functions defined on the device the first time they are
//! needed; the helpers are string constants with a dependency list, resolved
//! once per raw-mode session.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::codec::{
    batch_commands, bytes_to_evalable, estimate_overheads, parse_bytes_expr, parse_str_list,
    patch_commands, plan_update, str_literal, PatchOp,
};
use crate::connection::Connection;
use crate::repl::{raw_mode, raw_paste_exec, ReplError};

use super::{traceback_to_error, Filesystem, FsError, PathType};

/// Default transfer block size, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default number of patch commands per raw-paste round trip.
pub const DEFAULT_COMMAND_LIMIT: usize = 20;

/// Byte budget for one batch of patch commands.
const BATCH_BYTE_BUDGET: usize = 512;

struct HelperDef {
    name: &'static str,
    source: &'static str,
    deps: &'static [&'static str],
}

/// Snippets which may be executed to define or import a useful name on the
/// device.
const HELPERS: &[HelperDef] = &[
    HelperDef {
        name: "os",
        source: "import os",
        deps: &[],
    },
    HelperDef {
        name: "time",
        source: "import time",
        deps: &[],
    },
    HelperDef {
        name: "hashlib",
        source: "import hashlib",
        deps: &[],
    },
    // A mkdir with parents and exist_ok arguments
    HelperDef {
        name: "mkdir",
        source: "\
def mkdir(path, parents, exist_ok):
    if parents:
        parent = \"\"
        for part in path.split(\"/\")[1:-1]:
            parent += \"/\" + part
            try:
                os.mkdir(parent)
            except OSError:
                pass
    try:
        os.mkdir(path)
    except OSError:
        if not exist_ok:
            raise",
        deps: &["os"],
    },
    // Recursive delete. Large hierarchies can take longer than the serial
    // read timeout, so the device self-interrupts by raising once
    // timeout_ms has elapsed; the host just runs it again.
    HelperDef {
        name: "remove_recursive",
        source: "\
def remove_recursive(path, timeout_ms, _timeout_at=None):
    if _timeout_at is None:
        _timeout_at = time.ticks_add(time.ticks_ms(), timeout_ms)
    if os.stat(path)[0] & 0x4000:
        for entry in os.ilistdir(path):
            name, type = entry[:2]
            if type & 0x4000:
                remove_recursive(f\"{path}/{name}\", timeout_ms, _timeout_at)
            else:
                os.remove(f\"{path}/{name}\")
            if time.ticks_diff(_timeout_at, time.ticks_ms()) <= 0:
                raise Exception(\"Timeout\")
        os.rmdir(path)
    else:
        os.remove(path)",
        deps: &["os", "time"],
    },
    HelperDef {
        name: "ls",
        source: "\
def ls(path):
    directories = []
    files = []
    for entry in os.ilistdir(path):
        name, type = entry[:2]
        if type & 0x4000:
            directories.append(name)
        else:
            files.append(name)
    return (directories, files)",
        deps: &["os"],
    },
    // Print the next (approximately) size bytes' worth of string literals
    // from an iterator as a Python list literal, an empty list once
    // exhausted. Long listings are printed a few entries at a time so that
    // no single print outlasts the serial read timeout.
    HelperDef {
        name: "pns",
        source: "\
def pns(iterator, size):
    so_far = 0
    print(\"[\", end=\"\")
    while so_far < size:
        try:
            value = next(iterator)
            print(repr(value), end=\",\")
            so_far += len(value)
        except StopIteration:
            break
    print(\"]\", end=\"\")",
        deps: &[],
    },
    // Short aliases for unhexlify and hexlify
    HelperDef {
        name: "uh",
        source: "from binascii import unhexlify as uh",
        deps: &[],
    },
    HelperDef {
        name: "h",
        source: "from binascii import hexlify as h",
        deps: &[],
    },
    // Render a bytes object as whichever of a bytes literal or an unhexlify
    // call is shorter, mirroring the host-side encoder.
    HelperDef {
        name: "bytes_to_evalable",
        source: "\
def bytes_to_evalable(data):
    as_bytes = repr(data)
    len_as_bytes = len(as_bytes)
    len_as_hex = len('uh(b\"\")') + (len(data) * 2)
    if len_as_bytes < len_as_hex:
        return as_bytes
    else:
        return f\"uh({h(data)})\"",
        deps: &["h"],
    },
    // Print the next n bytes from a file using bytes_to_evalable.
    HelperDef {
        name: "pnb",
        source: "\
def pnb(f, n):
    print(bytes_to_evalable(f.read(n)))",
        deps: &["bytes_to_evalable"],
    },
    HelperDef {
        name: "get_type",
        source: "\
def get_type(path):
    try:
        mode = os.stat(path)[0]
    except OSError:
        print(\"a\")
        return
    if mode & 0x4000:
        print(\"d\")
    else:
        print(\"f\")",
        deps: &["os"],
    },
    HelperDef {
        name: "file_len",
        source: "\
def file_len(path):
    print(os.stat(path)[6])",
        deps: &["os"],
    },
    // Print an unused file name of the form "{prefix}.{i}".
    HelperDef {
        name: "get_temp_file_name",
        source: "\
def get_temp_file_name(prefix):
    i = 0
    while True:
        name = \"{}.{}\".format(prefix, i)
        try:
            os.stat(name)
        except OSError:
            print(name)
            return
        i += 1",
        deps: &["os"],
    },
    // Wrap a file's read function such that every byte read is also fed to a
    // hasher.
    HelperDef {
        name: "make_read_and_hash",
        source: "\
def make_read_and_hash(read, hasher):
    def read_and_hash(n):
        data = read(n)
        hasher.update(data)
        return data
    return read_and_hash",
        deps: &[],
    },
];

/// Filesystem facade over a device sitting at the raw REPL.
///
/// One instance corresponds to one raw-mode session: the set of helper names
/// already defined on the device is tracked here and dies with the session.
/// Not safe to share.
pub struct DeviceFs<'a> {
    conn: &'a mut dyn Connection,
    defined: HashSet<&'static str>,
}

/// Enter raw mode, hand a [`DeviceFs`] to `body`, and leave raw mode again on
/// the way out (on the error path, as a best effort).
pub fn with_filesystem<T, E>(
    conn: &mut dyn Connection,
    body: impl FnOnce(&mut DeviceFs<'_>) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<ReplError>,
{
    let mut raw = raw_mode(conn)?;
    let result = {
        let mut fs = DeviceFs::new(raw.connection());
        body(&mut fs)
    };
    match result {
        Ok(value) => {
            raw.exit()?;
            Ok(value)
        }
        // The guard's drop restores the friendly prompt as best it can.
        Err(err) => Err(err),
    }
}

impl<'a> DeviceFs<'a> {
    pub fn new(conn: &'a mut dyn Connection) -> DeviceFs<'a> {
        DeviceFs {
            conn,
            defined: HashSet::new(),
        }
    }

    fn exec(&mut self, code: &str) -> Result<(String, String), FsError> {
        Ok(raw_paste_exec(self.conn, code)?)
    }

    /// Run code which is expected to print nothing and raise nothing.
    fn exec_silent(&mut self, code: &str) -> Result<(), FsError> {
        let (out, err) = self.exec(code)?;
        if !err.is_empty() {
            return Err(traceback_to_error(&err));
        }
        if !out.is_empty() {
            return Err(FsError::Protocol(format!("unexpected output: {out}")));
        }
        Ok(())
    }

    /// Run code, returning its output; device exceptions become errors.
    fn exec_output(&mut self, code: &str) -> Result<String, FsError> {
        let (out, err) = self.exec(code)?;
        if !err.is_empty() {
            return Err(traceback_to_error(&err));
        }
        Ok(out)
    }

    /// Ensure the named helper (and its dependencies) exist on the device.
    fn ensure_defined(&mut self, name: &'static str) -> Result<(), FsError> {
        if !self.defined.insert(name) {
            return Ok(());
        }
        let def = HELPERS
            .iter()
            .find(|def| def.name == name)
            .expect("device helper definitions are statically registered");
        for dep in def.deps {
            self.ensure_defined(dep)?;
        }
        self.exec_silent(def.source)
    }

    /// Render a block for embedding in source, defining the device-side hex
    /// decoder first when the hex form won.
    fn evalable(&mut self, block: &[u8]) -> Result<String, FsError> {
        let expr = bytes_to_evalable(block);
        if expr.starts_with("uh(") {
            self.ensure_defined("uh")?;
        }
        Ok(expr)
    }

    pub fn write_file_with(
        &mut self,
        path: &str,
        content: &[u8],
        block_size: usize,
    ) -> Result<(), FsError> {
        self.exec_silent(&format!(
            "f = open({}, 'wb'); w = f.write",
            str_literal(path)
        ))?;

        for block in content.chunks(block_size) {
            let expr = self.evalable(block)?;
            self.exec_silent(&format!("w({expr})"))?;
        }

        self.exec_silent("f.close()")
    }

    pub fn read_file_with(&mut self, path: &str, block_size: usize) -> Result<Vec<u8>, FsError> {
        self.exec_silent(&format!("f = open({}, 'rb')", str_literal(path)))?;
        self.ensure_defined("pnb")?;

        let mut data = Vec::new();
        loop {
            let out = self.exec_output(&format!("pnb(f, {block_size})"))?;
            let block = parse_bytes_expr(out.trim())?;
            let done = block.len() < block_size;
            data.extend_from_slice(&block);
            if done {
                break;
            }
        }

        self.exec_silent("f.close()")?;
        Ok(data)
    }

    pub fn ls_with(
        &mut self,
        path: &str,
        block_size: usize,
    ) -> Result<(Vec<String>, Vec<String>), FsError> {
        // Long listings are fetched a block at a time via pns: printing the
        // whole repr'd list in one go could outlast the read timeout.
        self.ensure_defined("ls")?;
        self.exec_silent(&format!("d, f = map(iter, ls({}))", str_literal(path)))?;

        self.ensure_defined("pns")?;
        let mut directories = Vec::new();
        let mut files = Vec::new();
        for (list, name) in [(&mut directories, "d"), (&mut files, "f")] {
            loop {
                let out = self.exec_output(&format!("pns({name}, {block_size})"))?;
                let items = parse_str_list(out.trim())?;
                if items.is_empty() {
                    break;
                }
                list.extend(items);
            }
        }

        Ok((directories, files))
    }

    /// Differential update with explicit tuning knobs; see
    /// [`Filesystem::update_file`] for the defaults.
    pub fn update_file_with(
        &mut self,
        path: &str,
        old: &[u8],
        new: &[u8],
        block_size: usize,
        command_limit: usize,
        safe: bool,
    ) -> Result<(), FsError> {
        let path_lit = str_literal(path);

        // Input file, with single-letter aliases for the patch commands
        self.exec_silent(&format!("fi = open({path_lit}, 'rb'); r = fi.read; s = fi.seek"))?;

        // Output goes to a fresh temporary name in the same directory; the
        // original is only replaced once everything has worked.
        self.ensure_defined("get_temp_file_name")?;
        let out = self.exec_output(&format!("get_temp_file_name({path_lit})"))?;
        let temp_name = out.trim().to_string();
        if temp_name.is_empty() {
            return Err(FsError::Protocol(
                "device returned no temporary file name".to_string(),
            ));
        }
        let temp_lit = str_literal(&temp_name);
        self.exec_silent(&format!("fo = open({temp_lit}, 'wb'); w = fo.write"))?;

        if safe {
            self.ensure_defined("hashlib")?;
            self.ensure_defined("make_read_and_hash")?;
            self.exec_silent("hasher = hashlib.sha256()\nr = make_read_and_hash(r, hasher)")?;
        }

        let overheads = estimate_overheads(old, new, block_size);
        let plan = plan_update(old, new, overheads);
        let commands = patch_commands(&plan, new, block_size);
        if commands.iter().any(|command| command.text.contains("uh(")) {
            self.ensure_defined("uh")?;
        }

        let payload: usize = commands.iter().map(|command| command.payload_len).sum();
        log::debug!(
            "updating {} via {} patch commands carrying {} bytes",
            path,
            commands.len(),
            payload
        );

        for batch in batch_commands(commands, BATCH_BYTE_BUDGET, command_limit) {
            self.exec_silent(&batch)?;
        }

        self.exec_silent("fi.close()\nfo.close()")?;

        if safe {
            // Compare the device's hash of everything it read from the old
            // file against the host's hash of the ranges the plan reused.
            self.ensure_defined("h")?;
            let out = self.exec_output("print(h(hasher.digest()))")?;
            let device_digest = parse_bytes_expr(out.trim())?;

            let mut hasher = Sha256::new();
            for op in &plan {
                if let PatchOp::Equal { old: range, .. } = op {
                    hasher.update(&old[range.clone()]);
                }
            }
            let host_digest = hex::encode(hasher.finalize());

            if device_digest != host_digest.as_bytes() {
                self.ensure_defined("os")?;
                self.exec_silent(&format!("os.remove({temp_lit})"))?;
                return Err(FsError::Update(format!(
                    "content of {path} on the device does not match the expected old content"
                )));
            }
        }

        self.ensure_defined("os")?;
        self.exec_silent(&format!("os.rename({temp_lit}, {path_lit})"))
    }
}

impl Filesystem for DeviceFs<'_> {
    fn get_type(&mut self, path: &str) -> Result<PathType, FsError> {
        self.ensure_defined("get_type")?;
        let out = self.exec_output(&format!("get_type({})", str_literal(path)))?;
        match out.trim() {
            "a" => Ok(PathType::Absent),
            "f" => Ok(PathType::File),
            "d" => Ok(PathType::Dir),
            other => Err(FsError::Protocol(format!(
                "unrecognised path type {other:?}"
            ))),
        }
    }

    fn mkdir(&mut self, path: &str, parents: bool, exist_ok: bool) -> Result<(), FsError> {
        let path = if path == "/" {
            path
        } else {
            path.trim_end_matches('/')
        };
        self.ensure_defined("mkdir")?;
        self.exec_silent(&format!(
            "mkdir({}, {}, {})",
            str_literal(path),
            py_bool(parents),
            py_bool(exist_ok)
        ))
    }

    fn remove_recursive(&mut self, path: &str) -> Result<(), FsError> {
        self.ensure_defined("remove_recursive")?;

        // The device raises a timeout exception to itself before the serial
        // read can time out; keep re-running until the delete completes.
        let timeout_ms = (self.conn.timeout().as_millis() / 2).max(1);
        loop {
            let (out, err) = self.exec(&format!(
                "remove_recursive({}, {})",
                str_literal(path),
                timeout_ms
            ))?;
            if err.ends_with("\r\nException: Timeout\r\n") {
                continue;
            }
            if !err.is_empty() {
                return Err(traceback_to_error(&err));
            }
            if !out.is_empty() {
                return Err(FsError::Protocol(format!("unexpected output: {out}")));
            }
            return Ok(());
        }
    }

    fn ls(&mut self, path: &str) -> Result<(Vec<String>, Vec<String>), FsError> {
        self.ls_with(path, DEFAULT_BLOCK_SIZE)
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), FsError> {
        self.ensure_defined("os")?;
        self.exec_silent(&format!(
            "os.rename({}, {})",
            str_literal(old_path),
            str_literal(new_path)
        ))
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FsError> {
        self.read_file_with(path, DEFAULT_BLOCK_SIZE)
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> Result<(), FsError> {
        self.write_file_with(path, content, DEFAULT_BLOCK_SIZE)
    }

    fn update_file(
        &mut self,
        path: &str,
        old: &[u8],
        new: &[u8],
        safe: bool,
    ) -> Result<(), FsError> {
        self.update_file_with(path, old, new, DEFAULT_BLOCK_SIZE, DEFAULT_COMMAND_LIMIT, safe)
    }

    fn file_len(&mut self, path: &str) -> Result<u64, FsError> {
        self.ensure_defined("file_len")?;
        let out = self.exec_output(&format!("file_len({})", str_literal(path)))?;
        out.trim()
            .parse()
            .map_err(|_| FsError::Protocol(format!("unparseable file length: {out:?}")))
    }

    fn sync(&mut self) -> Result<(), FsError> {
        self.ensure_defined("os")?;
        self.exec_silent("if hasattr(os, 'sync'): os.sync()")
    }
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}
