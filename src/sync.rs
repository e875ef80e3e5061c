//! Directory synchronisation to a device, driven by a host-side shadow cache.
//!
//! An rsync-like scheme where the device computes hashes is out of reach:
//! typical MicroPython hardware cannot do that fast enough to be worth it.
//! Instead the host keeps a cache of everything it believes is on the
//! device, diffs against that, and sends only what changed.
//!
//! To know whether the cache can be trusted, a small identity token is kept
//! on the device at `.upyt_id.txt`: a three-digit decimal version which
//! changes on every write session, and a twelve-digit hex ID which is fixed
//! at first contact and identifies the device tree over time. The cache
//! holds a copy; matching versions mean the cache is believed fresh.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs_host;
use rand::Rng;
use thiserror::Error;
use walkdir::WalkDir;

use crate::fs::{Filesystem, FsError};
use crate::glob::ExclusionMatcher;

pub const UPYT_ID_FILENAME: &str = ".upyt_id.txt";
pub const UPYT_CACHE_DIRNAME: &str = ".upyt_cache";

/// Exclusion patterns applied by default: common Python, VCS and editor
/// litter, plus our own cache.
pub fn default_exclude() -> Vec<String> {
    [
        // Python litter
        "*.pyc",
        "__pycache__",
        // Version control files
        ".git",
        ".cvs",
        ".svn",
        // Editor temporary files
        "*.tmp",
        "*.swp",
        "*~",
        // Upyt litter
        UPYT_CACHE_DIRNAME,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("invalid exclusion pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("invalid device identity token: {0}")]
    InvalidId(String),
}

/// Parse the contents of a `.upyt_id.txt` file into `(version, device_id)`.
///
/// The accepted form is exactly: three decimal digits, one space, one ASCII
/// identity token, no trailing newline. Anything else is rejected so callers
/// treat the file as absent.
pub fn decode_upyt_id(content: &[u8]) -> Result<(u32, String), SyncError> {
    let text = std::str::from_utf8(content)
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| SyncError::InvalidId("not ASCII".to_string()))?;

    let mut fields = text.split(' ');
    let (Some(version), Some(device_id), None) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(SyncError::InvalidId(format!(
            "expected two fields: {text:?}"
        )));
    };

    if version.len() != 3 || !version.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(SyncError::InvalidId(format!(
            "bad version field: {version:?}"
        )));
    }
    let version: u32 = version
        .parse()
        .map_err(|_| SyncError::InvalidId(format!("bad version field: {version:?}")))?;

    if device_id.is_empty() || !device_id.bytes().all(|byte| byte.is_ascii_graphic()) {
        return Err(SyncError::InvalidId(format!(
            "bad device ID field: {device_id:?}"
        )));
    }

    Ok((version, device_id.to_string()))
}

/// Encode a `.upyt_id.txt` file.
pub fn encode_upyt_id(version: u32, device_id: &str) -> Result<Vec<u8>, SyncError> {
    if version > 999 {
        return Err(SyncError::InvalidId(format!(
            "version {version} does not fit in three digits"
        )));
    }
    if device_id.is_empty() || !device_id.bytes().all(|byte| byte.is_ascii_graphic()) {
        return Err(SyncError::InvalidId(format!(
            "bad device ID: {device_id:?}"
        )));
    }
    Ok(format!("{version:03} {device_id}").into_bytes())
}

/// Join a device directory and a slash-separated relative path.
fn device_join(device_dir: &str, relative: &str) -> String {
    format!("{}/{}", device_dir.trim_end_matches('/'), relative)
}

/// A path relative to some root, rendered slash-separated.
fn unix_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Read the identity token from a directory on the device, generating (and
/// writing) a fresh one when it is absent or unparseable. Creates the
/// directory if needed.
pub fn get_upyt_id(
    fs: &mut dyn Filesystem,
    device_dir: &str,
) -> Result<(u32, String), SyncError> {
    let filename = device_join(device_dir, UPYT_ID_FILENAME);

    match fs.read_file(&filename) {
        Ok(content) => {
            if let Ok(pair) = decode_upyt_id(&content) {
                return Ok(pair);
            }
        }
        Err(FsError::Os(_)) => (),
        Err(err) => return Err(err.into()),
    }

    let version = 0;
    let device_id = format!("{:012X}", rand::thread_rng().gen_range(0..1u64 << 48));
    fs.mkdir(device_dir, true, true)?;
    fs.write_file(&filename, &encode_upyt_id(version, &device_id)?)?;
    Ok((version, device_id))
}

/// Enumerate the files and directories under `host_dir`, as paths relative
/// to it, after applying exclusion patterns.
pub fn enumerate_local_files(
    host_dir: &Path,
    exclude: &[String],
) -> Result<Vec<PathBuf>, SyncError> {
    let matcher = ExclusionMatcher::new(exclude)?;

    let mut out = Vec::new();
    let mut walker = WalkDir::new(host_dir).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(host_dir)
            .expect("walked entries live under the walked root")
            .to_path_buf();
        let is_dir = entry.file_type().is_dir();

        if matcher.is_excluded(&unix_path(&relative), is_dir) {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }
        out.push(relative);
    }

    Ok(out)
}

/// Remove all shadow caches under a source directory.
pub fn clear_local_cache(host_dir: &Path) -> io::Result<()> {
    let cache_dir = host_dir.join(UPYT_CACHE_DIRNAME);
    if cache_dir.is_dir() {
        fs_host::remove_dir_all(&cache_dir)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rsync-style exclusion patterns.
    pub exclude: Vec<String>,
    /// Always treat every host file as needing an update, regardless of what
    /// the cache claims.
    pub force_enumerate_files: bool,
    /// Always verify differential updates against a device-side checksum.
    pub force_safe_update: bool,
}

impl Default for SyncOptions {
    fn default() -> SyncOptions {
        SyncOptions {
            exclude: default_exclude(),
            force_enumerate_files: false,
            force_safe_update: false,
        }
    }
}

/// Called once before each changed file is written, with the file, the set
/// being updated and the full set of host files.
pub type ProgressCallback<'a> =
    &'a mut dyn FnMut(&Path, &BTreeSet<PathBuf>, &BTreeSet<PathBuf>);

/// Recursively synchronise `host_dir` into `device_dir` on the device.
///
/// Files and directories already on the device but absent on the host are
/// left untouched; sync never deletes on the device.
pub fn sync_to_device(
    fs: &mut dyn Filesystem,
    host_dir: &Path,
    device_dir: &str,
    options: &SyncOptions,
    mut progress_callback: Option<ProgressCallback<'_>>,
) -> Result<(), SyncError> {
    let (version, device_id) = get_upyt_id(fs, device_dir)?;

    // Locate (and create) the shadow cache for this device
    let cache_dir = host_dir.join(UPYT_CACHE_DIRNAME).join(&device_id);
    fs_host::create_dir_all(&cache_dir)?;

    let cache_version = fs_host::read(cache_dir.join(UPYT_ID_FILENAME))
        .ok()
        .and_then(|content| decode_upyt_id(&content).ok())
        .map(|(cache_version, _id)| cache_version);
    let out_of_date_cache = cache_version != Some(version);

    // Bump the version on the device now, but in the cache only at the very
    // end: a crash part way through leaves the two disagreeing, so the next
    // run knows not to trust the cache.
    let version = (version + 1) % 1000;
    fs.write_file(
        &device_join(device_dir, UPYT_ID_FILENAME),
        &encode_upyt_id(version, &device_id)?,
    )?;

    // Enumerate the host and the cache
    let mut exclude = options.exclude.clone();
    exclude.push(format!("/{UPYT_CACHE_DIRNAME}/"));
    let host_files: BTreeSet<PathBuf> = enumerate_local_files(host_dir, &exclude)?
        .into_iter()
        .collect();

    let mut cached_files: BTreeSet<PathBuf> = BTreeSet::new();
    for entry in WalkDir::new(&cache_dir).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        cached_files.insert(
            entry
                .path()
                .strip_prefix(&cache_dir)
                .expect("walked entries live under the cache root")
                .to_path_buf(),
        );
    }

    // Work out which files might have changed
    let to_update: BTreeSet<PathBuf> = if out_of_date_cache || options.force_enumerate_files {
        host_files.clone()
    } else {
        let mut changed = BTreeSet::new();
        for path in &host_files {
            let host_path = host_dir.join(path);
            let cache_path = cache_dir.join(path);
            let needs_update =
                // Not on the device yet
                !cached_files.contains(path)
                // Flipped between file and directory
                || host_path.is_file() != cache_path.is_file()
                // Content changed
                || (host_path.is_file()
                    && cache_path.is_file()
                    && fs_host::read(&host_path)? != fs_host::read(&cache_path)?);
            if needs_update {
                changed.insert(path.clone());
            }
        }
        changed
    };

    // Flush cache entries which no longer exist on the host, so that no
    // stale file blocks a directory (or vice versa) we are about to mirror.
    for path in cached_files.difference(&host_files) {
        if path == Path::new(UPYT_ID_FILENAME) {
            continue;
        }
        let full_path = cache_dir.join(path);
        if full_path.is_dir() {
            fs_host::remove_dir_all(&full_path)?;
        } else if full_path.is_file() {
            fs_host::remove_file(&full_path)?;
        }
    }

    // Ensure all directories exist (and are directories). Sorted order means
    // parents are created before their children.
    for path in &to_update {
        if !host_dir.join(path).is_dir() {
            continue;
        }
        let device_path = device_join(device_dir, &unix_path(path));

        if fs.get_type(&device_path)?.is_file() {
            fs.remove_recursive(&device_path)?;
        }
        fs.mkdir(&device_path, false, true)?;

        let cache_path = cache_dir.join(path);
        if cache_path.is_file() {
            fs_host::remove_file(&cache_path)?;
        }
        fs_host::create_dir_all(&cache_path)?;
    }

    // Ensure all files exist and are up to date
    for path in &to_update {
        if host_dir.join(path).is_dir() {
            continue;
        }
        if let Some(callback) = progress_callback.as_mut() {
            (**callback)(path, &to_update, &host_files);
        }

        let device_path = device_join(device_dir, &unix_path(path));

        // A directory in the way must go before the file lands
        if fs.get_type(&device_path)?.is_dir() {
            fs.remove_recursive(&device_path)?;
        }

        let new_content = fs_host::read(host_dir.join(path))?;
        let safe = out_of_date_cache || options.force_safe_update;
        let update_result = match fs_host::read(cache_dir.join(path)) {
            Ok(old_content) => fs.update_file(&device_path, &old_content, &new_content, safe),
            Err(err) => Err(FsError::Io(err)),
        };
        match update_result {
            Ok(()) => (),
            // No cached copy, no matching file on the device, or a checksum
            // mismatch: write the whole file from scratch instead.
            Err(FsError::Os(_) | FsError::Update(_) | FsError::Io(_)) => {
                log::debug!("falling back to a full write of {}", device_path);
                fs.write_file(&device_path, &new_content)?;
            }
            Err(other) => return Err(other.into()),
        }

        // Mirror into the cache
        let cache_path = cache_dir.join(path);
        if cache_path.is_dir() {
            fs_host::remove_dir_all(&cache_path)?;
        }
        if let Some(parent) = cache_path.parent() {
            fs_host::create_dir_all(parent)?;
        }
        fs_host::write(&cache_path, &new_content)?;
    }

    // Only now that everything worked does the cache learn the new version
    fs_host::write(
        cache_dir.join(UPYT_ID_FILENAME),
        encode_upyt_id(version, &device_id)?,
    )?;

    Ok(())
}
