//! Copy files and directories between the host and the device.

use anyhow::bail;
use clap::Parser;

use crate::fs::with_filesystem;
use crate::repl::interrupt_and_enter_repl;

use super::{GlobalOptions, HybridFilesystem, HybridPath};

/// Copy files between the host and the device, approximately following the
/// POSIX `cp` command's semantics.
#[derive(Debug, Parser)]
pub struct CpCommand {
    /// Files to copy, with the destination last. Prefix with ':' for device
    /// paths.
    #[clap(required = true, num_args = 2..)]
    pub paths: Vec<String>,

    /// Copy directories and their contents recursively.
    #[clap(long, short = 'r', short_alias = 'R')]
    pub recursive: bool,
}

impl CpCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let (destination, sources) = self
            .paths
            .split_last()
            .expect("clap enforces at least two paths");

        if !sources.iter().any(|source| source.starts_with(':'))
            && !destination.starts_with(':')
        {
            eprintln!(
                "warning: neither source nor destination on device (i.e. starting with ':')"
            );
        }

        let mut conn = global.connect()?;
        interrupt_and_enter_repl(conn.as_mut())?;
        with_filesystem(conn.as_mut(), |fs| -> anyhow::Result<()> {
            let mut hybrid = HybridFilesystem::new(fs);
            cp(&mut hybrid, sources, destination, self.recursive)?;
            hybrid.sync()?;
            Ok(())
        })
    }
}

/// Split a command-line source into a `(prefix_plus_dirname, name)` pair.
///
/// The first element keeps the `:` routing prefix (if any) and the directory
/// part including its trailing slash; concatenating the two gives back a
/// normalised path.
fn split_source(source: &str) -> (String, String) {
    // You can never be sure there aren't Windows users about...
    let source = source.replace('\\', "/");

    let (prefix, rest) = match source.strip_prefix(':') {
        Some(rest) => (":", rest.to_string()),
        None => ("", source),
    };

    let mut rest = if rest.is_empty() { ".".to_string() } else { rest };
    if rest != "/" {
        rest = rest.trim_end_matches('/').to_string();
        if rest.is_empty() {
            rest = "/".to_string();
        }
    }

    match rest.rfind('/') {
        Some(index) => (
            format!("{prefix}{}", &rest[..=index]),
            rest[index + 1..].to_string(),
        ),
        None => (prefix.to_string(), rest),
    }
}

/// Read every source, returning `(name, contents)` pairs; directories carry
/// no contents. Names are relative to each source's parent directory, so
/// they can be re-rooted at the destination.
fn read_sources(
    hybrid: &mut HybridFilesystem<'_>,
    sources: &[String],
    recursive: bool,
) -> anyhow::Result<Vec<(String, Option<Vec<u8>>)>> {
    let mut stack: Vec<(String, String)> = sources
        .iter()
        .map(|source| split_source(source))
        .collect();

    let mut out = Vec::new();
    while let Some((base_dir, name)) = stack.pop() {
        let full = HybridPath::parse(&format!("{base_dir}{name}"));
        if hybrid.get_type(&full)?.is_dir() {
            if !recursive {
                bail!("-r not given; cannot copy directory {}", full.display());
            }
            let (directories, files) = hybrid.ls(&full)?;
            for sub in directories.into_iter().chain(files) {
                stack.push((base_dir.clone(), format!("{name}/{sub}")));
            }
            out.push((name, None));
        } else {
            let content = hybrid.read_file(&full)?;
            out.push((name, Some(content)));
        }
    }

    Ok(out)
}

fn write_single_file_to_destination(
    hybrid: &mut HybridFilesystem<'_>,
    file: (String, Option<Vec<u8>>),
    destination: &HybridPath,
) -> anyhow::Result<()> {
    let (name, data) = file;
    let data = data.unwrap_or_default();
    if hybrid.get_type(destination)?.is_dir() {
        hybrid.write_file(&destination.join(&name), &data)?;
    } else {
        hybrid.write_file(destination, &data)?;
    }
    Ok(())
}

fn write_multiple_files_to_existing_directory(
    hybrid: &mut HybridFilesystem<'_>,
    mut files: Vec<(String, Option<Vec<u8>>)>,
    destination: &HybridPath,
) -> anyhow::Result<()> {
    // Sorted order means directories are created before their contents
    files.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, data) in files {
        match data {
            None => hybrid.mkdir(&destination.join(&name), false, true)?,
            Some(data) => hybrid.write_file(&destination.join(&name), &data)?,
        }
    }
    Ok(())
}

fn write_single_directory_to_non_existing_destination(
    hybrid: &mut HybridFilesystem<'_>,
    mut files: Vec<(String, Option<Vec<u8>>)>,
    destination: &HybridPath,
) -> anyhow::Result<()> {
    files.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, data) in files {
        // Drop the source directory's own name: its contents land directly
        // in the destination.
        let relative = name.split_once('/').map(|(_, rest)| rest).unwrap_or("");
        let target = if relative.is_empty() {
            destination.clone()
        } else {
            destination.join(relative)
        };
        match data {
            None => hybrid.mkdir(&target, false, true)?,
            Some(data) => hybrid.write_file(&target, &data)?,
        }
    }
    Ok(())
}

/// Copy `sources` to `destination`, both sides hybrid.
pub(crate) fn cp(
    hybrid: &mut HybridFilesystem<'_>,
    sources: &[String],
    destination: &str,
    recursive: bool,
) -> anyhow::Result<()> {
    let files = read_sources(hybrid, sources, recursive)?;
    let destination = HybridPath::parse(destination);

    let single_source_is_dir = sources.len() == 1
        && hybrid
            .get_type(&HybridPath::parse(&sources[0]))?
            .is_dir();

    if sources.len() == 1 && !single_source_is_dir {
        let file = files.into_iter().next().expect("one source, one file");
        write_single_file_to_destination(hybrid, file, &destination)
    } else if sources.len() == 1 && !hybrid.get_type(&destination)?.is_dir() {
        write_single_directory_to_non_existing_destination(hybrid, files, &destination)
    } else {
        write_multiple_files_to_existing_directory(hybrid, files, &destination)
    }
}
