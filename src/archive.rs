//! gzip tarballs of build trees.
//!
//! Archives are flat: the entries are the immediate children of the packed
//! directory, never the directory itself. Extraction validates every member
//! before anything is written.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, EntryType};
use tracing::debug;

use crate::error::{Error, IoContext, Result};

/// Pack the contents of `source_dir` into a new temporary `.tar.gz`.
///
/// The file is persisted and its path returned; the caller owns cleanup.
pub fn pack(source_dir: &Path) -> Result<PathBuf> {
    let (_file, path) = tempfile::Builder::new()
        .prefix("bob-build-")
        .suffix(".tar.gz")
        .tempfile()
        .io_context(|| "creating temporary archive")?
        .keep()
        .map_err(|err| Error::io("persisting temporary archive", err.error))?;
    pack_into(source_dir, &path)?;
    Ok(path)
}

/// Pack the contents of `source_dir` into `out_path`.
pub fn pack_into(source_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .io_context(|| format!("creating archive '{}'", out_path.display()))?;
    let mut builder = Builder::new(GzEncoder::new(out, Compression::default()));
    builder.follow_symlinks(false);

    let mut children = Vec::new();
    for entry in fs::read_dir(source_dir)
        .io_context(|| format!("reading directory '{}'", source_dir.display()))?
    {
        let entry =
            entry.io_context(|| format!("reading entry in '{}'", source_dir.display()))?;
        children.push(entry);
    }
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let name = child.file_name();
        let path = child.path();
        let file_type = child
            .file_type()
            .io_context(|| format!("reading file type for '{}'", path.display()))?;
        debug!("adding {} to archive", path.display());
        if file_type.is_dir() {
            builder
                .append_dir_all(&name, &path)
                .io_context(|| format!("archiving directory '{}'", path.display()))?;
        } else {
            builder
                .append_path_with_name(&path, &name)
                .io_context(|| format!("archiving '{}'", path.display()))?;
        }
    }

    let encoder = builder
        .into_inner()
        .io_context(|| format!("finalizing archive '{}'", out_path.display()))?;
    encoder
        .finish()
        .io_context(|| format!("finishing gzip stream '{}'", out_path.display()))?;
    Ok(())
}

/// Extract `archive_path` into `dest_dir`.
///
/// Every member (and every link target) is checked to stay inside
/// `dest_dir` before the first byte is written; a single offender aborts
/// the whole extraction with [`Error::PathTraversal`].
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let root = std::path::absolute(dest_dir)
        .io_context(|| format!("resolving '{}'", dest_dir.display()))?;
    let root = normalize(&root);

    validate_members(archive_path, &root)?;

    fs::create_dir_all(&root).io_context(|| format!("creating '{}'", root.display()))?;
    let mut archive = open(archive_path)?;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(&root).io_context(|| {
        format!(
            "extracting '{}' into '{}'",
            archive_path.display(),
            root.display()
        )
    })
}

fn open(archive_path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(archive_path)
        .io_context(|| format!("opening archive '{}'", archive_path.display()))?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn validate_members(archive_path: &Path, root: &Path) -> Result<()> {
    let mut archive = open(archive_path)?;
    let entries = archive
        .entries()
        .io_context(|| format!("reading archive '{}'", archive_path.display()))?;

    for entry in entries {
        let entry =
            entry.io_context(|| format!("reading member of '{}'", archive_path.display()))?;
        let member = entry
            .path()
            .io_context(|| format!("decoding member path in '{}'", archive_path.display()))?
            .into_owned();
        let traversal = || Error::PathTraversal {
            archive: archive_path.to_path_buf(),
            member: member.display().to_string(),
            dest: root.to_path_buf(),
        };

        let target = normalize(&root.join(&member));
        if !target.starts_with(root) {
            return Err(traversal());
        }

        let link = entry
            .link_name()
            .io_context(|| format!("decoding link target in '{}'", archive_path.display()))?;
        let link_target = match (entry.header().entry_type(), link) {
            (EntryType::Symlink, Some(link)) => {
                let base = target.parent().unwrap_or(root);
                Some(normalize(&base.join(link)))
            }
            (EntryType::Link, Some(link)) => Some(normalize(&root.join(link))),
            _ => None,
        };
        if let Some(link_target) = link_target {
            if !link_target.starts_with(root) {
                return Err(traversal());
            }
        }
    }
    Ok(())
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// sha256 hex digest and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .io_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}
