use std::io::{Read as _, Write as _};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use glob::Pattern;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

/// Gzipped tarball of the project tree, held in a temp file that is removed
/// when the archive is dropped.
pub struct Archive {
    pub file: NamedTempFile,
    pub sha256: String,
    pub entries: usize,
}

/// Compile `deploy.exclude` once per build
pub fn exclude_patterns(exclude: &[String]) -> Result<Vec<Pattern>> {
    exclude
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("Invalid exclude pattern '{}'", p)))
        .collect()
}

/// Patterns apply to single path components, so `__pycache__` skips every
/// such directory at any depth.
pub fn is_excluded(name: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| pattern.matches(name))
}

pub fn build(source: &Path, exclude: &[String]) -> Result<Archive> {
    if !source.join("manage.py").is_file() {
        bail!(
            "{} does not look like a Django project (no manage.py)",
            source.display()
        );
    }
    if !source.join("requirements.txt").is_file() {
        bail!("{} has no requirements.txt", source.display());
    }

    let patterns = exclude_patterns(exclude)?;

    let file = tempfile::Builder::new()
        .prefix("deckhand-code-")
        .suffix(".tar.gz")
        .tempfile()
        .context("Failed to create temp file for the archive")?;

    let encoder = GzEncoder::new(file.reopen()?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = 0;
    let walker = walkdir::WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(&e.file_name().to_string_lossy(), &patterns));

    for entry in walker {
        let entry = entry.context("Failed to walk project tree")?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("failed to relativize path")?;
        builder
            .append_path_with_name(entry.path(), rel)
            .with_context(|| format!("Failed to add {} to archive", rel.display()))?;
        entries += 1;
    }

    let mut encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.flush()?;
    encoder.finish().context("Failed to finish gzip stream")?;

    let sha256 = digest(file.path())?;
    debug!("Archived {} entries, sha256 {}", entries, sha256);

    Ok(Archive {
        file,
        sha256,
        entries,
    })
}

fn digest(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut reader = std::fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Commit of the local checkout, when the source is one
pub fn local_revision(source: &Path) -> Option<String> {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(source)
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}
