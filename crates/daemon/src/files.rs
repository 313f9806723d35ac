//! File helpers for capture output: segment naming, moving existing
//! files out of the way, and cross-filesystem moves.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Path of capture segment `n` for a job.
///
/// Segments are `<output_dir>/<file_base><n>.ts`.
pub fn segment_path(output_dir: &Path, file_base: &str, n: usize) -> PathBuf {
    output_dir.join(format!("{}{}.ts", file_base, n))
}

/// Rename an existing file at `path` to `<stem>_<random>.<ext>`.
///
/// Returns the new location, or `None` if nothing was there.
pub fn set_aside(path: &Path) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}_{}", stem, suffix),
    };
    let target = path.with_file_name(name);
    fs::rename(path, &target)?;
    Ok(Some(target))
}

/// Move a file, falling back to copy + delete across filesystems.
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Size of a file, `None` if it does not exist.
pub fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}
