use anyhow::{Context, Result};
use std::path::Path;

/// Write `contents` to `path` durably: write to a sibling tempfile, then
/// rename over the destination. A reader never observes a partially written
/// file, and a crash mid-write leaves the previous contents (or nothing)
/// rather than a truncated file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }

    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("fleetwright-state"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(tmp_name);

    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("failed to write tempfile: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tempfile into place: {}", path.display()))?;
    Ok(())
}
