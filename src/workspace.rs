//! Materialization of region documents as files in the workspace root.

use std::io;
use std::path::{Path, PathBuf};

/// File name for the region at `index`: `region_<index>.<extension>`.
pub fn region_file_name(index: usize, extension: &str) -> String {
    format!("region_{}.{}", index, extension)
}

/// Write a region's content to its file in the workspace root, returning
/// the path. Existing content is overwritten.
///
/// A failure here is reported to the user and only skips this region;
/// other regions are materialized independently.
pub fn materialize_region(
    workspace_root: &Path,
    index: usize,
    extension: &str,
    content: &str,
) -> io::Result<PathBuf> {
    let path = workspace_root.join(region_file_name(index, extension));
    std::fs::write(&path, content)?;
    Ok(path)
}
