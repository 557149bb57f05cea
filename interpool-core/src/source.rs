//! Source File Metadata Lookup
//!
//! Reconciliation compares a class's cached modification time against the
//! file on disk. A failed stat must leave the class untouched, so the
//! lookup is fallible and side-effect free.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Metadata snapshot of a script source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStat {
    /// Last modification time.
    pub mtime: SystemTime,
    /// File size in bytes.
    pub size: u64,
}

/// Stat a script source on disk.
///
/// Rejects anything that is not a regular readable file, since only those
/// can ever be loaded as class sources.
pub fn stat_source(path: &Path) -> io::Result<SourceStat> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' is not a regular file", path.display()),
        ));
    }
    Ok(SourceStat {
        mtime: meta.modified()?,
        size: meta.len(),
    })
}
