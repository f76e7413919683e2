//! Temporary file allocation with process-exit cleanup.
//!
//! `TMPDIR_SPEC` overrides the temporary directory, then `TMPDIR`, then
//! `/tmp`. Allocations are registered and removed when the owning guard
//! drops; finalization is always write + fsync + rename, never a poll for
//! the path to appear.

use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static SEQ: AtomicU64 = AtomicU64::new(0);
static REGISTRY: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

pub fn tmp_dir() -> PathBuf {
    for key in ["TMPDIR_SPEC", "TMPDIR"] {
        if let Ok(dir) = std::env::var(key) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
    }
    PathBuf::from("/tmp")
}

/// Allocate a fresh temporary path and register it for cleanup.
pub fn file_name(tag: &str) -> PathBuf {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let path = tmp_dir().join(format!("shardgram.{tag}.{}.{seq}", std::process::id()));
    REGISTRY.lock().unwrap().push(path.clone());
    path
}

pub fn unregister(path: &Path) {
    REGISTRY.lock().unwrap().retain(|p| p != path);
}

/// Remove every registered temporary that still exists.
pub fn cleanup() {
    let paths: Vec<PathBuf> = REGISTRY.lock().unwrap().drain(..).collect();
    for path in paths {
        if path.is_dir() {
            let _ = std::fs::remove_dir_all(&path);
        } else {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Hold one of these in `main`; dropping it removes leftover temporaries.
pub struct TempGuard;

impl Drop for TempGuard {
    fn drop(&mut self) {
        cleanup();
    }
}

/// Write `bytes` next to `path`, fsync, and atomically rename into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let tmp = path.with_file_name(name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_cleaned() {
        let a = file_name("test");
        let b = file_name("test");
        assert_ne!(a, b);
        std::fs::write(&a, b"x").unwrap();
        cleanup();
        assert!(!a.exists());
    }

    #[test]
    fn atomic_write_replaces() {
        let path = file_name("atomic");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        cleanup();
    }
}
