//! Savegame tree ↔ single blob, as gzipped tar.
//!
//! Entry names are paths relative to the archive root, so a pack/unpack
//! round-trip reproduces the tree under any root.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::error::{Result, SupervisorError};

/// Pack the named paths (relative to `root`) into a tar.gz blob.
/// Directories are archived recursively.
pub fn pack(root: &Path, paths: &[String]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for rel in paths {
        let full = root.join(rel);
        let meta = std::fs::metadata(&full).map_err(|e| {
            SupervisorError::Store(format!("{rel} is not a path under {}: {e}", root.display()))
        })?;
        if meta.is_dir() {
            builder
                .append_dir_all(rel, &full)
                .map_err(|e| SupervisorError::Store(format!("archive {rel}: {e}")))?;
        } else {
            builder
                .append_path_with_name(&full, rel)
                .map_err(|e| SupervisorError::Store(format!("archive {rel}: {e}")))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| SupervisorError::Store(format!("finish archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| SupervisorError::Store(format!("finish compression: {e}")))
}

/// Expand a tar.gz blob under `root`, chowning every created entry.
/// Entries that would escape the root are skipped.
pub fn unpack(blob: &[u8], root: &Path, uid: u32, gid: u32) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(blob));
    archive.set_preserve_permissions(true);

    for entry in archive
        .entries()
        .map_err(|e| SupervisorError::Store(format!("read archive: {e}")))?
    {
        let mut entry = entry.map_err(|e| SupervisorError::Store(format!("read entry: {e}")))?;
        let rel: PathBuf = entry
            .path()
            .map_err(|e| SupervisorError::Store(format!("entry path: {e}")))?
            .into_owned();
        if !is_clean_relative(&rel) {
            warn!(path = %rel.display(), "skipping archive entry outside the root");
            continue;
        }

        let dst = root.join(&rel);
        if entry.header().entry_type().is_dir() {
            mkdir_all_chown(&dst, uid, gid)?;
            continue;
        }
        if let Some(parent) = dst.parent() {
            mkdir_all_chown(parent, uid, gid)?;
        }
        entry
            .unpack(&dst)
            .map_err(|e| SupervisorError::Store(format!("unpack {}: {e}", rel.display())))?;
        chown_path(&dst, uid, gid);
    }
    Ok(())
}

fn is_clean_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// `mkdir -p` that chowns each directory it creates.
pub fn mkdir_all_chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    if path.as_os_str().is_empty() || path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        mkdir_all_chown(parent, uid, gid)?;
    }
    match std::fs::create_dir(path) {
        Ok(()) => {
            chown_path(path, uid, gid);
            Ok(())
        }
        // Lost a race with another creator.
        Err(_) if path.is_dir() => Ok(()),
        Err(e) => Err(SupervisorError::Store(format!("mkdir {}: {e}", path.display()))),
    }
}

/// Best-effort chown; a no-op when both ids are 0 (credentials unset).
pub fn chown_path(path: &Path, uid: u32, gid: u32) {
    if uid == 0 && gid == 0 {
        return;
    }
    if let Err(e) = nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    ) {
        warn!(path = %path.display(), error = %e, "chown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_reproduces_the_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir_all(src.path().join("nested/deep")).unwrap();
        std::fs::write(src.path().join("nested/deep/b.bin"), [0u8, 1, 2, 255]).unwrap();

        let blob = pack(
            src.path(),
            &["a.txt".to_string(), "nested".to_string()],
        )
        .unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(&blob, dst.path(), 0, 0).unwrap();

        assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"alpha");
        assert_eq!(
            std::fs::read(dst.path().join("nested/deep/b.bin")).unwrap(),
            [0u8, 1, 2, 255]
        );
    }

    #[test]
    fn missing_path_is_an_error() {
        let src = tempfile::tempdir().unwrap();
        assert!(pack(src.path(), &["absent.txt".to_string()]).is_err());
    }

    #[test]
    fn garbage_blob_is_an_error() {
        let dst = tempfile::tempdir().unwrap();
        assert!(unpack(b"this is not a tar.gz", dst.path(), 0, 0).is_err());
    }

    #[test]
    fn clean_relative_paths() {
        assert!(is_clean_relative(Path::new("saves/world.dat")));
        assert!(is_clean_relative(Path::new("./a")));
        assert!(!is_clean_relative(Path::new("../escape")));
        assert!(!is_clean_relative(Path::new("/etc/passwd")));
    }

    #[test]
    fn mkdir_all_chown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("x/y/z");
        mkdir_all_chown(&deep, 0, 0).unwrap();
        mkdir_all_chown(&deep, 0, 0).unwrap();
        assert!(deep.is_dir());
    }
}
