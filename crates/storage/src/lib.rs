//! File-level durability primitives.
//!
//! This crate knows nothing about pages, chunks, rows or tables. It owns
//! exactly one concern: the atomic save / rollback / clean protocol over a
//! directory of sibling files, each backed by a pre-image under `old/`
//! (spec §6). Everything above this layer — what bytes a page file holds,
//! what a data block looks like — is the caller's business.

mod durable;
mod error;

pub use durable::{
    clean_dir, ensure_layout, old_path, prune_extraneous, restore_backups, rollback_dir,
    safe_remove, save_file,
};
pub use error::{Result, StorageError};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;

    #[test]
    fn save_backs_up_previous_image_once() {
        let dir = tempfile::tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();

        save_file(dir.path(), "page-0", b"v1", true).unwrap();
        assert!(!old_path(dir.path(), "page-0").exists());

        save_file(dir.path(), "page-0", b"v2", false).unwrap();
        assert_eq!(
            fs::read(old_path(dir.path(), "page-0")).unwrap(),
            b"v1"
        );
        assert_eq!(fs::read(dir.path().join("page-0")).unwrap(), b"v2");

        // A second save must not clobber the v1 backup.
        save_file(dir.path(), "page-0", b"v3", false).unwrap();
        assert_eq!(
            fs::read(old_path(dir.path(), "page-0")).unwrap(),
            b"v1"
        );
    }

    #[test]
    fn rollback_restores_backup_and_removes_extraneous_files() {
        let dir = tempfile::tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();

        save_file(dir.path(), "page-0", b"v1", true).unwrap();
        save_file(dir.path(), "page-0", b"v2", false).unwrap();
        // A page allocated after the last save, never backed up.
        save_file(dir.path(), "page-1", b"new", true).unwrap();

        let mut live = HashSet::new();
        live.insert("page-0".to_string());

        rollback_dir(dir.path(), &live, dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("page-0")).unwrap(), b"v1");
        assert!(!dir.path().join("page-1").exists());
    }

    #[test]
    fn clean_removes_backups_only() {
        let dir = tempfile::tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();

        save_file(dir.path(), "page-0", b"v1", true).unwrap();
        save_file(dir.path(), "page-0", b"v2", false).unwrap();

        clean_dir(dir.path()).unwrap();

        assert!(!old_path(dir.path(), "page-0").exists());
        assert_eq!(fs::read(dir.path().join("page-0")).unwrap(), b"v2");
    }

    #[test]
    #[should_panic(expected = "refusing to delete")]
    fn safe_remove_refuses_paths_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("not-yours");
        fs::write(&victim, b"x").unwrap();

        let _ = safe_remove(&victim, root.path());
    }
}
