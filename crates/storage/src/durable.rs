//! Atomic save / rollback / clean protocol shared by pages, data blocks and
//! meta files (spec §6). Every durable object in this workspace is a single
//! file `<dir>/<name>` with a pre-image mirror at `<dir>/old/<name>`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.into();
    move |source| StorageError::io(path, source)
}

/// Backup path for a sibling file: `<dir>/old/<name>`.
pub fn old_path(dir: &Path, name: &str) -> PathBuf {
    dir.join("old").join(name)
}

/// Ensures `<dir>` and `<dir>/old` exist. Called once when a table/index is
/// created.
pub fn ensure_layout(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let old = dir.join("old");
    fs::create_dir_all(&old).map_err(io_err(&old))?;
    Ok(())
}

/// Writes `bytes` to `<dir>/<name>`, atomically preserving the previous
/// durable image under `old/` first (spec §6, "Save protocol").
///
/// `is_new` is true for a file that has never been saved before (freshly
/// allocated page/data block/chunk) — there is no prior durable image to
/// back up.
pub fn save_file(dir: &Path, name: &str, bytes: &[u8], is_new: bool) -> Result<()> {
    let path = dir.join(name);

    if !is_new {
        let backup = old_path(dir, name);
        if !backup.exists() {
            if path.exists() {
                log::debug!("backing up {} to {}", path.display(), backup.display());
                fs::rename(&path, &backup).map_err(io_err(&path))?;
            } else {
                log::warn!(
                    "save_file: {} marked as not new but has no current file to back up",
                    path.display()
                );
            }
        }
    }

    fs::write(&path, bytes).map_err(io_err(&path))?;
    Ok(())
}

/// Renames every file under `<dir>/old` back over its sibling in `<dir>`,
/// overwriting it (spec §6, "Rollback protocol", step 1). Returns the set
/// of names restored, which the caller needs to exempt from pruning even
/// though they may not (yet) appear in any metadata the caller has read.
///
/// Split out from [`rollback_dir`] because a directory's own `meta.*` file
/// is itself one of the restored names: callers that need to know the
/// *restored* set of live files (an [`crate::Index`]'s page map, a
/// table's data-block map) must restore first, then re-read `meta.*` to
/// learn which files are live, and only then prune — reading `meta.*`
/// before restoring would compute the live set from the state being
/// rolled back, not the state being rolled back *to*.
pub fn restore_backups(dir: &Path) -> Result<HashSet<String>> {
    let old_dir = dir.join("old");
    let mut restored = HashSet::new();
    if !old_dir.exists() {
        return Ok(restored);
    }

    for entry in fs::read_dir(&old_dir).map_err(io_err(&old_dir))? {
        let entry = entry.map_err(io_err(&old_dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        let from = old_dir.join(&name);
        let to = dir.join(&name);
        log::info!("rollback: restoring {} from {}", to.display(), from.display());
        fs::rename(&from, &to).map_err(io_err(&from))?;
        restored.insert(name);
    }

    Ok(restored)
}

/// Deletes any file directly under `<dir>` that is neither named by
/// `live_names` nor in `restored` (spec §6, "Rollback protocol", step 2).
/// `db_root` gates every deletion through [`safe_remove`].
pub fn prune_extraneous(
    dir: &Path,
    live_names: &HashSet<String>,
    restored: &HashSet<String>,
    db_root: &Path,
) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !live_names.contains(&name) && !restored.contains(&name) {
            log::info!("rollback: removing extraneous file {}", path.display());
            safe_remove(&path, db_root)?;
        }
    }

    Ok(())
}

/// Restores every file under `<dir>/old` over its sibling in `<dir>`, then
/// deletes any file in `<dir>` that `live_names` no longer claims (spec §6,
/// "Rollback protocol"). Use this only when `live_names` is already known
/// to describe the state being rolled back *to* — e.g. it was computed
/// from a separately-tracked in-memory mirror, not read from the very
/// `meta.*` file this rollback restores. When rollback must re-derive
/// `live_names` from a restored `meta.*`, call [`restore_backups`] and
/// [`prune_extraneous`] directly instead.
pub fn rollback_dir(dir: &Path, live_names: &HashSet<String>, db_root: &Path) -> Result<()> {
    let restored = restore_backups(dir)?;
    prune_extraneous(dir, live_names, &restored, db_root)
}

/// Deletes every file under `<dir>/old` (spec §6, "Clean protocol"). Run
/// once a save has fully succeeded.
pub fn clean_dir(dir: &Path) -> Result<()> {
    let old_dir = dir.join("old");
    if !old_dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(&old_dir).map_err(io_err(&old_dir))? {
        let entry = entry.map_err(io_err(&old_dir))?;
        let path = entry.path();
        fs::remove_file(&path).map_err(io_err(&path))?;
    }

    Ok(())
}

/// Removes a single file, but only if it lies within `db_root`.
///
/// This is the one place the engine deletes a file outside of the
/// `old/`-backed save/rollback dance, so it is the one place a bug could
/// walk a path outside the database directory. Per spec §7 that is a hard
/// abort, not a recoverable error.
pub fn safe_remove(path: &Path, db_root: &Path) -> Result<()> {
    let canonical_root = db_root.canonicalize().unwrap_or_else(|_| db_root.to_path_buf());
    let canonical_path = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());

    assert!(
        canonical_path.starts_with(&canonical_root),
        "refusing to delete {} outside database root {}",
        canonical_path.display(),
        canonical_root.display()
    );

    fs::remove_file(path).map_err(io_err(path))
}
