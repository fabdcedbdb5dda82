//! On-disk snapshots of a room's files.
//!
//! Layout:
//! ```text
//! <sessions_root>/
//!   <ROOM_ID>/
//!     index.html
//!     style.css
//!     .git/        (managed by the VCS integrator)
//! ```
//!
//! Snapshots are only taken right before a commit. Writes are
//! synchronous; room file sets are small. Entries that are not files of
//! the room (other than `.git`) are removed, so a room recreated under an
//! evicted room's id never commits the old room's files.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::protocol::File;

/// Snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Invalid room id for snapshot: {0:?}")]
    InvalidRoomId(String),
    #[error("Invalid file name for snapshot: {0:?}")]
    InvalidFileName(String),
    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const VCS_DIR: &str = ".git";

/// Writes room files below a sessions root.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    root: PathBuf,
}

impl SnapshotWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding a room's snapshot.
    pub fn room_dir(&self, room_id: &str) -> Result<PathBuf, PersistError> {
        if !is_single_component(room_id) {
            return Err(PersistError::InvalidRoomId(room_id.to_string()));
        }
        Ok(self.root.join(room_id))
    }

    /// Write every file to `<root>/<room_id>/<name>` and return the directory.
    ///
    /// Files are written in creation order, so with duplicate names the
    /// later file's content ends up on disk. All names are checked before
    /// anything is written.
    pub fn snapshot(&self, room_id: &str, files: &[File]) -> Result<PathBuf, PersistError> {
        let dir = self.room_dir(room_id)?;
        if let Some(bad) = files.iter().find(|f| !is_single_component(&f.name)) {
            return Err(PersistError::InvalidFileName(bad.name.clone()));
        }

        std::fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.clone(),
            source,
        })?;

        prune_stale(&dir, files)?;

        for file in files {
            let path = dir.join(&file.name);
            std::fs::write(&path, file.content.as_bytes())
                .map_err(|source| PersistError::Io { path, source })?;
        }

        log::debug!("Snapshot of {} files written to {}", files.len(), dir.display());
        Ok(dir)
    }
}

/// Remove everything in `dir` except `.git` and the given files.
fn prune_stale(dir: &Path, files: &[File]) -> Result<(), PersistError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PersistError::Io { path, source }
    };
    let keep: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();

    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == VCS_DIR || keep.contains(name.as_ref()) {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err(&path))?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(&path).map_err(io_err(&path))?;
        } else {
            std::fs::remove_file(&path).map_err(io_err(&path))?;
        }
        log::debug!("Removed stale snapshot entry {}", path.display());
    }
    Ok(())
}

/// `true` if `name` is exactly one normal path component.
fn is_single_component(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: u64, name: &str, content: &str) -> File {
        File {
            id,
            name: name.into(),
            content: content.into(),
            is_active: false,
        }
    }

    #[test]
    fn test_snapshot_writes_one_file_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());

        let files = vec![file(1, "index.html", "<h1>Hi</h1>"), file(2, "style.css", "")];
        let room_dir = writer.snapshot("ABC123", &files).unwrap();

        assert_eq!(room_dir, dir.path().join("ABC123"));
        assert_eq!(std::fs::read_to_string(room_dir.join("index.html")).unwrap(), "<h1>Hi</h1>");
        assert_eq!(std::fs::read_to_string(room_dir.join("style.css")).unwrap(), "");
    }

    #[test]
    fn test_snapshot_overwrites_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());

        writer.snapshot("R", &[file(1, "a.txt", "old")]).unwrap();
        let room_dir = writer.snapshot("R", &[file(1, "a.txt", "new")]).unwrap();
        assert_eq!(std::fs::read_to_string(room_dir.join("a.txt")).unwrap(), "new");
    }

    #[test]
    fn test_duplicate_names_later_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());

        let files = vec![file(1, "a.txt", "first"), file(2, "a.txt", "second")];
        let room_dir = writer.snapshot("R", &files).unwrap();
        assert_eq!(std::fs::read_to_string(room_dir.join("a.txt")).unwrap(), "second");
    }

    #[test]
    fn test_snapshot_removes_files_left_by_a_previous_room() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path());

        let room_dir = writer
            .snapshot("ABC123", &[file(1, "index.html", "old"), file(2, "old.js", "x")])
            .unwrap();
        std::fs::create_dir_all(room_dir.join(".git")).unwrap();
        std::fs::write(room_dir.join(".git").join("HEAD"), "ref: refs/heads/main").unwrap();
        std::fs::create_dir_all(room_dir.join("assets")).unwrap();

        // Same id, new room: only its own files remain next to `.git`.
        writer.snapshot("ABC123", &[file(1, "index.html", "new")]).unwrap();

        let mut names: Vec<String> = std::fs::read_dir(&room_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![".git", "index.html"]);
        assert_eq!(std::fs::read_to_string(room_dir.join("index.html")).unwrap(), "new");
        assert!(room_dir.join(".git").join("HEAD").exists());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("sessions"));

        for name in ["../escape.txt", "sub/dir.txt", "..", ".", "", "/etc/passwd", "a\\b"] {
            let err = writer.snapshot("R", &[file(1, name, "x")]).unwrap_err();
            assert!(matches!(err, PersistError::InvalidFileName(_)), "{name:?} accepted");
        }
        // Nothing was written for the rejected snapshots.
        assert!(!dir.path().join("sessions").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_rejects_bad_room_id() {
        let writer = SnapshotWriter::new("/tmp/unused");
        assert!(matches!(writer.room_dir("../x"), Err(PersistError::InvalidRoomId(_))));
        assert!(matches!(writer.room_dir(""), Err(PersistError::InvalidRoomId(_))));
        assert_eq!(writer.room_dir("ABC").unwrap(), PathBuf::from("/tmp/unused/ABC"));
    }
}
