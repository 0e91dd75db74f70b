//! Durable writes for the state directory.
//!
//! A snapshot is only replaced once its bytes and the directory entry that
//! names it have reached disk. The journal syncs its file handle directly.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Flushes file contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Flushes a directory so that renames and creations inside it persist.
///
/// Fails if `dir` does not exist.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Replaces `path` with `bytes` so that a crash leaves either the old
/// contents or the new ones, never a torn file.
///
/// The bytes go to `<path>.tmp` first, which is synced and renamed over
/// `path`; the parent directory is synced last. Missing parents are created.
pub fn replace_durably(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;
    file.write_all(bytes)?;
    fsync_file(&file)?;
    drop(file);

    std::fs::rename(tmp_path, path)?;
    if let Some(parent) = parent {
        fsync_dir(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replace_creates_missing_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("snapshot.json");

        replace_durably(&path, b"{}").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn replace_overwrites_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        replace_durably(&path, b"first, and longer").unwrap();
        replace_durably(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("snapshot.json")]);
    }

    #[test]
    fn syncing_an_appended_journal_handle() {
        let dir = tempdir().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.path().join("events.log"))
            .unwrap();
        writeln!(file, "{{\"seq\":0}}").unwrap();

        fsync_file(&file).unwrap();
        fsync_dir(dir.path()).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let err = fsync_dir(&dir.path().join("gone")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
