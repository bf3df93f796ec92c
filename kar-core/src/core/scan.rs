//! Filesystem side of the engine: scanning a source directory into an
//! `EntryTree` and recreating entries (with their attributes) on extraction.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use filetime::FileTime;
use log::{debug, warn};
use walkdir::WalkDir;

use crate::core::cancel::CancelFlag;
use crate::core::entry::{Entry, EntryId, EntryTree};
use crate::core::native;
use crate::error::{IoContext, KarError, Result};

/// Walk `source` into a fresh tree. Parent links are not stamped.
///
/// Symbolic links are recorded, never followed. Sockets, fifos and device
/// nodes are skipped with a warning.
pub fn scan_directory(source: &Path, cancel: &CancelFlag) -> Result<EntryTree> {
    let meta = fs::metadata(source).io_context("Failed to stat source directory", source)?;
    if !meta.is_dir() {
        return Err(KarError::io(
            format!("Failed to scan '{}'", source.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let mut tree = EntryTree::new();
    // Directory ids by depth; the entry at depth d belongs to dirs[d - 2].
    let mut dirs: Vec<EntryId> = Vec::new();

    for item in WalkDir::new(source).min_depth(1).follow_links(false).sort_by_file_name() {
        cancel.check()?;

        let item = item.map_err(|e| {
            let context = match e.path() {
                Some(p) => format!("Failed to scan '{}'", p.display()),
                None => format!("Failed to scan '{}'", source.display()),
            };
            KarError::io(context, io::Error::from(e))
        })?;

        dirs.truncate(item.depth() - 1);
        let parent = dirs.last().copied().unwrap_or_else(|| tree.root());

        let path = item.path();
        let meta = item.metadata().map_err(|e| KarError::io(format!("Failed to stat '{}'", path.display()), io::Error::from(e)))?;
        let name = native::name_bytes(item.file_name());
        let mod_time = native::mod_time(&meta);
        let access_mode = native::access_mode(&meta);

        let file_type = item.file_type();
        let entry = if file_type.is_dir() {
            Entry::directory(name, mod_time, access_mode)
        } else if file_type.is_file() {
            Entry::file(name, mod_time, access_mode, meta.len())
        } else if file_type.is_symlink() {
            let link = fs::read_link(path).io_context("Failed to read link", path)?;
            Entry::alias(name, mod_time, access_mode, native::name_bytes(link.as_os_str()))
        } else {
            warn!("skipping unsupported filesystem object '{}'", path.display());
            continue;
        };

        debug!("scanned '{}'", path.display());
        let is_dir = entry.is_dir();
        let id = tree.insert(parent, entry)?;
        if is_dir {
            dirs.push(id);
        }
    }

    Ok(tree)
}

/// Create an extraction directory. Owner-only until attributes are applied.
pub fn make_dir(path: &Path, force: bool) -> Result<()> {
    match native::private_dir().create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && force => {
            let meta = fs::symlink_metadata(path).io_context("Failed to stat", path)?;
            if meta.is_dir() {
                Ok(())
            } else {
                Err(KarError::AlreadyExists(path.to_path_buf()))
            }
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(KarError::AlreadyExists(path.to_path_buf())),
        Err(e) => Err(KarError::io(format!("Failed to create directory '{}'", path.display()), e)),
    }
}

/// Create a symbolic link at `path` whose text is `link`.
pub fn make_symlink(link: &[u8], path: &Path, force: bool) -> Result<()> {
    if force {
        remove_existing(path)?;
    }
    native::symlink(link, path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            KarError::AlreadyExists(path.to_path_buf())
        } else {
            KarError::io(format!("Failed to create link '{}'", path.display()), e)
        }
    })
}

/// Create an extraction target file, write-only until attributes are applied.
pub fn create_file(path: &Path, force: bool) -> Result<File> {
    if force {
        remove_existing(path)?;
    }
    native::private_file().open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            KarError::AlreadyExists(path.to_path_buf())
        } else {
            KarError::io(format!("Failed to create file '{}'", path.display()), e)
        }
    })
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(KarError::AlreadyExists(path.to_path_buf())),
        Ok(_) => fs::remove_file(path).io_context("Failed to remove", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KarError::io(format!("Failed to stat '{}'", path.display()), e)),
    }
}

/// Restore permission bits and modification time of an extracted object.
///
/// Links get their own timestamp (the target is not touched) and keep the
/// permission bits the platform gives them.
pub fn apply_attributes(path: &Path, access_mode: u32, mod_time: i64, is_alias: bool) -> Result<()> {
    let mtime = FileTime::from_unix_time(mod_time, 0);
    if is_alias {
        return filetime::set_symlink_file_times(path, mtime, mtime).io_context("Failed to set time of link", path);
    }
    filetime::set_file_mtime(path, mtime).io_context("Failed to set modification time of", path)?;
    native::set_access_mode(path, access_mode).io_context("Failed to set access mode of", path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::MetadataExt;

    #[cfg(unix)]
    #[test]
    fn scan_records_kinds_sizes_and_links() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("sub"))?;
        fs::write(dir.path().join("sub/data.bin"), vec![7u8; 42])?;
        fs::write(dir.path().join("empty"), b"")?;
        std::os::unix::fs::symlink("sub/data.bin", dir.path().join("link"))?;

        let tree = scan_directory(dir.path(), &CancelFlag::new())?;
        let data = tree.lookup("sub/data.bin").expect("file scanned");
        assert_eq!(tree.get(data).byte_size(), Some(42));
        assert_eq!(tree.get(tree.lookup("empty").expect("empty scanned")).byte_size(), Some(0));
        let link = tree.lookup("link").expect("link scanned");
        assert_eq!(tree.get(link).link(), Some(&b"sub/data.bin"[..]));
        assert!(tree.get(tree.lookup("sub").expect("dir scanned")).is_dir());
        Ok(())
    }

    #[test]
    fn scan_honours_cancel() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a"), b"x")?;
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(scan_directory(dir.path(), &cancel), Err(KarError::Cancelled)));
        Ok(())
    }

    #[test]
    fn scan_rejects_plain_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let file = dir.path().join("f");
        fs::write(&file, b"x")?;
        assert!(matches!(scan_directory(&file, &CancelFlag::new()), Err(KarError::Io { .. })));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn create_file_respects_force() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out");
        fs::write(&path, b"old")?;

        assert!(matches!(create_file(&path, false), Err(KarError::AlreadyExists(_))));

        let mut f = create_file(&path, true)?;
        f.write_all(b"new")?;
        drop(f);
        apply_attributes(&path, 0o640, 1_000_000, false)?;

        let meta = fs::metadata(&path)?;
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_000_000);
        assert_eq!(fs::read(&path)?, b"new");
        Ok(())
    }

    #[test]
    fn make_dir_merges_only_with_force() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("d");
        make_dir(&path, false)?;
        assert!(matches!(make_dir(&path, false), Err(KarError::AlreadyExists(_))));
        make_dir(&path, true)?;
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_time_is_set_without_following() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("l");
        make_symlink(b"does-not-exist", &path, false)?;
        apply_attributes(&path, 0o777, 12345, true)?;
        assert_eq!(fs::symlink_metadata(&path)?.mtime(), 12345);
        assert_eq!(fs::read_link(&path)?, Path::new("does-not-exist"));
        Ok(())
    }
}
