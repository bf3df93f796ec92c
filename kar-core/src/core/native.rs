//! Host filesystem conversions.
//!
//! Entry names, link texts and access modes are stored as POSIX byte strings
//! and permission bits. On unix these map one to one; elsewhere names go
//! through UTF-8 and only the owner-write bit survives as the read-only flag.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, Metadata, OpenOptions};
use std::io;
use std::path::Path;

use filetime::FileTime;

/// Bytes of a single path component as stored in the TOC.
pub fn name_bytes(name: &OsStr) -> Vec<u8> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        name.as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        name.to_string_lossy().into_owned().into_bytes()
    }
}

/// Host form of stored name or link bytes.
pub fn os_str(bytes: &[u8]) -> Cow<'_, OsStr> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Cow::Borrowed(OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        match String::from_utf8_lossy(bytes) {
            Cow::Borrowed(s) => Cow::Borrowed(OsStr::new(s)),
            Cow::Owned(s) => Cow::Owned(s.into()),
        }
    }
}

/// Permission bits of `meta`.
pub fn access_mode(meta: &Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let base = if meta.is_dir() { 0o755 } else { 0o644 };
        if meta.permissions().readonly() {
            base & !0o222
        } else {
            base
        }
    }
}

/// Modification time of `meta` in whole seconds since the Unix epoch.
pub fn mod_time(meta: &Metadata) -> i64 {
    FileTime::from_last_modification_time(meta).unix_seconds()
}

pub fn set_access_mode(path: &Path, access_mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(access_mode))
    }
    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(access_mode & 0o200 == 0);
        fs::set_permissions(path, perms)
    }
}

/// Builder for extraction directories, owner-only where modes exist.
pub fn private_dir() -> DirBuilder {
    #[allow(unused_mut)]
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
}

/// Options for a new extraction target, write-only where modes exist.
pub fn private_file() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o200);
    }
    options
}

pub fn symlink(link: &[u8], path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(os_str(link), path)
    }
    #[cfg(windows)]
    {
        std::os::windows::fs::symlink_file(os_str(link).as_ref(), path)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (link, path);
        Err(io::Error::new(io::ErrorKind::Unsupported, "symbolic links are not supported"))
    }
}
