//! MD5 sidecar writer.
//!
//! `Md5Writer` forwards every byte to the wrapped writer while feeding an
//! MD5 digest; `finish` emits `<archive>.md5` in md5sum format.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use ::md5::{Digest, Md5};
use log::info;

use crate::error::{IoContext, Result};

pub struct Md5Writer<W: Write> {
    inner: W,
    hasher: Md5,
}

impl<W: Write> Md5Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
        }
    }

    /// Flush the wrapped writer, write the sidecar next to `archive` and
    /// hand back the inner writer with the digest.
    pub fn finish(mut self, archive: &Path) -> Result<(W, String)> {
        self.inner.flush().io_context("Failed to flush", archive)?;
        let digest = hex::encode(self.hasher.finalize());

        let sidecar = sidecar_path(archive);
        let name = archive.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        fs::write(&sidecar, format!("{} *{}\n", digest, name)).io_context("Failed to write", &sidecar)?;
        info!("wrote md5 sidecar '{}'", sidecar.display());

        Ok((self.inner, digest))
    }
}

impl<W: Write> Write for Md5Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `<archive>.md5`
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(".md5");
    PathBuf::from(name)
}
