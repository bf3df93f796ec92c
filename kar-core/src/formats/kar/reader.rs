use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::core::alias::resolve_all;
use crate::core::cancel::CancelFlag;
use crate::core::entry::{EntryId, EntryKind, EntryTree};
use crate::core::progress::{report, ProgressFn};
use crate::core::scan::{apply_attributes, create_file, make_dir, make_symlink};
use crate::error::{IoContext, KarError, Result};
use crate::formats::kar::constants::{COPY_CHUNK, HEADER_SIZE};
use crate::formats::kar::header::SraHeader;
use crate::formats::kar::listing;
use crate::formats::kar::toc::TocDecoder;

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Type, permissions, size, offset and time before each path.
    pub long: bool,
}

#[derive(Clone, Default)]
pub struct ExtractOptions {
    /// Merge into an existing destination, replacing files and links.
    pub force: bool,
    pub cancel: CancelFlag,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub aliases: usize,
    /// Payload bytes copied out of the archive.
    pub bytes: u64,
}

/// An opened, verified archive with its TOC inflated into memory.
pub struct KarReader<R: Read + Seek> {
    reader: R,
    header: SraHeader,
    tree: EntryTree,
}

impl KarReader<BufReader<File>> {
    pub fn open(path: &Path, cancel: &CancelFlag) -> Result<Self> {
        let file = File::open(path).io_context("Failed to open archive", path)?;
        Self::new(BufReader::new(file), cancel)
    }
}

impl<R: Read + Seek> KarReader<R> {
    /// Verify the header, decode the TOC, stamp parents and resolve aliases.
    pub fn new(mut reader: R, cancel: &CancelFlag) -> Result<Self> {
        reader.seek(SeekFrom::Start(0)).io_msg("Failed to seek archive")?;
        let header = SraHeader::read(&mut reader)?;
        let toc_size = header.toc_size();
        info!("header verified, toc is {} bytes, data starts at {}", toc_size, header.file_offset);

        let mut toc = Vec::new();
        reader.by_ref().take(toc_size).read_to_end(&mut toc).io_msg("Failed to read toc")?;
        if (toc.len() as u64) < toc_size {
            return Err(KarError::TocTruncated {
                offset: HEADER_SIZE + toc.len(),
                needed: (toc_size - toc.len() as u64) as usize,
                available: 0,
            });
        }

        let mut tree = TocDecoder::new(header.byte_order).with_cancel(cancel).decode(&toc)?;
        tree.link_parents();
        let unresolved = resolve_all(&mut tree);
        let counts = tree.counts();
        info!(
            "toc holds {} files, {} directories, {} links ({} unresolved)",
            counts.files, counts.directories, counts.aliases, unresolved
        );

        Ok(Self { reader, header, tree })
    }

    pub fn header(&self) -> &SraHeader {
        &self.header
    }

    pub fn tree(&self) -> &EntryTree {
        &self.tree
    }

    pub fn data_start(&self) -> u64 {
        self.header.file_offset
    }

    pub fn list(&self, options: &ListOptions) -> String {
        listing::render(&self.tree, options.long)
    }

    /// Unpack every entry below `dest`.
    ///
    /// 1. directories and links are created, files collected
    /// 2. payloads are copied in ascending archive offset
    /// 3. permissions and times are restored, children before parents
    pub fn extract_to(&mut self, dest: &Path, options: &ExtractOptions) -> Result<ExtractSummary> {
        let cancel = &options.cancel;
        let mut summary = ExtractSummary::default();

        // Pass 1: structure
        let mut pending: Vec<(EntryId, PathBuf)> = Vec::new();
        let tree = &self.tree;
        tree.walk(|id| -> Result<()> {
            cancel.check()?;
            let path = tree.full_path(id, Some(dest));
            let entry = tree.get(id);
            match &entry.kind {
                EntryKind::Directory { .. } => {
                    make_dir(&path, options.force)?;
                    summary.directories += 1;
                }
                EntryKind::Alias { link, .. } => {
                    make_symlink(link, &path, options.force)?;
                    summary.aliases += 1;
                }
                EntryKind::File { .. } => pending.push((id, path)),
            }
            debug!("pass 1: '{}'", tree.display_path(id));
            Ok(())
        })?;

        // Pass 2: payloads
        pending.sort_by_key(|(id, _)| self.tree.get(*id).byte_offset().unwrap_or(0));
        let total = pending.len();
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut position: Option<u64> = None;
        for (i, (id, path)) in pending.iter().enumerate() {
            cancel.check()?;
            let name = self.tree.display_path(*id);
            report(options.progress.as_ref(), i + 1, total, &name);

            let (byte_size, byte_offset) = match self.tree.get(*id).kind {
                EntryKind::File { byte_size, byte_offset } => (byte_size, byte_offset),
                _ => continue,
            };
            let mut out = create_file(path, options.force)?;
            if byte_size > 0 {
                let start = self.header.file_offset + byte_offset;
                if position != Some(start) {
                    self.reader.seek(SeekFrom::Start(start)).io_msg("Failed to seek archive")?;
                }
                copy_payload(&mut self.reader, &mut out, byte_size, &name, path, &mut buf)?;
                position = Some(start + byte_size);
            }
            summary.files += 1;
            summary.bytes += byte_size;
            debug!("pass 2: '{}' ({} bytes from offset {})", name, byte_size, byte_offset);
        }

        // Pass 3: attributes
        restore_attributes(&self.tree, dest, cancel)?;

        info!(
            "extracted {} files ({} bytes), {} directories, {} links into '{}'",
            summary.files,
            summary.bytes,
            summary.directories,
            summary.aliases,
            dest.display()
        );
        Ok(summary)
    }
}

fn copy_payload<R: Read, W: Write>(
    reader: &mut R,
    out: &mut W,
    byte_size: u64,
    name: &str,
    path: &Path,
    buf: &mut [u8],
) -> Result<()> {
    let mut copied = 0u64;
    while copied < byte_size {
        let want = (byte_size - copied).min(buf.len() as u64) as usize;
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(KarError::PayloadTruncated {
                    name: name.to_string(),
                    expected: byte_size,
                    got: copied,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(KarError::io("Failed to read archive", e)),
        };
        out.write_all(&buf[..n]).io_context("Failed to write", path)?;
        copied += n as u64;
    }
    Ok(())
}

/// Reverse pre-order: every directory comes after everything below it.
fn restore_attributes(tree: &EntryTree, dest: &Path, cancel: &CancelFlag) -> Result<()> {
    let mut order = Vec::new();
    let _ = tree.walk::<(), _>(|id| {
        order.push(id);
        Ok(())
    });

    for id in order.into_iter().rev() {
        cancel.check()?;
        let entry = tree.get(id);
        let path = tree.full_path(id, Some(dest));
        apply_attributes(&path, entry.header.access_mode, entry.header.mod_time, entry.is_alias())?;
    }
    Ok(())
}

/// Read and verify just the fixed header of `archive`.
pub fn open_and_verify(archive: &Path) -> Result<SraHeader> {
    let mut file = File::open(archive).io_context("Failed to open archive", archive)?;
    SraHeader::read(&mut file)
}

/// Render the archive's table of contents.
pub fn list(archive: &Path, options: &ListOptions) -> Result<String> {
    Ok(KarReader::open(archive, &CancelFlag::new())?.list(options))
}

/// Unpack `archive` into `dest`. Without `force` the destination must not
/// exist yet.
pub fn extract(archive: &Path, dest: &Path, options: &ExtractOptions) -> Result<ExtractSummary> {
    let mut reader = KarReader::open(archive, &options.cancel)?;

    if fs::symlink_metadata(dest).is_ok() && !options.force {
        return Err(KarError::AlreadyExists(dest.to_path_buf()));
    }
    fs::create_dir_all(dest).io_context("Failed to create directory", dest)?;

    reader.extract_to(dest, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entry::Entry;
    use crate::core::native;
    use crate::formats::kar::writer::{assign_offsets, KarWriter};
    use std::io::Cursor;
    use tempfile::TempDir;

    /// Archive with files sized [500, 10, 300] named a, b, c.
    fn archive_bytes() -> anyhow::Result<Vec<u8>> {
        let mut tree = EntryTree::new();
        let root = tree.root();
        for (name, size) in [("a", 500u64), ("b", 10), ("c", 300)] {
            tree.insert(root, Entry::file(name, 1_000, 0o644, size))?;
        }
        tree.link_parents();
        let payload = assign_offsets(&mut tree);

        let mut writer = KarWriter::new(Vec::new());
        writer.write_toc(&tree, &CancelFlag::new())?;
        for id in payload {
            let entry = tree.get(id);
            let size = entry.byte_size().unwrap_or(0);
            let fill = entry.name()[0];
            let data = vec![fill; size as usize];
            writer.add_file(entry.byte_offset().unwrap_or(0), size, &mut Cursor::new(data), Path::new("mem"))?;
        }
        Ok(writer.finish()?)
    }

    /// Records every seek so the access pattern can be checked.
    struct Tracking<R> {
        inner: R,
        seeks: Vec<u64>,
    }

    impl<R: Read> Read for Tracking<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl<R: Seek> Seek for Tracking<R> {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            let at = self.inner.seek(pos)?;
            self.seeks.push(at);
            Ok(at)
        }
    }

    #[test]
    fn extraction_reads_in_offset_order() -> anyhow::Result<()> {
        let bytes = archive_bytes()?;
        let tracking = Tracking {
            inner: Cursor::new(bytes),
            seeks: Vec::new(),
        };
        let mut reader = KarReader::new(tracking, &CancelFlag::new())?;
        let start = reader.data_start();
        let tree = reader.tree();
        assert_eq!(tree.get(tree.lookup("b").unwrap()).byte_offset(), Some(0));
        assert_eq!(tree.get(tree.lookup("c").unwrap()).byte_offset(), Some(12));
        assert_eq!(tree.get(tree.lookup("a").unwrap()).byte_offset(), Some(312));

        let dir = TempDir::new()?;
        let summary = reader.extract_to(dir.path(), &ExtractOptions::default())?;
        assert_eq!(summary.files, 3);
        assert_eq!(summary.bytes, 810);

        // header, then b; c follows b's padding so needs one more; a is contiguous with c
        let seeks = &reader.reader.seeks;
        assert_eq!(seeks, &vec![0, start, start + 12]);

        assert_eq!(fs::read(dir.path().join("a"))?, vec![b'a'; 500]);
        assert_eq!(fs::read(dir.path().join("b"))?, vec![b'b'; 10]);
        assert_eq!(fs::read(dir.path().join("c"))?, vec![b'c'; 300]);
        Ok(())
    }

    #[test]
    fn truncated_payload_is_fatal() -> anyhow::Result<()> {
        let mut bytes = archive_bytes()?;
        bytes.truncate(bytes.len() - 100);
        let mut reader = KarReader::new(Cursor::new(bytes), &CancelFlag::new())?;
        let dir = TempDir::new()?;
        let err = reader.extract_to(dir.path(), &ExtractOptions::default()).unwrap_err();
        assert!(matches!(err, KarError::PayloadTruncated { ref name, expected: 500, got: 400 } if name == "a"));
        Ok(())
    }

    #[test]
    fn truncated_toc_is_fatal() -> anyhow::Result<()> {
        let bytes = archive_bytes()?;
        let err = KarReader::new(Cursor::new(bytes[..HEADER_SIZE + 3].to_vec()), &CancelFlag::new()).err();
        assert!(matches!(err, Some(KarError::TocTruncated { .. })));
        Ok(())
    }

    #[test]
    fn cancelled_extraction_stops() -> anyhow::Result<()> {
        let bytes = archive_bytes()?;
        let mut reader = KarReader::new(Cursor::new(bytes), &CancelFlag::new())?;
        let options = ExtractOptions::default();
        options.cancel.cancel();
        let dir = TempDir::new()?;
        assert!(matches!(reader.extract_to(dir.path(), &options), Err(KarError::Cancelled)));
        Ok(())
    }

    #[test]
    fn attributes_restored_through_deep_nesting() -> anyhow::Result<()> {
        let mut tree = EntryTree::new();
        let mut dir = tree.root();
        for level in 0..50 {
            dir = tree.insert(dir, Entry::directory("d", 10_000 + level, 0o750))?;
        }
        tree.insert(dir, Entry::file("e", 5, 0o600, 0))?;
        tree.link_parents();
        assign_offsets(&mut tree);

        let mut writer = KarWriter::new(Vec::new());
        writer.write_toc(&tree, &CancelFlag::new())?;
        let bytes = writer.finish()?;

        let out = TempDir::new()?;
        let mut reader = KarReader::new(Cursor::new(bytes), &CancelFlag::new())?;
        let summary = reader.extract_to(out.path(), &ExtractOptions::default())?;
        assert_eq!(summary.directories, 50);
        assert_eq!(summary.files, 1);

        let outer = fs::metadata(out.path().join("d"))?;
        let innermost = (0..50).fold(out.path().to_path_buf(), |p, _| p.join("d"));
        assert_eq!(native::mod_time(&outer), 10_000);
        assert_eq!(native::mod_time(&fs::metadata(&innermost)?), 10_049);
        assert_eq!(native::mod_time(&fs::metadata(innermost.join("e"))?), 5);
        #[cfg(unix)]
        assert_eq!(native::access_mode(&outer), 0o750);
        Ok(())
    }
}
