use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::core::cancel::CancelFlag;
use crate::core::entry::{EntryId, EntryKind, EntryTree};
use crate::core::md5::Md5Writer;
use crate::core::progress::{report, ProgressFn};
use crate::core::scan::scan_directory;
use crate::error::{IoContext, KarError, Result};
use crate::formats::kar::constants::{align, COPY_CHUNK, HEADER_SIZE};
use crate::formats::kar::header::SraHeader;
use crate::formats::kar::toc::TocEncoder;

#[derive(Clone, Default)]
pub struct CreateOptions {
    /// Overwrite an existing archive.
    pub force: bool,
    /// Write `<archive>.md5` alongside the archive.
    pub md5: bool,
    /// Archive-relative paths to keep; empty keeps everything.
    pub keep: Vec<String>,
    /// Archive-relative paths to leave out.
    pub drop: Vec<String>,
    pub cancel: CancelFlag,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateSummary {
    pub files: usize,
    pub directories: usize,
    pub aliases: usize,
    pub toc_size: u64,
    /// Absolute offset of the data section.
    pub data_start: u64,
    pub archive_size: u64,
}

/// Lay out payloads ascending by size (ties keep tree order), each at a
/// 4-byte aligned offset from the start of the data section.
///
/// Returns the non-empty files in the order they must be written. Empty
/// files get offset 0 and carry no payload.
pub fn assign_offsets(tree: &mut EntryTree) -> Vec<EntryId> {
    let mut files = tree.files();
    files.sort_by_key(|id| tree.get(*id).byte_size().unwrap_or(0));

    let mut offset = 0u64;
    let mut payload = Vec::with_capacity(files.len());
    for id in files {
        if let EntryKind::File { byte_size, byte_offset } = &mut tree.get_mut(id).kind {
            if *byte_size == 0 {
                *byte_offset = 0;
                continue;
            }
            *byte_offset = offset;
            offset = align(offset + *byte_size);
            payload.push(id);
        }
    }
    payload
}

/// Sequential archive emitter: header and TOC first, then payloads in
/// offset order. Never seeks, so any `Write` will do.
pub struct KarWriter<W: Write> {
    writer: W,
    position: u64,
    data_start: u64,
    buf: Vec<u8>,
}

impl<W: Write> KarWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            position: 0,
            data_start: 0,
            buf: Vec::new(),
        }
    }

    /// Bytes emitted so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Write header, TOC and the zero padding up to the data section.
    /// Returns the TOC size.
    pub fn write_toc(&mut self, tree: &EntryTree, cancel: &CancelFlag) -> Result<u64> {
        let encoder = TocEncoder::new(tree).with_cancel(cancel);

        // 1. Measure
        let toc_size = encoder.toc_size()?;
        self.data_start = align(HEADER_SIZE as u64 + toc_size);

        // 2. Header
        let header = SraHeader::new(self.data_start);
        self.put(&header.to_bytes())?;

        // 3. TOC
        let written = encoder.write_toc(&mut self.writer)?;
        self.position += written;
        if written != toc_size {
            return Err(KarError::TocSizeMismatch {
                expected: toc_size,
                actual: written,
            });
        }

        // 4. Align
        self.pad_to(self.data_start)?;
        debug!("toc is {} bytes, data section starts at {}", toc_size, self.data_start);
        Ok(toc_size)
    }

    /// Copy exactly `byte_size` bytes from `reader` to `data_start + byte_offset`.
    pub fn add_file<R: Read>(&mut self, byte_offset: u64, byte_size: u64, reader: &mut R, source: &Path) -> Result<()> {
        self.pad_to(self.data_start + byte_offset)?;

        if self.buf.len() < COPY_CHUNK {
            self.buf.resize(COPY_CHUNK, 0);
        }
        let mut copied = 0u64;
        while copied < byte_size {
            let want = (byte_size - copied).min(COPY_CHUNK as u64) as usize;
            let n = match reader.read(&mut self.buf[..want]) {
                Ok(0) => {
                    return Err(KarError::SourceChanged {
                        path: source.to_path_buf(),
                        expected: byte_size,
                        got: copied,
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(KarError::io(format!("Failed to read '{}'", source.display()), e)),
            };
            self.writer.write_all(&self.buf[..n]).io_msg("Failed to write archive")?;
            self.position += n as u64;
            copied += n as u64;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush().io_msg("Failed to flush archive")?;
        Ok(self.writer)
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).io_msg("Failed to write archive")?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn pad_to(&mut self, target: u64) -> Result<()> {
        if self.position > target {
            return Err(KarError::io(
                "Failed to write archive",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("payload offset {} lies behind write position {}", target, self.position),
                ),
            ));
        }
        const ZEROS: [u8; 4096] = [0; 4096];
        while self.position < target {
            let n = (target - self.position).min(ZEROS.len() as u64) as usize;
            self.put(&ZEROS[..n])?;
        }
        Ok(())
    }
}

/// Emit a complete archive for an already laid-out tree. `payload` comes
/// from `assign_offsets`; member bytes are read from below `source`.
pub fn write_archive<W: Write>(
    writer: &mut KarWriter<W>,
    tree: &EntryTree,
    payload: &[EntryId],
    source: &Path,
    cancel: &CancelFlag,
    progress: Option<&ProgressFn>,
) -> Result<u64> {
    let toc_size = writer.write_toc(tree, cancel)?;

    let total = payload.len();
    for (i, &id) in payload.iter().enumerate() {
        cancel.check()?;
        let entry = tree.get(id);
        let (byte_size, byte_offset) = match entry.kind {
            EntryKind::File { byte_size, byte_offset } => (byte_size, byte_offset),
            _ => continue,
        };

        let name = tree.display_path(id);
        report(progress, i + 1, total, &name);

        let path = tree.full_path(id, Some(source));
        let mut file = File::open(&path).io_context("Failed to open", &path)?;
        writer.add_file(byte_offset, byte_size, &mut file, &path)?;
        debug!("stored '{}' ({} bytes at offset {})", name, byte_size, byte_offset);
    }
    Ok(toc_size)
}

/// Pack `source` into a new archive at `archive`.
pub fn create(source: &Path, archive: &Path, options: &CreateOptions) -> Result<CreateSummary> {
    if !options.force && fs::symlink_metadata(archive).is_ok() {
        return Err(KarError::AlreadyExists(archive.to_path_buf()));
    }

    let mut tree = scan_directory(source, &options.cancel)?;
    tree.link_parents();

    for path in tree.retain_paths(&options.keep) {
        warn!("'{}' not found in '{}', ignoring", path, source.display());
    }
    for path in tree.drop_paths(&options.drop) {
        warn!("'{}' not found in '{}', nothing to drop", path, source.display());
    }
    if let Some(inside) = archive_inside_source(source, archive) {
        debug!("leaving the archive itself ('{}') out", inside);
        tree.drop_paths(&[inside]);
    }

    let payload = assign_offsets(&mut tree);
    let counts = tree.counts();
    info!(
        "archiving {} files, {} directories, {} links from '{}'",
        counts.files,
        counts.directories,
        counts.aliases,
        source.display()
    );

    let file = open_archive(archive, options.force)?;
    let progress = options.progress.as_ref();

    let (toc_size, data_start, archive_size) = if options.md5 {
        let mut writer = KarWriter::new(Md5Writer::new(BufWriter::new(file)));
        let toc_size = write_archive(&mut writer, &tree, &payload, source, &options.cancel, progress)?;
        let (data_start, size) = (writer.data_start(), writer.position());
        let (buffered, digest) = writer.finish()?.finish(archive)?;
        close(buffered, archive)?;
        info!("archive md5 {}", digest);
        (toc_size, data_start, size)
    } else {
        let mut writer = KarWriter::new(BufWriter::new(file));
        let toc_size = write_archive(&mut writer, &tree, &payload, source, &options.cancel, progress)?;
        let (data_start, size) = (writer.data_start(), writer.position());
        close(writer.finish()?, archive)?;
        (toc_size, data_start, size)
    };

    info!("wrote '{}': {} bytes, toc {} bytes", archive.display(), archive_size, toc_size);
    Ok(CreateSummary {
        files: counts.files,
        directories: counts.directories,
        aliases: counts.aliases,
        toc_size,
        data_start,
        archive_size,
    })
}

/// Open the archive for writing, creating missing parent directories.
fn open_archive(archive: &Path, force: bool) -> Result<File> {
    if let Some(parent) = archive.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).io_context("Failed to create directory", parent)?;
    }
    let mut opts = OpenOptions::new();
    opts.write(true);
    if force {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    opts.open(archive).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            KarError::AlreadyExists(archive.to_path_buf())
        } else {
            KarError::io(format!("Failed to create archive '{}'", archive.display()), e)
        }
    })
}

fn close(writer: BufWriter<File>, archive: &Path) -> Result<()> {
    let file = writer.into_inner().map_err(|e| KarError::io(format!("Failed to write '{}'", archive.display()), e.into_error()))?;
    file.sync_all().io_context("Failed to sync", archive)
}

/// Archive-relative path of `archive` when it would be picked up by the
/// scan of `source`.
fn archive_inside_source(source: &Path, archive: &Path) -> Option<String> {
    let source = fs::canonicalize(source).ok()?;
    let parent = match archive.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let archive = fs::canonicalize(parent).ok()?.join(archive.file_name()?);
    let rel = archive.strip_prefix(&source).ok()?;
    Some(rel.to_string_lossy().into_owned())
}
