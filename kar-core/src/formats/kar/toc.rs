//! Table of contents codec.
//!
//! A directory's children are stored as a persisted search-tree container:
//!
//! ```text
//! num_nodes   u32          container ends here when 0
//! data_size   u32          bytes of all child records
//! index       num_nodes x  u8/u16/u32 (by data_size) record offsets
//! data        data_size    child records in name order
//! ```
//!
//! and every record is
//!
//! ```text
//! name_len u16, name, mod_time i64, access_mode u32, type u8, trailer
//! ```
//!
//! with the trailer depending on the type code: `offset u64, size u64` for
//! files, nothing for empty files, `link_len u16, link` for soft links and a
//! nested container for directories. The top-level TOC is the root's
//! container.
//!
//! Records are measured by running the writer against a counting `Sink`,
//! so sizes and output can never disagree. Every subtree is sized once,
//! bottom-up, before anything is written.

use std::io::Write;

use log::{debug, warn};

use crate::core::cancel::CancelFlag;
use crate::core::entry::{Entry, EntryHeader, EntryId, EntryKind, EntryTree, Resolution};
use crate::error::{IoContext, KarError, Result};
use crate::formats::kar::constants::{TypeCode, MAX_NAME_LEN};
use crate::formats::kar::header::ByteOrder;

/// Destination of encoded bytes.
pub trait Sink {
    fn put(&mut self, bytes: &[u8]) -> Result<()>;
    /// Bytes accepted so far.
    fn written(&self) -> u64;
}

/// Counts bytes without storing them.
#[derive(Debug, Default)]
pub struct Counter(u64);

impl Sink for Counter {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.0 += bytes.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.0
    }
}

/// Forwards bytes to a `Write`.
pub struct WriteSink<'a, W: Write> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W: Write> WriteSink<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Sink for WriteSink<'_, W> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).io_msg("Failed to write toc")?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }
}

/// Index element width for a container holding `data_size` bytes.
fn index_width(data_size: u64) -> usize {
    if data_size <= 256 {
        1
    } else if data_size <= 65536 {
        2
    } else {
        4
    }
}

/// Encoded lengths indexed by `EntryId::index`: the whole record of every
/// sized entry and, for directories, their child container alone.
struct Layout {
    record: Vec<u64>,
    container: Vec<u64>,
}

/// Pending encoder work. A directory record is followed by its container.
enum Emit {
    Record(EntryId),
    Container(EntryId),
}

pub struct TocEncoder<'a> {
    tree: &'a EntryTree,
    cancel: Option<&'a CancelFlag>,
}

impl<'a> TocEncoder<'a> {
    pub fn new(tree: &'a EntryTree) -> Self {
        Self { tree, cancel: None }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Encoded length of one entry (and its subtree) without producing bytes.
    pub fn sizing_pass(&self, id: EntryId) -> Result<u64> {
        Ok(self.layout(id)?.record[id.index()])
    }

    /// Encoded length of the whole TOC.
    pub fn toc_size(&self) -> Result<u64> {
        let root = self.tree.root();
        Ok(self.layout(root)?.container[root.index()])
    }

    /// Wire form of one entry.
    pub fn encode(&self, id: EntryId) -> Result<Vec<u8>> {
        let layout = self.layout(id)?;
        let mut buf = Vec::new();
        self.emit(Emit::Record(id), &layout, &mut WriteSink::new(&mut buf))?;
        Ok(buf)
    }

    /// Write the whole TOC, returning the number of bytes written.
    pub fn write_toc<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let root = self.tree.root();
        let layout = self.layout(root)?;
        let mut sink = WriteSink::new(writer);
        self.emit(Emit::Container(root), &layout, &mut sink)?;
        Ok(sink.written())
    }

    fn check_cancel(&self) -> Result<()> {
        match self.cancel {
            Some(cancel) => cancel.check(),
            None => Ok(()),
        }
    }

    /// Size `top` and everything below it, children before their directory.
    fn layout(&self, top: EntryId) -> Result<Layout> {
        let slots = self.tree.arena_len();
        let mut layout = Layout {
            record: vec![0; slots],
            container: vec![0; slots],
        };

        let mut order = Vec::new();
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend_from_slice(self.tree.children(id));
        }

        for &id in order.iter().rev() {
            self.check_cancel()?;
            if self.tree.get(id).is_dir() {
                layout.container[id.index()] = self.container_size(id, &layout.record)?;
            }
            if id != self.tree.root() {
                layout.record[id.index()] = self.record_size(id, layout.container[id.index()])?;
            }
        }
        Ok(layout)
    }

    fn record_size(&self, id: EntryId, container: u64) -> Result<u64> {
        let entry = self.tree.get(id);
        if entry.name().len() > MAX_NAME_LEN {
            return Err(KarError::NameTooLong {
                name: self.tree.display_path(id),
                len: entry.name().len(),
            });
        }
        if let Some(link) = entry.link().filter(|l| l.len() > MAX_NAME_LEN) {
            return Err(KarError::LinkTooLong {
                name: self.tree.display_path(id),
                len: link.len(),
            });
        }

        let mut counter = Counter::default();
        let nested = if self.record(id, &mut counter)? { container } else { 0 };
        Ok(counter.written() + nested)
    }

    fn container_size(&self, dir: EntryId, record: &[u64]) -> Result<u64> {
        let children = self.tree.children(dir);
        if children.is_empty() {
            return Ok(4);
        }
        let data_size = self.data_size(dir, record)?;
        Ok(4 + 4 + (children.len() * index_width(data_size)) as u64 + data_size)
    }

    fn data_size(&self, dir: EntryId, record: &[u64]) -> Result<u64> {
        let data_size: u64 = self.tree.children(dir).iter().map(|c| record[c.index()]).sum();
        if data_size > u32::MAX as u64 {
            return Err(KarError::DirectoryTooLarge {
                name: self.tree.display_path(dir),
                size: data_size,
            });
        }
        Ok(data_size)
    }

    /// Write `start` from an already computed layout, depth first.
    fn emit<S: Sink>(&self, start: Emit, layout: &Layout, sink: &mut S) -> Result<()> {
        let mut work = vec![start];
        while let Some(item) = work.pop() {
            match item {
                Emit::Record(id) => {
                    self.check_cancel()?;
                    if self.record(id, sink)? {
                        work.push(Emit::Container(id));
                    }
                }
                Emit::Container(dir) => {
                    let children = self.tree.children(dir);
                    sink.put(&(children.len() as u32).to_le_bytes())?;
                    if children.is_empty() {
                        continue;
                    }

                    let data_size = self.data_size(dir, &layout.record)?;
                    sink.put(&(data_size as u32).to_le_bytes())?;

                    let width = index_width(data_size);
                    let mut offset = 0u64;
                    for child in children {
                        match width {
                            1 => sink.put(&[offset as u8])?,
                            2 => sink.put(&(offset as u16).to_le_bytes())?,
                            _ => sink.put(&(offset as u32).to_le_bytes())?,
                        }
                        offset += layout.record[child.index()];
                    }

                    work.extend(children.iter().rev().map(|&c| Emit::Record(c)));
                }
            }
        }
        Ok(())
    }

    /// Record of `id` up to its trailer. Returns true when a directory
    /// container has to follow. Lengths were checked by `layout`.
    fn record<S: Sink>(&self, id: EntryId, sink: &mut S) -> Result<bool> {
        let entry = self.tree.get(id);
        let name = entry.name();

        // 1. Name
        sink.put(&(name.len() as u16).to_le_bytes())?;
        sink.put(name)?;

        // 2. Attributes
        sink.put(&entry.header.mod_time.to_le_bytes())?;
        sink.put(&entry.header.access_mode.to_le_bytes())?;

        // 3. Type and trailer
        match &entry.kind {
            EntryKind::Directory { .. } => {
                sink.put(&[u8::from(TypeCode::Directory)])?;
                return Ok(true);
            }
            EntryKind::File { byte_size: 0, .. } => sink.put(&[u8::from(TypeCode::EmptyFile)])?,
            EntryKind::File { byte_size, byte_offset } => {
                sink.put(&[u8::from(TypeCode::File)])?;
                sink.put(&byte_offset.to_le_bytes())?;
                sink.put(&byte_size.to_le_bytes())?;
            }
            EntryKind::Alias { link, .. } => {
                sink.put(&[u8::from(TypeCode::SoftLink)])?;
                sink.put(&(link.len() as u16).to_le_bytes())?;
                sink.put(link)?;
            }
        }
        Ok(false)
    }
}

/// Bounds-checked reader over one TOC region.
struct Bytes<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Offset of `buf` within the whole TOC, for error messages.
    base: usize,
    order: ByteOrder,
}

impl<'a> Bytes<'a> {
    fn new(buf: &'a [u8], base: usize, order: ByteOrder) -> Self {
        Self { buf, pos: 0, base, order }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(KarError::TocTruncated {
                offset: self.base + self.pos,
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(self.order.u16(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(self.order.u32(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(self.order.u64(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.order.i64(self.array()?))
    }

    fn rest(&mut self) -> (&'a [u8], usize) {
        let start = self.base + self.pos;
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        (out, start)
    }
}

/// A record waiting to be decoded into the directory that holds it.
type PendingRecord<'t> = (Bytes<'t>, EntryId);

pub struct TocDecoder<'a> {
    order: ByteOrder,
    cancel: Option<&'a CancelFlag>,
}

impl<'a> TocDecoder<'a> {
    pub fn new(order: ByteOrder) -> Self {
        Self { order, cancel: None }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Rebuild the tree from a TOC region. Bytes after the root container
    /// (alignment padding) are ignored. Parent links are not stamped.
    ///
    /// Nested containers are expanded from an explicit work list, so the
    /// nesting depth of the input is bounded only by its size.
    pub fn decode(&self, toc: &[u8]) -> Result<EntryTree> {
        let mut tree = EntryTree::new();
        let mut pending: Vec<PendingRecord<'_>> = Vec::new();

        let mut top = Bytes::new(toc, 0, self.order);
        self.container(&mut top, tree.root(), &mut pending)?;

        while let Some((mut record, dir)) = pending.pop() {
            if let Some((mut nested, id)) = self.entry(&mut record, &mut tree, dir)? {
                self.container(&mut nested, id, &mut pending)?;
            }
        }
        Ok(tree)
    }

    /// Split one container into its records and queue them in name order.
    fn container<'t>(&self, bytes: &mut Bytes<'t>, dir: EntryId, pending: &mut Vec<PendingRecord<'t>>) -> Result<()> {
        let num_nodes = bytes.u32()? as usize;
        if num_nodes == 0 {
            return Ok(());
        }
        let data_size = bytes.u32()? as usize;

        let width = index_width(data_size as u64);
        let mut index = Vec::with_capacity(num_nodes.min(data_size));
        for _ in 0..num_nodes {
            let offset = match width {
                1 => bytes.u8()? as usize,
                2 => bytes.u16()? as usize,
                _ => bytes.u32()? as usize,
            };
            index.push(offset);
        }

        let data_base = bytes.base + bytes.pos;
        let data = bytes.take(data_size)?;

        let mut records = Vec::with_capacity(index.len());
        for (i, &start) in index.iter().enumerate() {
            let end = index.get(i + 1).copied().unwrap_or(data_size);
            if start >= end || end > data_size {
                return Err(KarError::TocCorrupt(format!(
                    "record {} of container at offset {} spans {}..{} of {} bytes",
                    i, data_base, start, end, data_size
                )));
            }
            records.push((Bytes::new(&data[start..end], data_base + start, self.order), dir));
        }
        pending.extend(records.into_iter().rev());
        Ok(())
    }

    /// Decode one record into `dir`. A directory hands back the rest of its
    /// record, which holds the container of its children.
    fn entry<'t>(&self, bytes: &mut Bytes<'t>, tree: &mut EntryTree, dir: EntryId) -> Result<Option<PendingRecord<'t>>> {
        if let Some(cancel) = self.cancel {
            cancel.check()?;
        }
        let record_offset = bytes.base;

        let name_len = bytes.u16()? as usize;
        let name = bytes.take(name_len)?.to_vec();
        check_name(&name, record_offset)?;
        let mod_time = bytes.i64()?;
        let access_mode = bytes.u32()?;
        let code = bytes.u8()?;

        let kind = match TypeCode::from(code) {
            TypeCode::Directory => EntryKind::Directory { children: Vec::new() },
            TypeCode::File => {
                let byte_offset = bytes.u64()?;
                let byte_size = bytes.u64()?;
                EntryKind::File { byte_size, byte_offset }
            }
            TypeCode::EmptyFile => EntryKind::File {
                byte_size: 0,
                byte_offset: 0,
            },
            TypeCode::SoftLink => {
                let link_len = bytes.u16()? as usize;
                EntryKind::Alias {
                    link: bytes.take(link_len)?.to_vec(),
                    resolution: Resolution::Pending,
                }
            }
            _ => {
                warn!(
                    "skipping toc entry '{}' with unsupported type code {}",
                    String::from_utf8_lossy(&name),
                    code
                );
                return Ok(None);
            }
        };

        let is_dir = matches!(kind, EntryKind::Directory { .. });
        let entry = Entry {
            header: EntryHeader {
                name,
                mod_time,
                access_mode,
                parent: None,
            },
            kind,
        };
        debug!("decoded toc entry '{}'", entry.name_lossy());
        let id = tree.insert(dir, entry)?;

        if !is_dir {
            return Ok(None);
        }
        let (rest, base) = bytes.rest();
        Ok(Some((Bytes::new(rest, base, self.order), id)))
    }
}

/// Names become path components on extraction; refuse anything that is not
/// a single plain component.
fn check_name(name: &[u8], offset: usize) -> Result<()> {
    if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0) {
        return Err(KarError::TocCorrupt(format!(
            "invalid entry name '{}' at offset {}",
            String::from_utf8_lossy(name),
            offset
        )));
    }
    Ok(())
}

/// Encoded length of the whole TOC of `tree`.
pub fn toc_size(tree: &EntryTree) -> Result<u64> {
    TocEncoder::new(tree).toc_size()
}

/// Decode a TOC region written with `order`.
pub fn decode_toc(toc: &[u8], order: ByteOrder) -> Result<EntryTree> {
    TocDecoder::new(order).decode(toc)
}
