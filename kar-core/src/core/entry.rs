//! In-memory entry tree
//!
//! Entries live in an arena owned by `EntryTree` and are addressed by
//! `EntryId`. A directory owns its children through the id list it keeps
//! sorted by byte-wise name comparison; the `parent` field of each header is
//! a plain back-reference into the same arena, stamped by `link_parents`
//! once the tree is fully populated.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::core::native;
use crate::error::{KarError, Result};

/// Handle of an entry inside an `EntryTree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(usize);

impl EntryId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Fields shared by every kind of entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: Vec<u8>,
    /// Seconds since the Unix epoch.
    pub mod_time: i64,
    /// POSIX permission bits.
    pub access_mode: u32,
    pub parent: Option<EntryId>,
}

/// What an alias ultimately points at, looking through alias chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedKind {
    File,
    Directory,
    Unresolved,
}

/// Lazily computed alias target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    InProgress,
    Target(EntryId),
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Directory {
        children: Vec<EntryId>,
    },
    File {
        byte_size: u64,
        /// Offset of the payload from the start of the data section.
        /// Meaningless (and never encoded) for empty files.
        byte_offset: u64,
    },
    Alias {
        link: Vec<u8>,
        resolution: Resolution,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub header: EntryHeader,
    pub kind: EntryKind,
}

impl Entry {
    fn with_kind(name: impl Into<Vec<u8>>, mod_time: i64, access_mode: u32, kind: EntryKind) -> Self {
        Self {
            header: EntryHeader {
                name: name.into(),
                mod_time,
                access_mode,
                parent: None,
            },
            kind,
        }
    }

    pub fn directory(name: impl Into<Vec<u8>>, mod_time: i64, access_mode: u32) -> Self {
        Self::with_kind(name, mod_time, access_mode, EntryKind::Directory { children: Vec::new() })
    }

    pub fn file(name: impl Into<Vec<u8>>, mod_time: i64, access_mode: u32, byte_size: u64) -> Self {
        Self::with_kind(
            name,
            mod_time,
            access_mode,
            EntryKind::File {
                byte_size,
                byte_offset: 0,
            },
        )
    }

    pub fn alias(name: impl Into<Vec<u8>>, mod_time: i64, access_mode: u32, link: impl Into<Vec<u8>>) -> Self {
        Self::with_kind(
            name,
            mod_time,
            access_mode,
            EntryKind::Alias {
                link: link.into(),
                resolution: Resolution::Pending,
            },
        )
    }

    pub fn name(&self) -> &[u8] {
        &self.header.name
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.header.name)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, EntryKind::Alias { .. })
    }

    /// `-`, `d` or `l`, as in `ls -l`.
    pub fn type_letter(&self) -> char {
        match self.kind {
            EntryKind::Directory { .. } => 'd',
            EntryKind::File { .. } => '-',
            EntryKind::Alias { .. } => 'l',
        }
    }

    pub fn byte_size(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File { byte_size, .. } => Some(byte_size),
            _ => None,
        }
    }

    pub fn byte_offset(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File { byte_offset, .. } => Some(byte_offset),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<&[u8]> {
        match &self.kind {
            EntryKind::Alias { link, .. } => Some(link),
            _ => None,
        }
    }
}

/// Counts of each entry kind reachable from the root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub files: usize,
    pub directories: usize,
    pub aliases: usize,
}

/// Arena-backed tree with a synthetic, nameless root directory.
#[derive(Debug, Clone)]
pub struct EntryTree {
    entries: Vec<Entry>,
}

impl Default for EntryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryTree {
    const ROOT: EntryId = EntryId(0);

    pub fn new() -> Self {
        Self {
            entries: vec![Entry::directory(Vec::new(), 0, 0o755)],
        }
    }

    pub fn root(&self) -> EntryId {
        Self::ROOT
    }

    /// Number of arena slots, unlinked entries and the root included. Every
    /// `EntryId::index` of this tree is below it.
    pub fn arena_len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: EntryId) -> &Entry {
        &self.entries[id.0]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.0]
    }

    /// Children of `dir` in name order; empty for anything but a directory.
    pub fn children(&self, dir: EntryId) -> &[EntryId] {
        match &self.get(dir).kind {
            EntryKind::Directory { children } => children,
            _ => &[],
        }
    }

    pub fn parent(&self, id: EntryId) -> Option<EntryId> {
        self.get(id).header.parent
    }

    pub fn find_child(&self, dir: EntryId, name: &[u8]) -> Option<EntryId> {
        let children = self.children(dir);
        children
            .binary_search_by(|c| self.get(*c).name().cmp(name))
            .ok()
            .map(|i| children[i])
    }

    /// Insert `entry` into `dir`, keeping the children sorted by name.
    ///
    /// The parent back-reference is not stamped here; see `link_parents`.
    pub fn insert(&mut self, dir: EntryId, entry: Entry) -> Result<EntryId> {
        let pos = {
            let children = match &self.get(dir).kind {
                EntryKind::Directory { children } => children,
                _ => return Err(KarError::NotADirectory(self.get(dir).name_lossy().into_owned())),
            };
            match children.binary_search_by(|c| self.get(*c).name().cmp(entry.name())) {
                Ok(_) => return Err(KarError::DuplicateName(entry.name_lossy().into_owned())),
                Err(pos) => pos,
            }
        };

        let id = EntryId(self.entries.len());
        self.entries.push(entry);
        if let EntryKind::Directory { children } = &mut self.entries[dir.0].kind {
            children.insert(pos, id);
        }
        Ok(id)
    }

    /// Stamp every reachable entry's parent reference. Top-level entries
    /// point at the synthetic root; the root itself has no parent.
    pub fn link_parents(&mut self) {
        let mut stack = vec![Self::ROOT];
        while let Some(dir) = stack.pop() {
            let children = self.children(dir).to_vec();
            for child in children {
                self.entries[child.0].header.parent = Some(dir);
                if self.entries[child.0].is_dir() {
                    stack.push(child);
                }
            }
        }
    }

    /// Archive-relative path components of `id`, outermost first.
    fn components(&self, id: EntryId) -> Vec<&[u8]> {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == Self::ROOT {
                break;
            }
            parts.push(self.get(c).name());
            cur = self.parent(c);
        }
        parts.reverse();
        parts
    }

    /// '/'-joined path of `id` from the archive root, optionally prefixed by
    /// an external filesystem root. Requires `link_parents` to have run.
    pub fn full_path(&self, id: EntryId, root_prefix: Option<&Path>) -> PathBuf {
        let mut path = root_prefix.map(Path::to_path_buf).unwrap_or_default();
        for part in self.components(id) {
            path.push(native::os_str(part));
        }
        path
    }

    /// Archive-relative path for display, invalid UTF-8 replaced.
    pub fn display_path(&self, id: EntryId) -> String {
        let parts: Vec<Cow<'_, str>> = self.components(id).into_iter().map(String::from_utf8_lossy).collect();
        parts.join("/")
    }

    /// Find an entry by archive-relative path. Aliases are not followed.
    pub fn lookup(&self, path: &str) -> Option<EntryId> {
        let mut cur = Self::ROOT;
        for seg in path.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            cur = self.find_child(cur, seg.as_bytes())?;
        }
        (cur != Self::ROOT).then_some(cur)
    }

    /// Depth-first, name-ordered pre-order walk over every entry below the
    /// root. Stops at the first error returned by `visit`.
    pub fn walk<E, F>(&self, mut visit: F) -> std::result::Result<(), E>
    where
        F: FnMut(EntryId) -> std::result::Result<(), E>,
    {
        self.walk_from(Self::ROOT, &mut visit)
    }

    fn walk_from<E, F>(&self, dir: EntryId, visit: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(EntryId) -> std::result::Result<(), E>,
    {
        let mut stack: Vec<EntryId> = self.children(dir).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            visit(id)?;
            stack.extend(self.children(id).iter().rev());
        }
        Ok(())
    }

    /// All files in tree-walk (name) order.
    pub fn files(&self) -> Vec<EntryId> {
        let mut files = Vec::new();
        let _ = self.walk::<(), _>(|id| {
            if self.get(id).is_file() {
                files.push(id);
            }
            Ok(())
        });
        files
    }

    /// All aliases in tree-walk order.
    pub fn aliases(&self) -> Vec<EntryId> {
        let mut aliases = Vec::new();
        let _ = self.walk::<(), _>(|id| {
            if self.get(id).is_alias() {
                aliases.push(id);
            }
            Ok(())
        });
        aliases
    }

    pub fn counts(&self) -> EntryCounts {
        let mut counts = EntryCounts::default();
        let _ = self.walk::<(), _>(|id| {
            match self.get(id).kind {
                EntryKind::Directory { .. } => counts.directories += 1,
                EntryKind::File { .. } => counts.files += 1,
                EntryKind::Alias { .. } => counts.aliases += 1,
            }
            Ok(())
        });
        counts
    }

    /// Keep only entries named by `keep`, everything beneath them and their
    /// ancestors. Returns the paths that matched nothing. No-op when `keep`
    /// is empty.
    pub fn retain_paths(&mut self, keep: &[String]) -> Vec<String> {
        if keep.is_empty() {
            return Vec::new();
        }

        let mut marked = vec![false; self.entries.len()];
        marked[Self::ROOT.0] = true;
        let mut unmatched = Vec::new();

        for path in keep {
            let Some(id) = self.lookup(path) else {
                unmatched.push(path.clone());
                continue;
            };
            let mut up = self.parent(id);
            while let Some(p) = up {
                marked[p.0] = true;
                up = self.parent(p);
            }
            marked[id.0] = true;
            let _ = self.walk_from::<(), _>(id, &mut |c| {
                marked[c.0] = true;
                Ok(())
            });
        }

        for entry in &mut self.entries {
            if let EntryKind::Directory { children } = &mut entry.kind {
                children.retain(|c| marked[c.0]);
            }
        }
        unmatched
    }

    /// Remove every entry named by `drop`, with its subtree. Returns the
    /// paths that matched nothing.
    pub fn drop_paths(&mut self, drop: &[String]) -> Vec<String> {
        let mut unmatched = Vec::new();
        for path in drop {
            match self.lookup(path) {
                Some(id) => self.unlink(id),
                None => unmatched.push(path.clone()),
            }
        }
        unmatched
    }

    fn unlink(&mut self, id: EntryId) {
        let parent = self.parent(id).unwrap_or(Self::ROOT);
        if let EntryKind::Directory { children } = &mut self.entries[parent.0].kind {
            children.retain(|c| *c != id);
        }
    }
}
