//! Alias (symbolic link) resolution against the in-memory tree.
//!
//! Targets are computed lazily and cached on the alias entry. A link that
//! starts with '/' points outside the archive and is never resolved, and a
//! chain needing more than `MAX_ALIAS_HOPS` links is given up on.

use log::{debug, warn};

use crate::core::entry::{EntryId, EntryKind, EntryTree, Resolution, ResolvedKind};

/// Links followed while resolving one alias, as with ELOOP.
pub const MAX_ALIAS_HOPS: usize = 40;

/// Resolve `alias` and report what it ultimately points at.
///
/// Non-alias entries resolve to their own kind. Requires `link_parents`.
pub fn resolve(tree: &mut EntryTree, alias: EntryId) -> ResolvedKind {
    match target(tree, alias, 0) {
        Some(t) => kind_of(tree, t),
        None => ResolvedKind::Unresolved,
    }
}

/// Resolve every alias in the tree once. Returns how many relative links
/// could not be walked to a target.
pub fn resolve_all(tree: &mut EntryTree) -> usize {
    let mut failed = 0;
    for alias in tree.aliases() {
        if resolve(tree, alias) != ResolvedKind::Unresolved {
            continue;
        }
        let link = tree.get(alias).link().map(|l| String::from_utf8_lossy(l).into_owned()).unwrap_or_default();
        if link.starts_with('/') {
            debug!("alias '{}' -> '{}' points outside the archive", tree.display_path(alias), link);
        } else {
            warn!("unable to resolve alias '{}' -> '{}'", tree.display_path(alias), link);
            failed += 1;
        }
    }
    failed
}

/// Cached resolution of `id` without walking anything.
pub fn resolved_kind(tree: &EntryTree, id: EntryId) -> ResolvedKind {
    match &tree.get(id).kind {
        EntryKind::Alias { resolution, .. } => match resolution {
            Resolution::Target(t) => kind_of(tree, *t),
            _ => ResolvedKind::Unresolved,
        },
        _ => kind_of(tree, id),
    }
}

fn kind_of(tree: &EntryTree, id: EntryId) -> ResolvedKind {
    match tree.get(id).kind {
        EntryKind::Directory { .. } => ResolvedKind::Directory,
        EntryKind::File { .. } => ResolvedKind::File,
        EntryKind::Alias { .. } => ResolvedKind::Unresolved,
    }
}

/// Final non-alias entry reached from `id`.
fn target(tree: &mut EntryTree, id: EntryId, hops: usize) -> Option<EntryId> {
    let link = match &tree.get(id).kind {
        EntryKind::Alias { resolution, link } => match resolution {
            Resolution::Target(t) => return Some(*t),
            Resolution::Unresolved => return None,
            Resolution::InProgress => {
                warn!("alias cycle detected at '{}'", tree.display_path(id));
                return None;
            }
            Resolution::Pending => link.clone(),
        },
        _ => return Some(id),
    };
    if hops >= MAX_ALIAS_HOPS {
        warn!("too many levels of links at '{}'", tree.display_path(id));
        return None;
    }

    set_resolution(tree, id, Resolution::InProgress);
    let found = walk(tree, id, &link, hops);
    set_resolution(
        tree,
        id,
        match found {
            Some(t) => Resolution::Target(t),
            None => Resolution::Unresolved,
        },
    );
    found
}

fn set_resolution(tree: &mut EntryTree, id: EntryId, state: Resolution) {
    if let EntryKind::Alias { resolution, .. } = &mut tree.get_mut(id).kind {
        *resolution = state;
    }
}

fn walk(tree: &mut EntryTree, alias: EntryId, link: &[u8], hops: usize) -> Option<EntryId> {
    if link.first() == Some(&b'/') {
        return None;
    }

    let root = tree.root();
    let mut cur = tree.parent(alias).unwrap_or(root);

    for seg in link.split(|b| *b == b'/') {
        if !tree.get(cur).is_dir() {
            return None;
        }
        match seg {
            b"" | b"." => {}
            b".." => {
                if cur == root {
                    return None;
                }
                cur = tree.parent(cur).unwrap_or(root);
            }
            name => {
                let child = tree.find_child(cur, name)?;
                cur = target(tree, child, hops + 1)?;
            }
        }
    }
    Some(cur)
}
