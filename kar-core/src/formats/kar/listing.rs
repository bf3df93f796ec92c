//! `ls`-style rendering of an archive tree for list/test mode.

use std::fmt::Write as _;

use chrono::{Local, TimeZone};

use crate::core::entry::{EntryId, EntryKind, EntryTree};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIME_WIDTH: usize = 19;

/// One line per entry in tree order. Plain mode prints paths only.
pub fn render(tree: &EntryTree, long: bool) -> String {
    let mut out = String::new();
    if !long {
        let _ = tree.walk::<(), _>(|id| {
            let _ = writeln!(out, "{}", tree.display_path(id));
            Ok(())
        });
        return out;
    }

    let (max_size, max_offset) = maxima(tree);
    let zwidth = digits(max_size);
    let lwidth = digits(max_offset);

    let _ = writeln!(
        out,
        "TypeAccess {:<zw$} {:<lw$} {:<dw$} Path Name",
        "Size",
        "Offset",
        "ModDateTime",
        zw = zwidth,
        lw = lwidth,
        dw = TIME_WIDTH
    );
    let _ = tree.walk::<(), _>(|id| {
        render_long(tree, id, zwidth, lwidth, &mut out);
        Ok(())
    });
    out
}

fn render_long(tree: &EntryTree, id: EntryId, zwidth: usize, lwidth: usize, out: &mut String) {
    let entry = tree.get(id);
    // An alias shows the length of its link text as its size.
    let (size, offset) = match &entry.kind {
        EntryKind::File { byte_size, byte_offset } if *byte_size > 0 => (byte_size.to_string(), byte_offset.to_string()),
        EntryKind::Alias { link, .. } => (link.len().to_string(), "-".to_string()),
        _ => ("-".to_string(), "-".to_string()),
    };

    let _ = write!(
        out,
        "{}{} {:>zw$} {:>lw$} {:>dw$} {}",
        entry.type_letter(),
        access_string(entry.header.access_mode),
        size,
        offset,
        format_time(entry.header.mod_time),
        tree.display_path(id),
        zw = zwidth,
        lw = lwidth,
        dw = TIME_WIDTH
    );
    match entry.link() {
        Some(link) => {
            let _ = writeln!(out, " -> {}", String::from_utf8_lossy(link));
        }
        None => out.push('\n'),
    }
}

/// Largest value of the size and offset columns, computed in one pass.
fn maxima(tree: &EntryTree) -> (u64, u64) {
    let mut max_size = 0u64;
    let mut max_offset = 0u64;
    let _ = tree.walk::<(), _>(|id| {
        match &tree.get(id).kind {
            EntryKind::File { byte_size, byte_offset } if *byte_size > 0 => {
                max_size = max_size.max(*byte_size);
                max_offset = max_offset.max(*byte_offset);
            }
            EntryKind::Alias { link, .. } => max_size = max_size.max(link.len() as u64),
            _ => {}
        }
        Ok(())
    });
    (max_size, max_offset)
}

fn digits(n: u64) -> usize {
    n.to_string().len()
}

/// `rwxr-x---` style rendering of the permission bits.
pub fn access_string(mode: u32) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    BITS.iter().map(|(bit, c)| if mode & bit != 0 { *c } else { '-' }).collect()
}

/// Local time, or the raw seconds when the timestamp is out of range.
pub fn format_time(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(t) => t.format(TIME_FORMAT).to_string(),
        None => secs.to_string(),
    }
}
