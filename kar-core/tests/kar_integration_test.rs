// Fixtures rely on POSIX permission bits and symbolic links.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use filetime::FileTime;
use kar_core::core::ResolvedKind;
use kar_core::formats::kar::constants::HEADER_SIZE;
use kar_core::{
    create, extract, list, open_and_verify, CancelFlag, CreateOptions, ErrorClass, ExtractOptions, KarError,
    KarReader, ListOptions, ProgressFn,
};
use tempfile::TempDir;
use walkdir::WalkDir;

const PINNED: i64 = 1_500_000_000;

/// docs/readme.txt 500 bytes, docs/nested/tiny.bin 10, big.dat 300,
/// empty.txt 0, plus two links. Every timestamp is pinned.
fn build_source(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("docs/nested"))?;
    fs::write(root.join("docs/readme.txt"), vec![b'r'; 500])?;
    fs::write(root.join("docs/nested/tiny.bin"), vec![b't'; 10])?;
    fs::write(root.join("big.dat"), (0..300u32).map(|i| i as u8).collect::<Vec<u8>>())?;
    fs::write(root.join("empty.txt"), b"")?;
    symlink("docs/readme.txt", root.join("link_to_readme"))?;
    symlink("../big.dat", root.join("docs/up"))?;

    fs::set_permissions(root.join("docs/readme.txt"), fs::Permissions::from_mode(0o640))?;
    fs::set_permissions(root.join("big.dat"), fs::Permissions::from_mode(0o600))?;
    fs::set_permissions(root.join("empty.txt"), fs::Permissions::from_mode(0o604))?;
    fs::set_permissions(root.join("docs/nested"), fs::Permissions::from_mode(0o750))?;

    let mut offset = 0;
    let mut pin = |path: PathBuf, link: bool| -> Result<()> {
        offset += 60;
        let t = FileTime::from_unix_time(PINNED + offset, 0);
        if link {
            filetime::set_symlink_file_times(&path, t, t)?;
        } else {
            filetime::set_file_mtime(&path, t)?;
        }
        Ok(())
    };
    pin(root.join("docs/readme.txt"), false)?;
    pin(root.join("docs/nested/tiny.bin"), false)?;
    pin(root.join("big.dat"), false)?;
    pin(root.join("empty.txt"), false)?;
    pin(root.join("link_to_readme"), true)?;
    pin(root.join("docs/up"), true)?;
    pin(root.join("docs/nested"), false)?;
    pin(root.join("docs"), false)?;
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Snapshot {
    File { data: Vec<u8>, mode: u32, mtime: i64 },
    Dir { mode: u32, mtime: i64 },
    Link { target: PathBuf, mtime: i64 },
}

fn snapshot(root: &Path) -> Result<BTreeMap<PathBuf, Snapshot>> {
    let mut out = BTreeMap::new();
    for item in WalkDir::new(root).min_depth(1).follow_links(false) {
        let item = item?;
        let rel = item.path().strip_prefix(root)?.to_path_buf();
        let meta = fs::symlink_metadata(item.path())?;
        let snap = if meta.file_type().is_symlink() {
            Snapshot::Link {
                target: fs::read_link(item.path())?,
                mtime: meta.mtime(),
            }
        } else if meta.is_dir() {
            Snapshot::Dir {
                mode: meta.mode() & 0o7777,
                mtime: meta.mtime(),
            }
        } else {
            Snapshot::File {
                data: fs::read(item.path())?,
                mode: meta.mode() & 0o7777,
                mtime: meta.mtime(),
            }
        };
        out.insert(rel, snap);
    }
    Ok(out)
}

fn fixture() -> Result<(TempDir, PathBuf, PathBuf)> {
    let work = TempDir::new()?;
    let source = work.path().join("source");
    fs::create_dir(&source)?;
    build_source(&source)?;
    let archive = work.path().join("out.kar");
    Ok((work, source, archive))
}

#[test]
fn test_round_trip_restores_tree() -> Result<()> {
    let (work, source, archive) = fixture()?;

    let summary = create(&source, &archive, &CreateOptions::default())?;
    assert_eq!(summary.files, 4);
    assert_eq!(summary.directories, 2);
    assert_eq!(summary.aliases, 2);
    assert_eq!(summary.archive_size, fs::metadata(&archive)?.len());

    let dest = work.path().join("dest");
    let extracted = extract(&archive, &dest, &ExtractOptions::default())?;
    assert_eq!(extracted.files, 4);
    assert_eq!(extracted.bytes, 810);

    assert_eq!(snapshot(&source)?, snapshot(&dest)?);

    let empty = fs::metadata(dest.join("empty.txt"))?;
    assert_eq!(empty.len(), 0);
    assert_eq!(empty.mode() & 0o7777, 0o604);
    Ok(())
}

#[test]
fn test_identical_sources_give_identical_archives() -> Result<()> {
    let (_w1, source1, archive1) = fixture()?;
    let (_w2, source2, archive2) = fixture()?;

    create(&source1, &archive1, &CreateOptions::default())?;
    create(&source2, &archive2, &CreateOptions::default())?;
    assert_eq!(fs::read(&archive1)?, fs::read(&archive2)?);
    Ok(())
}

#[test]
fn test_layout_is_size_sorted_and_aligned() -> Result<()> {
    let (_work, source, archive) = fixture()?;
    let summary = create(&source, &archive, &CreateOptions::default())?;

    let header = open_and_verify(&archive)?;
    assert_eq!(header.file_offset % 4, 0);
    assert_eq!(header.file_offset, summary.data_start);
    assert!(header.file_offset >= HEADER_SIZE as u64 + summary.toc_size);

    let reader = KarReader::open(&archive, &CancelFlag::new())?;
    let tree = reader.tree();
    let offset = |p: &str| tree.lookup(p).and_then(|id| tree.get(id).byte_offset());
    assert_eq!(offset("docs/nested/tiny.bin"), Some(0));
    assert_eq!(offset("big.dat"), Some(12));
    assert_eq!(offset("docs/readme.txt"), Some(312));

    for id in tree.files() {
        assert_eq!(tree.get(id).byte_offset().unwrap_or(0) % 4, 0);
    }
    assert_eq!(tree.get(tree.lookup("empty.txt").unwrap()).byte_size(), Some(0));
    assert_eq!(summary.archive_size, header.file_offset + 312 + 500);

    // payload bytes sit exactly where the toc says
    let bytes = fs::read(&archive)?;
    let start = (header.file_offset + 12) as usize;
    assert_eq!(&bytes[start..start + 300], &fs::read(source.join("big.dat"))?[..]);
    assert!(bytes[start - 2..start].iter().all(|b| *b == 0));
    Ok(())
}

#[test]
fn test_aliases_resolve_after_read() -> Result<()> {
    let (_work, source, archive) = fixture()?;
    create(&source, &archive, &CreateOptions::default())?;

    let reader = KarReader::open(&archive, &CancelFlag::new())?;
    let tree = reader.tree();
    let up = tree.lookup("docs/up").expect("alias stored");
    let readme = tree.lookup("link_to_readme").expect("alias stored");
    assert_eq!(kar_core::core::alias::resolved_kind(tree, up), ResolvedKind::File);
    assert_eq!(kar_core::core::alias::resolved_kind(tree, readme), ResolvedKind::File);
    Ok(())
}

fn corrupt(archive: &Path, tag: &str, at: usize, bytes: &[u8]) -> Result<PathBuf> {
    let mut data = fs::read(archive)?;
    data[at..at + bytes.len()].copy_from_slice(bytes);
    let path = archive.with_extension(tag);
    fs::write(&path, data)?;
    Ok(path)
}

#[test]
fn test_header_rejection() -> Result<()> {
    let (work, source, archive) = fixture()?;
    create(&source, &archive, &CreateOptions::default())?;

    let bad_magic = corrupt(&archive, "magic", 0, b"XCBI")?;
    let bad_order = corrupt(&archive, "order", 8, &0xdead_beefu32.to_le_bytes())?;
    let version0 = corrupt(&archive, "v0", 12, &0u32.to_le_bytes())?;
    let version2 = corrupt(&archive, "v2", 12, &2u32.to_le_bytes())?;

    assert!(matches!(open_and_verify(&bad_magic), Err(KarError::BadMagic(_))));
    assert!(matches!(open_and_verify(&bad_order), Err(KarError::BadByteOrder(0xdead_beef))));
    assert!(matches!(open_and_verify(&version0), Err(KarError::InvalidVersion)));
    assert!(matches!(open_and_verify(&version2), Err(KarError::UnsupportedVersion(2))));

    let short = work.path().join("short.kar");
    fs::write(&short, &fs::read(&archive)?[..12])?;
    assert!(matches!(open_and_verify(&short), Err(KarError::HeaderTruncated(12))));

    let dest = work.path().join("never");
    let err = extract(&bad_magic, &dest, &ExtractOptions::default()).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Format);
    assert!(!dest.exists());
    assert!(list(&version2, &ListOptions::default()).is_err());
    Ok(())
}

#[test]
fn test_md5_sidecar() -> Result<()> {
    use md5::{Digest, Md5};

    let (_work, source, archive) = fixture()?;
    let options = CreateOptions {
        md5: true,
        ..Default::default()
    };
    create(&source, &archive, &options)?;

    let digest = hex::encode(Md5::digest(fs::read(&archive)?));
    let sidecar = fs::read_to_string(archive.with_extension("kar.md5"))?;
    assert_eq!(sidecar, format!("{} *out.kar\n", digest));
    Ok(())
}

#[test]
fn test_force_semantics() -> Result<()> {
    let (work, source, archive) = fixture()?;
    create(&source, &archive, &CreateOptions::default())?;

    let err = create(&source, &archive, &CreateOptions::default()).unwrap_err();
    assert!(matches!(err, KarError::AlreadyExists(_)));
    let forced = CreateOptions {
        force: true,
        ..Default::default()
    };
    create(&source, &archive, &forced)?;

    let dest = work.path().join("dest");
    fs::create_dir(&dest)?;
    fs::write(dest.join("big.dat"), b"stale")?;
    let err = extract(&archive, &dest, &ExtractOptions::default()).unwrap_err();
    assert!(matches!(err, KarError::AlreadyExists(_)));

    let merge = ExtractOptions {
        force: true,
        ..Default::default()
    };
    extract(&archive, &dest, &merge)?;
    assert_eq!(fs::read(dest.join("big.dat"))?, fs::read(source.join("big.dat"))?);

    // extracting over the same tree again replaces files and links
    extract(&archive, &dest, &merge)?;
    assert_eq!(snapshot(&source)?, snapshot(&dest)?);
    Ok(())
}

#[test]
fn test_archive_inside_source_is_left_out() -> Result<()> {
    let (_work, source, _) = fixture()?;
    let archive = source.join("self.kar");
    fs::write(&archive, b"previous run")?;

    let options = CreateOptions {
        force: true,
        ..Default::default()
    };
    let summary = create(&source, &archive, &options)?;
    assert_eq!(summary.files, 4);
    let listing = list(&archive, &ListOptions::default())?;
    assert!(!listing.contains("self.kar"));
    Ok(())
}

#[test]
fn test_listing() -> Result<()> {
    let (_work, source, archive) = fixture()?;
    create(&source, &archive, &CreateOptions::default())?;

    let plain = list(&archive, &ListOptions { long: false })?;
    assert_eq!(
        plain,
        "big.dat\ndocs\ndocs/nested\ndocs/nested/tiny.bin\ndocs/readme.txt\ndocs/up\nempty.txt\nlink_to_readme\n"
    );

    let long = list(&archive, &ListOptions { long: true })?;
    let lines: Vec<&str> = long.lines().collect();
    assert!(lines[0].starts_with("TypeAccess Size Offset ModDateTime"));
    assert!(lines[1].starts_with("-rw------- 300  12 "));
    assert!(lines[1].ends_with(" big.dat"));
    assert!(lines.iter().any(|l| l.starts_with('l') && l.ends_with("docs/up -> ../big.dat")));
    assert!(lines.iter().any(|l| l.starts_with("-rw----r--   -   - ") && l.ends_with(" empty.txt")));
    Ok(())
}

#[test]
fn test_keep_and_drop_filters() -> Result<()> {
    let (work, source, archive) = fixture()?;
    let options = CreateOptions {
        keep: vec!["docs".to_string(), "missing.txt".to_string()],
        drop: vec!["docs/nested".to_string()],
        ..Default::default()
    };
    let summary = create(&source, &archive, &options)?;
    assert_eq!(summary.files, 1);
    assert_eq!(summary.directories, 1);
    assert_eq!(summary.aliases, 1);

    let dest = work.path().join("dest");
    extract(&archive, &dest, &ExtractOptions::default())?;
    assert!(dest.join("docs/readme.txt").is_file());
    assert!(!dest.join("docs/nested").exists());
    assert!(!dest.join("big.dat").exists());
    // the link is extracted even though its target was filtered out
    assert_eq!(fs::read_link(dest.join("docs/up"))?, Path::new("../big.dat"));
    Ok(())
}

#[test]
fn test_progress_and_cancel() -> Result<()> {
    let (work, source, archive) = fixture()?;

    let calls = Arc::new(AtomicUsize::new(0));
    let names = Arc::new(Mutex::new(Vec::new()));
    let (c, n) = (calls.clone(), names.clone());
    let progress: ProgressFn = Arc::new(move |current: usize, total: usize, name: &str| {
        c.fetch_add(1, Ordering::SeqCst);
        assert!(current <= total);
        if let Ok(mut v) = n.lock() {
            v.push(name.to_string());
        }
    });
    let options = CreateOptions {
        progress: Some(progress),
        ..Default::default()
    };
    create(&source, &archive, &options)?;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *names.lock().map_err(|_| anyhow::anyhow!("poisoned"))?,
        vec!["docs/nested/tiny.bin", "big.dat", "docs/readme.txt"]
    );

    let cancelled = ExtractOptions::default();
    cancelled.cancel.cancel();
    let err = extract(&archive, &work.path().join("dest"), &cancelled).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Cancelled);
    Ok(())
}
