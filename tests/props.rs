//! Property tests over the quantified invariants: any legal operation
//! sequence leaves the tree consistent, listings sorted, link counts
//! exact, and the whole state equal to itself across a remount.

use proptest::prelude::*;
use razorfs::{Config, FileType, RazorFs, RenameFlags};

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        region_dir: dir.path().join("regions"),
        region_capacity: 2 << 20,
        wal_path: dir.path().join("wal"),
        wal_size_limit: 1 << 20,
        rebalance_interval: 17,
        ..Config::default()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Mkdir(u8),
    Remove(u8),
    Rename(u8, u8),
    Write(u8, u16, u16),
    Truncate(u8, u16),
    Link(u8, u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12).prop_map(Op::Create),
        (0u8..12).prop_map(Op::Mkdir),
        (0u8..12).prop_map(Op::Remove),
        (0u8..12, 0u8..12).prop_map(|(a, b)| Op::Rename(a, b)),
        (0u8..12, 0u16..12_000, 0u16..6_000).prop_map(|(n, o, l)| Op::Write(n, o, l)),
        (0u8..12, 0u16..12_000).prop_map(|(n, l)| Op::Truncate(n, l)),
        (0u8..12, 0u8..12).prop_map(|(a, b)| Op::Link(a, b)),
    ]
}

fn name(n: u8) -> Vec<u8> {
    format!("n{n:02}").into_bytes()
}

/// Applies an op, ignoring the typed errors an arbitrary sequence is
/// expected to produce (ErrNotFound, ErrExists, ErrIsDir, ...).
fn apply(fs: &RazorFs, root: u64, op: &Op) {
    let _ = match op {
        Op::Create(n) => fs.create(root, &name(*n), 0o644, 0, 0).map(|_| ()),
        Op::Mkdir(n) => fs.mkdir(root, &name(*n), 0o755, 0, 0).map(|_| ()),
        Op::Remove(n) => match fs.lookup(root, &name(*n)).and_then(|i| fs.getattr(i)) {
            Ok(attr) if attr.kind == FileType::Directory => fs.rmdir(root, &name(*n)),
            Ok(_) => fs.unlink(root, &name(*n)),
            Err(e) => Err(e),
        },
        Op::Rename(a, b) => fs.rename(root, &name(*a), root, &name(*b), RenameFlags::empty()),
        Op::Write(n, off, len) => fs
            .lookup(root, &name(*n))
            .and_then(|i| fs.write(i, *off as u64, &vec![*n; *len as usize]))
            .map(|_| ()),
        Op::Truncate(n, len) => fs
            .lookup(root, &name(*n))
            .and_then(|i| fs.truncate(i, *len as u64)),
        Op::Link(a, b) => fs
            .lookup(root, &name(*a))
            .and_then(|i| fs.link(i, root, &name(*b))),
    };
}

/// Full recursive snapshot: path, kind, size, link count, content.
fn snapshot(fs: &RazorFs, ino: u64, path: String, out: &mut Vec<(String, FileType, u64, u32, Vec<u8>)>) {
    let attr = fs.getattr(ino).unwrap();
    let content = if attr.kind == FileType::Regular {
        fs.read(ino, 0, attr.size as u32).unwrap()
    } else {
        Vec::new()
    };
    out.push((path.clone(), attr.kind, attr.size, attr.nlink, content));
    if attr.kind == FileType::Directory {
        let (entries, _) = fs.readdir(ino, 0).unwrap();
        for e in entries.iter().skip(2) {
            snapshot(fs, e.ino, format!("{path}/{}", String::from_utf8_lossy(&e.name)), out);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn op_sequences_stay_consistent_and_survive_remount(ops in prop::collection::vec(op(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let fs = RazorFs::mount(test_config(&dir)).unwrap();
        let root = fs.resolve(b"/").unwrap();
        for o in &ops {
            apply(&fs, root, o);
        }
        fs.fsck().unwrap();

        let mut before = Vec::new();
        snapshot(&fs, root, String::new(), &mut before);
        fs.unmount().unwrap();

        let fs = RazorFs::mount(test_config(&dir)).unwrap();
        fs.fsck().unwrap();
        let root = fs.resolve(b"/").unwrap();
        let mut after = Vec::new();
        snapshot(&fs, root, String::new(), &mut after);
        prop_assert_eq!(before, after);
    }

    #[test]
    fn listings_are_always_sorted(names in prop::collection::vec("[a-z]{1,12}", 1..40)) {
        let dir = tempfile::tempdir().unwrap();
        let fs = RazorFs::mount(test_config(&dir)).unwrap();
        let root = fs.resolve(b"/").unwrap();
        for n in &names {
            let _ = fs.create(root, n.as_bytes(), 0o644, 0, 0);
        }
        let (entries, _) = fs.readdir(root, 0).unwrap();
        let listed: Vec<&[u8]> = entries.iter().skip(2).map(|e| e.name.as_slice()).collect();
        prop_assert!(listed.windows(2).all(|w| w[0] < w[1]));
        let mut unique: Vec<&[u8]> = names.iter().map(|s| s.as_bytes()).collect();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(listed.len(), unique.len());
        fs.fsck().unwrap();
    }

    #[test]
    fn random_writes_match_a_byte_model(
        writes in prop::collection::vec((0u64..16_000, prop::collection::vec(any::<u8>(), 1..4000)), 1..10)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let fs = RazorFs::mount(test_config(&dir)).unwrap();
        let root = fs.resolve(b"/").unwrap();
        let f = fs.create(root, b"model", 0o644, 0, 0).unwrap();

        let mut model: Vec<u8> = Vec::new();
        for (off, data) in &writes {
            let end = *off as usize + data.len();
            if model.len() < end {
                model.resize(end, 0);
            }
            model[*off as usize..end].copy_from_slice(data);
            fs.write(f, *off, data).unwrap();
        }
        let got = fs.read(f, 0, model.len() as u32).unwrap();
        prop_assert_eq!(got, model);
        fs.fsck().unwrap();
    }
}
