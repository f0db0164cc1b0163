//! End-to-end engine scenarios, driven through the public handle the way
//! a filesystem bridge would drive it.

use std::sync::Arc;
use std::thread;

use razorfs::{Config, FsError, RazorFs, RenameFlags, Setattr};

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        region_dir: dir.path().join("regions"),
        region_capacity: 2 << 20,
        wal_path: dir.path().join("wal"),
        wal_size_limit: 1 << 20,
        rebalance_interval: 0,
        ..Config::default()
    }
}

fn mount(dir: &tempfile::TempDir) -> RazorFs {
    let _ = env_logger::builder().is_test(true).try_init();
    RazorFs::mount(test_config(dir)).unwrap()
}

#[test]
fn fresh_mount_has_an_empty_root() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let attr = fs.getattr(root).unwrap();
    assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFDIR);
    assert_eq!(attr.nlink, 2);
    let (entries, _) = fs.readdir(root, 0).unwrap();
    let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
    assert_eq!(names, vec![b".".as_slice(), b"..".as_slice()]);
    fs.fsck().unwrap();
}

#[test]
fn create_write_remount_read() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let ino = fs.create(root, b"hello.txt", 0o644, 0, 0).unwrap();
    assert_eq!(fs.write(ino, 0, b"Hello, world!").unwrap(), 13);
    fs.unmount().unwrap();

    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let ino = fs.lookup(root, b"hello.txt").unwrap();
    assert_eq!(fs.read(ino, 0, 13).unwrap(), b"Hello, world!");
    assert_eq!(fs.getattr(ino).unwrap().size, 13);
    fs.fsck().unwrap();
}

#[test]
fn rename_moves_across_directories() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let a = fs.mkdir(root, b"a", 0o755, 0, 0).unwrap();
    let b = fs.mkdir(root, b"b", 0o755, 0, 0).unwrap();
    let f = fs.create(a, b"f", 0o644, 0, 0).unwrap();

    fs.rename(a, b"f", b, b"g", RenameFlags::empty()).unwrap();
    assert!(matches!(fs.lookup(a, b"f"), Err(FsError::NotFound)));
    assert_eq!(fs.lookup(b, b"g").unwrap(), f);
    assert_eq!(fs.getattr(f).unwrap().nlink, 1);
    fs.fsck().unwrap();
}

#[test]
fn rename_into_own_subtree_is_a_loop() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let x = fs.mkdir(root, b"x", 0o755, 0, 0).unwrap();
    let y = fs.mkdir(x, b"y", 0o755, 0, 0).unwrap();

    assert!(matches!(
        fs.rename(root, b"x", y, b"x", RenameFlags::empty()),
        Err(FsError::Loop)
    ));
    // Tree unchanged.
    assert_eq!(fs.lookup(root, b"x").unwrap(), x);
    assert_eq!(fs.lookup(x, b"y").unwrap(), y);
    fs.fsck().unwrap();
}

#[test]
fn rename_back_and_forth_is_a_structural_noop() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    fs.create(root, b"a", 0o644, 0, 0).unwrap();
    let before: Vec<_> = fs.readdir(root, 0).unwrap().0.iter().map(|e| (e.ino, e.name.clone())).collect();

    fs.rename(root, b"a", root, b"b", RenameFlags::empty()).unwrap();
    fs.rename(root, b"b", root, b"a", RenameFlags::empty()).unwrap();
    let after: Vec<_> = fs.readdir(root, 0).unwrap().0.iter().map(|e| (e.ino, e.name.clone())).collect();
    assert_eq!(before, after);
    fs.fsck().unwrap();
}

#[test]
fn rename_noreplace_refuses_an_existing_destination() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    fs.create(root, b"a", 0o644, 0, 0).unwrap();
    let b = fs.create(root, b"b", 0o644, 0, 0).unwrap();

    assert!(matches!(
        fs.rename(root, b"a", root, b"b", RenameFlags::NOREPLACE),
        Err(FsError::Exists)
    ));
    // Without the flag the destination is replaced in the same operation.
    fs.rename(root, b"a", root, b"b", RenameFlags::empty()).unwrap();
    assert!(matches!(fs.getattr(b), Err(FsError::NotFound)));
    fs.fsck().unwrap();
}

#[test]
fn compression_roundtrips_both_kinds_of_payload() {
    use rand::RngCore;
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();

    let compressible = vec![b'A'; 4096];
    let a = fs.create(root, b"aaaa", 0o644, 0, 0).unwrap();
    fs.write(a, 0, &compressible).unwrap();
    assert_eq!(fs.read(a, 0, 4096).unwrap(), compressible);

    let mut random = vec![0u8; 4096];
    rand::thread_rng().fill_bytes(&mut random);
    let r = fs.create(root, b"rand", 0o644, 0, 0).unwrap();
    fs.write(r, 0, &random).unwrap();
    assert_eq!(fs.read(r, 0, 4096).unwrap(), random);

    // Both survive a remount byte-for-byte.
    fs.unmount().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let a = fs.lookup(root, b"aaaa").unwrap();
    let r = fs.lookup(root, b"rand").unwrap();
    assert_eq!(fs.read(a, 0, 4096).unwrap(), compressible);
    assert_eq!(fs.read(r, 0, 4096).unwrap(), random);
}

#[test]
fn concurrent_creates_never_collide() {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(mount(&dir));
    let root = fs.resolve(b"/").unwrap();
    let threads = 8;
    let per_thread = 16;

    let mut handles = Vec::new();
    for t in 0..threads {
        let fs = Arc::clone(&fs);
        handles.push(thread::spawn(move || {
            for i in 0..per_thread {
                fs.create(root, format!("t{t:02}-{i:02}").as_bytes(), 0o644, 0, 0)
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let (entries, _) = fs.readdir(root, 0).unwrap();
    let names: Vec<Vec<u8>> = entries.iter().skip(2).map(|e| e.name.clone()).collect();
    assert_eq!(names.len(), threads * per_thread);
    assert!(names.windows(2).all(|w| w[0] < w[1]));
    fs.fsck().unwrap();
}

#[test]
fn concurrent_identical_creates_leave_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(mount(&dir));
    let root = fs.resolve(b"/").unwrap();

    let results: Vec<Result<u64, FsError>> = (0..2)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || fs.create(root, b"same", 0o644, 0, 0))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let wins = results.iter().filter(|r| r.is_ok()).count();
    let exists = results
        .iter()
        .filter(|r| matches!(r, Err(FsError::Exists)))
        .count();
    assert_eq!((wins, exists), (1, 1));
    fs.fsck().unwrap();
}

#[test]
fn name_length_boundary_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let max = vec![b'x'; 255];
    let over = vec![b'x'; 256];
    fs.create(root, &max, 0o644, 0, 0).unwrap();
    assert!(fs.lookup(root, &max).is_ok());
    assert!(matches!(
        fs.create(root, &over, 0o644, 0, 0),
        Err(FsError::NameTooLong)
    ));
}

#[test]
fn empty_read_and_gap_writes() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let f = fs.create(root, b"sparse", 0o644, 0, 0).unwrap();

    // Empty read returns zero bytes with no error.
    assert_eq!(fs.read(f, 0, 4096).unwrap(), Vec::<u8>::new());

    // A write far past the end zero-fills the gap.
    fs.write(f, 10_000, b"tail").unwrap();
    assert_eq!(fs.getattr(f).unwrap().size, 10_004);
    let head = fs.read(f, 0, 10_000).unwrap();
    assert_eq!(head.len(), 10_000);
    assert!(head.iter().all(|&b| b == 0));
    assert_eq!(fs.read(f, 10_000, 4).unwrap(), b"tail");
}

#[test]
fn create_then_unlink_restores_the_listing() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    fs.create(root, b"keep", 0o644, 0, 0).unwrap();
    let before: Vec<_> = fs.readdir(root, 0).unwrap().0.iter().map(|e| e.name.clone()).collect();

    fs.create(root, b"tmp", 0o644, 0, 0).unwrap();
    fs.unlink(root, b"tmp").unwrap();
    let after: Vec<_> = fs.readdir(root, 0).unwrap().0.iter().map(|e| e.name.clone()).collect();
    assert_eq!(before, after);
    fs.fsck().unwrap();
}

#[test]
fn rmdir_refuses_a_populated_directory() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let d = fs.mkdir(root, b"d", 0o755, 0, 0).unwrap();
    fs.create(d, b"f", 0o644, 0, 0).unwrap();
    assert!(matches!(fs.rmdir(root, b"d"), Err(FsError::NotEmpty)));
    fs.unlink(d, b"f").unwrap();
    fs.rmdir(root, b"d").unwrap();
    assert!(matches!(fs.getattr(d), Err(FsError::NotFound)));
    fs.fsck().unwrap();
}

#[test]
fn hardlinks_share_data_and_count_references() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let d = fs.mkdir(root, b"d", 0o755, 0, 0).unwrap();
    let f = fs.create(root, b"orig", 0o644, 0, 0).unwrap();
    fs.write(f, 0, b"shared").unwrap();

    fs.link(f, d, b"alias").unwrap();
    assert_eq!(fs.getattr(f).unwrap().nlink, 2);
    assert_eq!(fs.lookup(d, b"alias").unwrap(), f);
    assert_eq!(fs.read(fs.lookup(d, b"alias").unwrap(), 0, 6).unwrap(), b"shared");

    fs.unlink(root, b"orig").unwrap();
    assert_eq!(fs.getattr(f).unwrap().nlink, 1);
    assert_eq!(fs.read(f, 0, 6).unwrap(), b"shared");
    fs.unlink(d, b"alias").unwrap();
    assert!(matches!(fs.getattr(f), Err(FsError::NotFound)));
    fs.fsck().unwrap();
}

#[test]
fn unlinked_open_files_survive_until_release() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let f = fs.create(root, b"held", 0o644, 0, 0).unwrap();
    fs.write(f, 0, b"still here").unwrap();

    fs.open(f).unwrap();
    fs.unlink(root, b"held").unwrap();
    // Gone from the namespace, alive through the handle.
    assert!(matches!(fs.lookup(root, b"held"), Err(FsError::NotFound)));
    assert_eq!(fs.read(f, 0, 10).unwrap(), b"still here");
    fs.release(f).unwrap();
    assert!(matches!(fs.getattr(f), Err(FsError::NotFound)));
    fs.fsck().unwrap();
}

#[test]
fn symlinks_roundtrip_their_target() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let l = fs.symlink(root, b"lnk", b"/a/b/target", 0, 0).unwrap();
    assert_eq!(fs.readlink(l).unwrap(), b"/a/b/target");
    assert_eq!(fs.getattr(l).unwrap().mode & libc::S_IFMT, libc::S_IFLNK);

    fs.unmount().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let l = fs.lookup(root, b"lnk").unwrap();
    assert_eq!(fs.readlink(l).unwrap(), b"/a/b/target");
}

#[test]
fn resolve_walks_dot_and_dotdot() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let a = fs.mkdir(root, b"a", 0o755, 0, 0).unwrap();
    let b = fs.mkdir(a, b"b", 0o755, 0, 0).unwrap();
    let f = fs.create(b, b"f", 0o644, 0, 0).unwrap();

    assert_eq!(fs.resolve(b"/a/b/f").unwrap(), f);
    assert_eq!(fs.resolve(b"/a/./b/../b/f").unwrap(), f);
    assert_eq!(fs.resolve(b"/..").unwrap(), root);
    assert!(matches!(fs.resolve(b"/a/b/f/x"), Err(FsError::NotDir)));
    assert!(matches!(fs.resolve(b"/nope"), Err(FsError::NotFound)));
}

#[test]
fn truncate_shrinks_and_zero_extends() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let f = fs.create(root, b"t", 0o644, 0, 0).unwrap();
    fs.write(f, 0, &vec![b'z'; 6000]).unwrap();

    fs.truncate(f, 100).unwrap();
    assert_eq!(fs.getattr(f).unwrap().size, 100);
    assert_eq!(fs.read(f, 0, 200).unwrap(), vec![b'z'; 100]);

    // Growing again reads zeros past the old tail.
    fs.truncate(f, 300).unwrap();
    let bytes = fs.read(f, 0, 300).unwrap();
    assert_eq!(&bytes[..100], &vec![b'z'; 100][..]);
    assert!(bytes[100..].iter().all(|&b| b == 0));
    fs.fsck().unwrap();
}

#[test]
fn setattr_changes_what_the_mask_names() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let f = fs.create(root, b"m", 0o644, 10, 10).unwrap();
    let attr = fs
        .setattr(
            f,
            Setattr { mode: Some(0o600), uid: Some(42), ..Setattr::default() },
        )
        .unwrap();
    assert_eq!(attr.mode & 0o7777, 0o600);
    assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFREG);
    assert_eq!(attr.uid, 42);
    assert_eq!(attr.gid, 10);
}

#[test]
fn directory_spill_boundary_survives_a_remount() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let d = fs.mkdir(root, b"big", 0o755, 0, 0).unwrap();
    // Past the inline fan-out and into a spill chunk.
    for i in 0..24 {
        fs.create(d, format!("c{i:02}").as_bytes(), 0o644, 0, 0).unwrap();
    }
    fs.unmount().unwrap();

    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let d = fs.lookup(root, b"big").unwrap();
    let (entries, _) = fs.readdir(d, 0).unwrap();
    assert_eq!(entries.len() - 2, 24);
    for i in 0..24 {
        fs.unlink(d, format!("c{i:02}").as_bytes()).unwrap();
    }
    assert_eq!(fs.readdir(d, 0).unwrap().0.len(), 2);
    fs.fsck().unwrap();
}

#[test]
fn xattrs_roundtrip_and_persist() {
    use razorfs::{Namespace, XattrFlags};
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let f = fs.create(root, b"x", 0o644, 0, 0).unwrap();

    fs.xattr_set(f, Namespace::User, b"color", b"red", XattrFlags::empty()).unwrap();
    fs.xattr_set(f, Namespace::Security, b"label", b"s0", XattrFlags::CREATE).unwrap();
    assert!(matches!(
        fs.xattr_set(f, Namespace::User, b"color", b"blue", XattrFlags::CREATE),
        Err(FsError::Exists)
    ));
    fs.xattr_set(f, Namespace::User, b"color", b"blue", XattrFlags::REPLACE).unwrap();
    assert_eq!(fs.xattr_get(f, Namespace::User, b"color").unwrap(), b"blue");

    fs.unmount().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let f = fs.lookup(root, b"x").unwrap();
    assert_eq!(fs.xattr_get(f, Namespace::User, b"color").unwrap(), b"blue");
    assert_eq!(fs.xattr_get(f, Namespace::Security, b"label").unwrap(), b"s0");
    assert_eq!(fs.xattr_list(f).unwrap().len(), 2);
    fs.xattr_remove(f, Namespace::User, b"color").unwrap();
    assert!(matches!(
        fs.xattr_get(f, Namespace::User, b"color"),
        Err(FsError::NotFound)
    ));
}

#[test]
fn rebalance_under_load_keeps_the_tree_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(&dir);
    cfg.rebalance_interval = 25;
    let _ = env_logger::builder().is_test(true).try_init();
    let fs = RazorFs::mount(cfg).unwrap();
    let root = fs.resolve(b"/").unwrap();

    let d1 = fs.mkdir(root, b"d1", 0o755, 0, 0).unwrap();
    let d2 = fs.mkdir(d1, b"d2", 0o755, 0, 0).unwrap();
    for i in 0..60 {
        let parent = if i % 3 == 0 { root } else if i % 3 == 1 { d1 } else { d2 };
        fs.create(parent, format!("f{i:03}").as_bytes(), 0o644, 0, 0).unwrap();
    }
    for i in (0..60).step_by(2) {
        let parent = if i % 3 == 0 { root } else if i % 3 == 1 { d1 } else { d2 };
        fs.unlink(parent, format!("f{i:03}").as_bytes()).unwrap();
    }
    fs.fsck().unwrap();

    // Note: inode numbers are stable across re-layouts.
    let deep = fs.resolve(b"/d1/d2").unwrap();
    assert_eq!(deep, fs.lookup(d1, b"d2").unwrap());
    fs.unmount().unwrap();

    let fs = mount(&dir);
    fs.fsck().unwrap();
    assert!(fs.resolve(b"/d1/d2").is_ok());
}

#[test]
fn statfs_reports_usage() {
    let dir = tempfile::tempdir().unwrap();
    let fs = mount(&dir);
    let root = fs.resolve(b"/").unwrap();
    let before = fs.statfs();
    let f = fs.create(root, b"f", 0o644, 0, 0).unwrap();
    fs.write(f, 0, &vec![7u8; 9000]).unwrap();
    let after = fs.statfs();
    assert_eq!(after.nodes_used, before.nodes_used + 1);
    assert_eq!(after.blocks_used, before.blocks_used + 3);
    assert!(after.strings_used >= before.strings_used);
}
