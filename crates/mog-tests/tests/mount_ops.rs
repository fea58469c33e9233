//! Mount-level operation tests: namespace, attributes, devices, xattrs.

use std::sync::Arc;
use std::thread;

use mog_fs::mount::{XATTR_CHECKSUM, XATTR_CLASS};
use mog_fs::{FsError, MountConfig, OpenMode};
use mog_tests::MemCluster;

fn config() -> MountConfig {
    MountConfig {
        threaded: false,
        ..Default::default()
    }
}

#[test]
fn test_getattr_files_directories_and_root() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/f", b"twelve bytes");

    let mount = cluster.mount(config());
    let root = mount.getattr("/").expect("root");
    assert!(root.is_dir);

    let dir = mount.getattr("/x").expect("dir");
    assert!(dir.is_dir);

    let file = mount.getattr("/x/f").expect("file");
    assert!(!file.is_dir);
    assert_eq!(file.size, 12);
    assert_eq!(file.mtime, Some(1700000000));

    assert!(matches!(mount.getattr("/missing"), Err(FsError::NotFound)));
}

#[test]
fn test_readdir_lists_files_and_directories() {
    let cluster = MemCluster::new();
    cluster.add_object("/a", b"1");
    cluster.add_object("/x/f", b"22");

    let mount = cluster.mount(config());
    let entries = mount.readdir("/").expect("readdir");
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "x"]);
    assert!(!entries[0].is_directory);
    assert!(entries[1].is_directory);

    let sub = mount.readdir("/x").expect("readdir");
    assert_eq!(sub.len(), 1);
    assert_eq!(sub[0].name, "f");
}

#[test]
fn test_rename_roundtrip_restores_state() {
    let cluster = MemCluster::new();
    cluster.add_object("/a", b"payload");

    let mount = cluster.mount(config());
    mount.rename("/a", "/b").expect("rename");
    assert!(matches!(mount.getattr("/a"), Err(FsError::NotFound)));
    assert_eq!(mount.getattr("/b").expect("moved").size, 7);

    mount.rename("/b", "/a").expect("rename back");
    assert_eq!(mount.getattr("/a").expect("restored").size, 7);
    assert!(matches!(mount.getattr("/b"), Err(FsError::NotFound)));
}

#[test]
fn test_rename_onto_existing_key_is_exists() {
    let cluster = MemCluster::new();
    cluster.add_object("/src", b"1");
    cluster.add_object("/dst", b"2");

    let mount = cluster.mount(config());
    assert!(matches!(mount.rename("/src", "/dst"), Err(FsError::Exists)));
}

#[test]
fn test_unlink() {
    let cluster = MemCluster::new();
    cluster.add_object("/gone", b"bytes");

    let mount = cluster.mount(config());
    mount.unlink("/gone").expect("unlink");
    assert!(matches!(mount.getattr("/gone"), Err(FsError::NotFound)));
    assert!(matches!(mount.unlink("/gone"), Err(FsError::NotFound)));
}

#[test]
fn test_mkdir_leaves_directory_without_probe() {
    let cluster = MemCluster::new();
    let mount = cluster.mount(config());

    mount.mkdir("/newdir").expect("mkdir");
    assert!(cluster.has_dir("/newdir"));
    assert!(mount.getattr("/newdir").expect("getattr").is_dir);
    assert!(mount.readdir("/newdir").expect("readdir").is_empty());
    assert_eq!(cluster.tracker_calls_with("delete /newdir/.mogfs-mkdir-"), 1);
}

#[test]
fn test_statfs_counts_only_writeable_free_space() {
    let cluster = MemCluster::new();
    let mount = cluster.mount(config());

    let stat = mount.statfs().expect("statfs");
    // Devices: 200 + 1000 + 100 MiB total; only dev1 (alive+writeable)
    // contributes free space.
    assert_eq!(stat.blocks, 1300);
    assert_eq!(stat.bfree, 100);
    assert_eq!(stat.bavail, 100);
    assert_eq!(stat.bsize, 1024 * 1024);
    assert_eq!(stat.namelen, 255);
}

#[test]
fn test_xattr_roundtrip() {
    let cluster = MemCluster::new();
    cluster.add_object("/f", b"data");

    let mount = cluster.mount(config());
    mount.setxattr("/f", XATTR_CLASS, b"hot").expect("setxattr");
    assert_eq!(cluster.object_class("/f").as_deref(), Some("hot"));
    assert_eq!(mount.getxattr("/f", XATTR_CLASS).expect("getxattr"), b"hot");

    // No checksum recorded: empty value, not an error.
    assert_eq!(mount.getxattr("/f", XATTR_CHECKSUM).expect("getxattr"), b"");

    assert!(matches!(
        mount.getxattr("/f", "user.unknown"),
        Err(FsError::Unsupported)
    ));
    assert!(matches!(
        mount.setxattr("/f", XATTR_CHECKSUM, b"nope"),
        Err(FsError::Unsupported)
    ));
    assert_eq!(mount.listxattr(), &[XATTR_CHECKSUM, XATTR_CLASS]);
}

#[test]
fn test_readonly_mount_refuses_mutations_without_tracker_calls() {
    let cluster = MemCluster::new();
    cluster.add_object("/x", b"bytes");

    let mount = cluster.mount(MountConfig {
        threaded: false,
        readonly: true,
        ..Default::default()
    });
    cluster.clear_calls();

    assert!(matches!(mount.unlink("/x"), Err(FsError::Access)));
    assert!(matches!(mount.rename("/x", "/y"), Err(FsError::Access)));
    assert!(matches!(mount.mkdir("/d"), Err(FsError::Access)));
    assert!(matches!(mount.truncate_path("/x", 0), Err(FsError::Access)));
    assert!(matches!(
        mount.setxattr("/x", XATTR_CLASS, b"hot"),
        Err(FsError::Access)
    ));
    assert!(matches!(
        mount.open("/x", OpenMode::WRITE_ONLY, false),
        Err(FsError::Access)
    ));
    assert_eq!(cluster.tracker_calls_with("delete"), 0);
    assert_eq!(cluster.tracker_calls_with("rename"), 0);
    assert_eq!(cluster.tracker_calls_with("create_open"), 0);
    assert_eq!(cluster.tracker_calls_with("update_class"), 0);

    // Reads still work.
    let handle = mount.open("/x", OpenMode::READ_ONLY, false).expect("open");
    assert_eq!(&handle.read(0, 5).expect("read")[..], b"bytes");
}

#[test]
fn test_concurrent_opens_get_distinct_registered_handles() {
    let cluster = MemCluster::new();
    cluster.add_object("/c", b"shared");

    let mount = Arc::new(cluster.mount(config()));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let mount = Arc::clone(&mount);
            thread::spawn(move || {
                mount
                    .open("/c", OpenMode::READ_ONLY, false)
                    .map(|handle| handle.id())
            })
        })
        .collect();
    let ids: Vec<u64> = workers
        .into_iter()
        .map(|worker| worker.join().expect("join").expect("open"))
        .collect();

    assert_ne!(ids[0], ids[1]);
    assert_eq!(mount.open_handles(), 2);
    assert!(mount.handle(ids[0]).is_some());
    assert!(mount.handle(ids[1]).is_some());
}

#[test]
fn test_create_excl_on_existing_key() {
    let cluster = MemCluster::new();
    cluster.add_object("/e", b"old");

    let mount = cluster.mount(config());
    assert!(matches!(
        mount.create("/e", OpenMode::READ_WRITE, true),
        Err(FsError::Exists)
    ));
    assert!(matches!(
        mount.open("/e", OpenMode::WRITE_ONLY, true),
        Err(FsError::Exists)
    ));
}

#[test]
fn test_create_materializes_then_opens() {
    let cluster = MemCluster::new();
    let mount = cluster.mount(config());

    let handle = mount.create("/n", OpenMode::WRITE_ONLY, false).expect("create");
    assert_eq!(cluster.object_size("/n"), Some(0));

    handle.write(0, b"fresh").expect("write");
    mount.release(handle.id()).expect("release");
    assert_eq!(cluster.object("/n").as_deref(), Some(&b"fresh"[..]));
}

#[test]
fn test_truncate_path_commits_new_size() {
    let cluster = MemCluster::new();
    cluster.add_object("/t", b"0123456789");

    let mount = cluster.mount(config());
    mount.truncate_path("/t", 4).expect("truncate");
    assert_eq!(cluster.object("/t").as_deref(), Some(&b"0123"[..]));
    assert_eq!(cluster.object_size("/t"), Some(4));
}
