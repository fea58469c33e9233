//! Directory cache behavior: TTL, targeted invalidation, disablement.

use std::thread;
use std::time::Duration;

use mog_fs::MountConfig;
use mog_tests::MemCluster;

fn config_with_ttl(ttl: Duration) -> MountConfig {
    MountConfig {
        threaded: false,
        dircache_ttl: ttl,
        ..Default::default()
    }
}

#[test]
fn test_listing_is_cached_until_ttl() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/f", b"data");
    let mount = cluster.mount(config_with_ttl(Duration::from_millis(80)));

    mount.readdir("/x").expect("readdir");
    mount.readdir("/x").expect("readdir");
    assert_eq!(cluster.tracker_calls_with("list /x"), 1);

    thread::sleep(Duration::from_millis(120));
    mount.readdir("/x").expect("readdir");
    assert_eq!(cluster.tracker_calls_with("list /x"), 2);
}

#[test]
fn test_cached_listing_matches_fresh_listing() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/a", b"1");
    cluster.add_object("/x/b", b"22");
    let mount = cluster.mount(config_with_ttl(Duration::from_secs(60)));

    let fresh = mount.readdir("/x").expect("fresh");
    let cached = mount.readdir("/x").expect("cached");
    assert_eq!(fresh, cached);
    assert_eq!(cluster.tracker_calls_with("list /x"), 1);
}

#[test]
fn test_unlink_flushes_directory_and_parent() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/f", b"data");
    let mount = cluster.mount(config_with_ttl(Duration::from_secs(60)));

    mount.readdir("/x").expect("readdir");
    mount.readdir("/").expect("readdir");
    assert_eq!(cluster.tracker_calls_with("list"), 2);

    mount.unlink("/x/f").expect("unlink");

    mount.readdir("/x").expect("readdir");
    mount.readdir("/").expect("readdir");
    assert_eq!(cluster.tracker_calls_with("list /x"), 2);
    assert_eq!(cluster.tracker_calls_with("list /"), 4);
}

#[test]
fn test_getattr_rides_the_parent_listing() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/f", b"data");
    let mount = cluster.mount(config_with_ttl(Duration::from_secs(60)));

    mount.getattr("/x/f").expect("getattr");
    mount.getattr("/x/f").expect("getattr");
    assert_eq!(cluster.tracker_calls_with("list /x"), 1);
}

#[test]
fn test_disabled_cache_queries_every_time() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/f", b"data");
    let mount = cluster.mount(MountConfig {
        threaded: false,
        dircache: false,
        ..Default::default()
    });

    mount.readdir("/x").expect("readdir");
    mount.readdir("/x").expect("readdir");
    assert_eq!(cluster.tracker_calls_with("list /x"), 2);
}

#[test]
fn test_commit_flushes_the_handles_directory() {
    let cluster = MemCluster::new();
    cluster.add_object("/x/old", b"data");
    let mount = cluster.mount(config_with_ttl(Duration::from_secs(60)));

    // Warm the cache, then commit a new file into the same directory.
    mount.readdir("/x").expect("readdir");
    assert_eq!(cluster.tracker_calls_with("list /x"), 1);

    let handle = mount
        .open("/x/new", mog_fs::OpenMode::WRITE_ONLY, false)
        .expect("open");
    handle.write(0, b"fresh").expect("write");
    mount.release(handle.id()).expect("release");

    let names: Vec<String> = mount
        .readdir("/x")
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(cluster.tracker_calls_with("list /x"), 2);
    assert!(names.contains(&"new".to_string()));
    assert!(names.contains(&"old".to_string()));
}
