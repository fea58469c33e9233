//! Mount entry points and teardown.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use fuser::MountOption;
use tracing::info;

use crate::config::MountConfig;
use crate::dispatch::MogFilesystem;
use crate::mount::Mount;
use crate::FsError;

/// Mounts the filesystem and blocks until the kernel session ends.
pub fn mount(config: MountConfig) -> Result<(), FsError> {
    let config = config.normalized();
    config.validate()?;
    let mountpoint = config.mountpoint.clone();
    let options = mount_options(&config);

    let mount = Arc::new(Mount::new_net(config.clone()));
    mount.mark_mounted()?;
    let fs = MogFilesystem::new(Arc::clone(&mount));

    info!(
        mountpoint = %mountpoint.display(),
        domain = config.domain,
        readonly = config.readonly,
        "Mounting"
    );
    fuser::mount2(fs, &mountpoint, &options)
        .map_err(|e| FsError::Io(format!("FUSE mount failed: {e}")))?;

    // The destroy callback already drained the registry; this covers
    // sessions torn down without one.
    mount.shutdown();
    info!(mountpoint = %mountpoint.display(), "Unmounted");
    Ok(())
}

/// Unmounts a mountpoint via fusermount.
pub fn unmount(mountpoint: &Path) -> Result<(), FsError> {
    let output = Command::new("fusermount")
        .arg("-u")
        .arg(mountpoint)
        .output()
        .map_err(|e| FsError::Io(format!("failed to run fusermount: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FsError::Io(format!("fusermount failed: {stderr}")));
    }
    Ok(())
}

fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("mogfs".to_string()),
        MountOption::AutoUnmount,
    ];
    options.push(if config.readonly {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if let Some(raw) = &config.mountopts {
        for opt in raw.split(',').filter(|s| !s.is_empty()) {
            options.push(MountOption::CUSTOM(opt.to_string()));
        }
    }
    options
}
