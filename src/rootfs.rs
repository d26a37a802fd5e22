use anyhow::{Context, Result};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, pivot_root};
use std::fs;
use std::path::Path;

const OLD_ROOT: &str = ".pivot_root";

/// Make `rootfs` the root of the current mount namespace and give it a fresh /proc.
///
/// Runs inside the container's init, after the host has written the id maps.
pub fn enter_rootfs(rootfs: &Path) -> Result<()> {
    let rootfs = fs::canonicalize(rootfs).with_context(|| format!("resolving rootfs {:?}", rootfs))?;

    // Keep our mounts from propagating back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("making / private")?;

    // pivot_root needs the new root to be a mount point.
    mount(
        Some(&rootfs),
        &rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("bind mounting rootfs")?;

    let old_root = rootfs.join(OLD_ROOT);
    fs::create_dir_all(&old_root)?;
    pivot_root(&rootfs, &old_root).context("pivot_root")?;
    chdir("/")?;

    let old_root = Path::new("/").join(OLD_ROOT);
    umount2(&old_root, MntFlags::MNT_DETACH).context("detaching old root")?;
    fs::remove_dir(&old_root)?;

    fs::create_dir_all("/proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("mounting /proc")?;

    Ok(())
}
