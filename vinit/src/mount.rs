use nix::mount::{mount, MsFlags};
use nix::unistd::chroot;
use std::path::Path;

/// Mounts the pseudo-filesystems a Linux userspace expects before anything
/// else runs: `/proc`, `/sys`, `/dev`. Grounded in the teacher's `vinit`
/// startup sequence, trimmed to the three mounts this spec actually needs.
pub fn mount_essential() -> anyhow::Result<()> {
    let flags = MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;

    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        flags | MsFlags::MS_RELATIME,
        None::<&str>,
    )?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        flags | MsFlags::MS_RELATIME,
        None::<&str>,
    )?;
    mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_RELATIME,
        Some("mode=0755"),
    )?;

    Ok(())
}

/// chroots into the container root mounted at `root` by the host's virtio-fs
/// device, then chdirs to `/` inside the new root.
pub fn chroot_into(root: impl AsRef<Path>) -> anyhow::Result<()> {
    chroot(root.as_ref())?;
    std::env::set_current_dir("/")?;
    Ok(())
}
