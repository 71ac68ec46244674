//! Rootfs mount application and rollback.
//!
//! Mounts are applied in list order onto `bundle/rootfs`. If anything after
//! the first mount fails, [`RollbackGuard`] unmounts everything stacked on the
//! target when it goes out of scope.

use gvshim_shared::api::Mount;
use gvshim_shared::errors::{ShimError, ShimResult};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use std::path::Path;

/// Applies mount specs to a target path.
pub trait Mounter: Send + Sync {
    /// Mount `mount` onto `target`.
    fn mount(&self, mount: &Mount, target: &Path) -> ShimResult<()>;

    /// Unmount every mount stacked on `target`.
    fn unmount_all(&self, target: &Path) -> ShimResult<()>;
}

/// Apply `mounts` in order. Stops at the first failure.
pub fn mount_all(mounter: &dyn Mounter, mounts: &[Mount], target: &Path) -> ShimResult<()> {
    for (index, m) in mounts.iter().enumerate() {
        mounter.mount(m, target).map_err(|e| {
            e.context(format!(
                "failed to mount rootfs component {} ({} {})",
                index, m.kind, m.source
            ))
        })?;
        tracing::debug!(
            target = %target.display(),
            kind = %m.kind,
            source = %m.source,
            "rootfs component mounted"
        );
    }
    Ok(())
}

/// Unmounts the target on drop unless disarmed.
pub struct RollbackGuard<'a> {
    mounter: &'a dyn Mounter,
    target: &'a Path,
    armed: bool,
}

impl<'a> RollbackGuard<'a> {
    pub fn new(mounter: &'a dyn Mounter, target: &'a Path) -> Self {
        Self {
            mounter,
            target,
            armed: true,
        }
    }

    /// Keep the mounts.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.mounter.unmount_all(self.target) {
            tracing::warn!(
                target = %self.target.display(),
                error = %e,
                "Failed to cleanup rootfs mount"
            );
        }
    }
}

/// Mounter backed by mount(2).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, mount: &Mount, target: &Path) -> ShimResult<()> {
        let options = MountOptions::parse(&mount.options);
        let data = (!options.data.is_empty()).then(|| options.data.join(","));

        nix::mount::mount(
            Some(mount.source.as_str()),
            target,
            Some(mount.kind.as_str()),
            options.flags,
            data.as_deref(),
        )
        .map_err(|e| ShimError::Mount(format!("mount {} on {}: {}", mount.source, target.display(), e)))?;

        // Bind mounts ignore most flags on the first pass.
        let remount_flags = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
        if options.flags.contains(MsFlags::MS_BIND) && options.flags.intersects(remount_flags) {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                options.flags | MsFlags::MS_REMOUNT,
                None::<&str>,
            )
            .map_err(|e| ShimError::Mount(format!("remount {}: {}", target.display(), e)))?;
        }

        if !options.propagation.is_empty() {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                options.propagation,
                None::<&str>,
            )
            .map_err(|e| {
                ShimError::Mount(format!("set propagation on {}: {}", target.display(), e))
            })?;
        }

        Ok(())
    }

    fn unmount_all(&self, target: &Path) -> ShimResult<()> {
        loop {
            match nix::mount::umount2(target, MntFlags::empty()) {
                Ok(()) => continue,
                // Nothing (left) mounted there.
                Err(Errno::EINVAL) | Err(Errno::ENOENT) => return Ok(()),
                Err(Errno::EBUSY) => {
                    return nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(|e| {
                        ShimError::Mount(format!("detach {}: {}", target.display(), e))
                    });
                }
                Err(e) => {
                    return Err(ShimError::Mount(format!(
                        "unmount {}: {}",
                        target.display(),
                        e
                    )))
                }
            }
        }
    }
}

/// Mount options split into mount(2) flags, propagation flags and fs data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountOptions {
    pub flags: MsFlags,
    pub propagation: MsFlags,
    pub data: Vec<String>,
}

impl MountOptions {
    pub fn parse(options: &[String]) -> Self {
        let mut flags = MsFlags::empty();
        let mut propagation = MsFlags::empty();
        let mut data = Vec::new();

        for option in options {
            match option.as_str() {
                "defaults" => {}
                "ro" => flags.insert(MsFlags::MS_RDONLY),
                "rw" => flags.remove(MsFlags::MS_RDONLY),
                "bind" => flags.insert(MsFlags::MS_BIND),
                "rbind" => flags.insert(MsFlags::MS_BIND | MsFlags::MS_REC),
                "remount" => flags.insert(MsFlags::MS_REMOUNT),
                "nosuid" => flags.insert(MsFlags::MS_NOSUID),
                "suid" => flags.remove(MsFlags::MS_NOSUID),
                "nodev" => flags.insert(MsFlags::MS_NODEV),
                "dev" => flags.remove(MsFlags::MS_NODEV),
                "noexec" => flags.insert(MsFlags::MS_NOEXEC),
                "exec" => flags.remove(MsFlags::MS_NOEXEC),
                "sync" => flags.insert(MsFlags::MS_SYNCHRONOUS),
                "async" => flags.remove(MsFlags::MS_SYNCHRONOUS),
                "dirsync" => flags.insert(MsFlags::MS_DIRSYNC),
                "mand" => flags.insert(MsFlags::MS_MANDLOCK),
                "nomand" => flags.remove(MsFlags::MS_MANDLOCK),
                "noatime" => flags.insert(MsFlags::MS_NOATIME),
                "atime" => flags.remove(MsFlags::MS_NOATIME),
                "nodiratime" => flags.insert(MsFlags::MS_NODIRATIME),
                "diratime" => flags.remove(MsFlags::MS_NODIRATIME),
                "relatime" => flags.insert(MsFlags::MS_RELATIME),
                "norelatime" => flags.remove(MsFlags::MS_RELATIME),
                "strictatime" => flags.insert(MsFlags::MS_STRICTATIME),
                "nostrictatime" => flags.remove(MsFlags::MS_STRICTATIME),
                "private" => propagation.insert(MsFlags::MS_PRIVATE),
                "rprivate" => propagation.insert(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
                "shared" => propagation.insert(MsFlags::MS_SHARED),
                "rshared" => propagation.insert(MsFlags::MS_SHARED | MsFlags::MS_REC),
                "slave" => propagation.insert(MsFlags::MS_SLAVE),
                "rslave" => propagation.insert(MsFlags::MS_SLAVE | MsFlags::MS_REC),
                other => data.push(other.to_string()),
            }
        }

        Self {
            flags,
            propagation,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_overlay_options_become_data() {
        let parsed = MountOptions::parse(&opts(&[
            "index=off",
            "workdir=/w",
            "upperdir=/u",
            "lowerdir=/l1:/l2",
        ]));
        assert!(parsed.flags.is_empty());
        assert!(parsed.propagation.is_empty());
        assert_eq!(
            parsed.data,
            opts(&["index=off", "workdir=/w", "upperdir=/u", "lowerdir=/l1:/l2"])
        );
    }

    #[test]
    fn test_flag_options() {
        let parsed = MountOptions::parse(&opts(&["rbind", "ro", "nosuid", "rprivate"]));
        assert!(parsed.flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC));
        assert!(parsed.flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_NOSUID));
        assert_eq!(parsed.propagation, MsFlags::MS_PRIVATE | MsFlags::MS_REC);
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_later_option_overrides_earlier() {
        let parsed = MountOptions::parse(&opts(&["ro", "rw"]));
        assert!(!parsed.flags.contains(MsFlags::MS_RDONLY));
    }

    /// Records mounts per target and can fail the nth mount.
    #[derive(Default)]
    struct RecordingMounter {
        mounted: Mutex<Vec<(PathBuf, String)>>,
        fail_at: Option<usize>,
    }

    impl Mounter for RecordingMounter {
        fn mount(&self, mount: &Mount, target: &Path) -> ShimResult<()> {
            let mut mounted = self.mounted.lock();
            if Some(mounted.len()) == self.fail_at {
                return Err(ShimError::Mount("EPERM".into()));
            }
            mounted.push((target.to_path_buf(), mount.source.clone()));
            Ok(())
        }

        fn unmount_all(&self, target: &Path) -> ShimResult<()> {
            self.mounted.lock().retain(|(t, _)| t != target);
            Ok(())
        }
    }

    fn bind(source: &str) -> Mount {
        Mount {
            kind: "bind".into(),
            source: source.into(),
            target: String::new(),
            options: opts(&["rbind"]),
        }
    }

    #[test]
    fn test_mount_all_stops_at_first_failure() {
        let mounter = RecordingMounter {
            fail_at: Some(1),
            ..Default::default()
        };
        let target = PathBuf::from("/b/rootfs");
        let err = mount_all(&mounter, &[bind("/a"), bind("/b"), bind("/c")], &target).unwrap_err();
        assert!(matches!(err, ShimError::Mount(_)));
        assert!(err.to_string().contains("rootfs component 1"));
        assert_eq!(mounter.mounted.lock().len(), 1);
    }

    #[test]
    fn test_armed_guard_rolls_back() {
        let mounter = RecordingMounter::default();
        let target = PathBuf::from("/b/rootfs");
        {
            let _guard = RollbackGuard::new(&mounter, &target);
            mount_all(&mounter, &[bind("/a"), bind("/b")], &target).unwrap();
        }
        assert!(mounter.mounted.lock().is_empty());
    }

    #[test]
    fn test_disarmed_guard_keeps_mounts() {
        let mounter = RecordingMounter::default();
        let target = PathBuf::from("/b/rootfs");
        let guard = RollbackGuard::new(&mounter, &target);
        mount_all(&mounter, &[bind("/a")], &target).unwrap();
        guard.disarm();
        assert_eq!(mounter.mounted.lock().len(), 1);
    }
}
