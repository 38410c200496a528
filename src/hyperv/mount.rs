//! Scoped disk mounts
//!
//! A mounted disk is dismounted when its guard drops, on success and on every
//! error path. The process-wide registry rejects a second mount of a disk that
//! is still held.

use super::Hypervisor;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

static MOUNTED: Mutex<Vec<PathBuf>> = parking_lot::const_mutex(Vec::new());

pub struct MountedDisk<'a> {
    hypervisor: &'a dyn Hypervisor,
    disk: PathBuf,
    root: PathBuf,
}

impl<'a> MountedDisk<'a> {
    pub fn mount(hypervisor: &'a dyn Hypervisor, disk: &Path) -> Result<Self> {
        {
            let mut mounted = MOUNTED.lock();
            if mounted.iter().any(|d| d == disk) {
                return Err(Error::ResourceConflict(format!(
                    "disk {} is already mounted",
                    disk.display()
                )));
            }
            mounted.push(disk.to_path_buf());
        }

        match hypervisor.mount_disk(disk) {
            Ok(root) => {
                tracing::debug!(disk = %disk.display(), root = %root.display(), "Mounted disk");
                Ok(Self {
                    hypervisor,
                    disk: disk.to_path_buf(),
                    root,
                })
            }
            Err(e) => {
                release(disk);
                Err(e)
            }
        }
    }

    /// Root directory of the mounted OS volume
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_mounted(disk: &Path) -> bool {
        MOUNTED.lock().iter().any(|d| d == disk)
    }
}

impl Drop for MountedDisk<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.hypervisor.dismount_disk(&self.disk) {
            tracing::error!(disk = %self.disk.display(), error = %e, "Failed to dismount disk");
        } else {
            tracing::debug!(disk = %self.disk.display(), "Dismounted disk");
        }
        release(&self.disk);
    }
}

fn release(disk: &Path) {
    MOUNTED.lock().retain(|d| d != disk);
}
