use std::path::Path;

use sysinfo::Disks;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reports free space on the filesystem that holds a path.
pub trait DiskProbe: Send + Sync {
    /// Free bytes available to unprivileged users on the filesystem holding `path`, or `None`
    /// when no mounted filesystem contains it.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Reads mounted filesystems through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskProbe;

/// Reports the same free space for every path.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskProbe(pub Option<u64>);

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl DiskProbe for SysinfoDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();

        // The deepest mount point containing the path owns it.
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
    }
}

impl DiskProbe for FixedDiskProbe {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
