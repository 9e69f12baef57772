use std::io;
use std::path::Path;

/// Reports free space on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the OS through `fs2` (`statvfs` / `GetDiskFreeSpaceEx`).
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeSpaceProbe;

impl SpaceProbe for VolumeSpaceProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Always reports the same amount; for tests and simulations.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl SpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_probe_reports_space_for_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let available = VolumeSpaceProbe.available_bytes(dir.path()).unwrap();
        assert!(available > 0);
    }

    #[test]
    fn fixed_probe_ignores_path() {
        assert_eq!(FixedSpaceProbe(7).available_bytes(Path::new("/nowhere")).unwrap(), 7);
    }
}
