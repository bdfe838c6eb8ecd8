use std::io;
use std::path::Path;

/// Contract between the overlay manager and whatever actually materializes a
/// per-user view: mount a writable view at `mountpoint` backed by `mirror`,
/// and tear it down again. A FUSE-based overlay plugs in here; the manager
/// only depends on this interface.
pub trait OverlayBackend: Send + Sync + 'static {
    fn mount(&self, mountpoint: &Path, mirror: &Path) -> io::Result<()>;
    fn unmount(&self, mountpoint: &Path) -> io::Result<()>;
}

/// Stand-in backend that keeps the session-visible bytes directly in the
/// mountpoint directory, with the trash subtree under the sibling mirror
/// directory. Mount and unmount reduce to directory lifecycle, which keeps
/// renames between the mountpoint and the trash on one filesystem.
pub struct DirectoryBackend;

impl OverlayBackend for DirectoryBackend {
    fn mount(&self, _mountpoint: &Path, _mirror: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unmount(&self, _mountpoint: &Path) -> io::Result<()> {
        Ok(())
    }
}
