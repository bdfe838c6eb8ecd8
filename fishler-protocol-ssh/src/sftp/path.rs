use std::path::{Path, PathBuf};

use fishler_common::sandbox_home;
use uuid::Uuid;

/// A request path that escapes the overlay. Reported as "no such file" so
/// the namespace outside the home simply does not appear to exist.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("path escapes the session namespace")]
pub struct PathOutsideNamespace;

/// Maps in-sandbox request paths onto the per-user overlay on the host.
///
/// Requests arrive relative to the in-sandbox home (`/home/<user>` or
/// `/root`); the translation is purely lexical, so no sequence of `..`,
/// duplicate slashes or crafted names can reach outside the mountpoint or
/// the trash root.
pub struct PathTranslator {
    home: String,
    mountpoint: String,
    trash_root: PathBuf,
}

impl PathTranslator {
    pub fn new(username: &str, mountpoint: &Path, mirror: &Path) -> Self {
        Self {
            home: sandbox_home(username),
            mountpoint: clean(&mountpoint.to_string_lossy()),
            trash_root: mirror.join("trash"),
        }
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn mountpoint(&self) -> PathBuf {
        PathBuf::from(&self.mountpoint)
    }

    /// Canonical in-sandbox form of a request path; relative paths hang off
    /// the home directory.
    pub fn canonical_virtual(&self, request: &str) -> String {
        if request.starts_with('/') {
            clean(request)
        } else {
            clean(&format!("{}/{}", self.home, request))
        }
    }

    /// Host path for a request. Fails unless the result stays under the
    /// mountpoint.
    pub fn to_host(&self, request: &str) -> Result<PathBuf, PathOutsideNamespace> {
        let virtual_path = self.canonical_virtual(request);
        let replaced = virtual_path.replace(&self.home, &self.mountpoint);
        let host = clean(&replaced);

        if host == self.mountpoint || host.starts_with(&format!("{}/", self.mountpoint)) {
            Ok(PathBuf::from(host))
        } else {
            Err(PathOutsideNamespace)
        }
    }

    /// Tombstone location for a deleted path: a fresh UUID directory under
    /// the mirror's trash subtree, keyed per deletion so names never collide.
    pub fn to_trash(&self, request: &str) -> Result<PathBuf, PathOutsideNamespace> {
        let virtual_path = self.canonical_virtual(request);
        let name = virtual_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or(PathOutsideNamespace)?;
        Ok(self.trash_root.join(Uuid::new_v4().to_string()).join(name))
    }

    /// Host path mapped back into the sandbox namespace, for readlink
    /// results; paths outside the overlay are passed through untouched.
    pub fn to_virtual(&self, host: &Path) -> String {
        let host = host.to_string_lossy();
        match host.strip_prefix(&self.mountpoint) {
            Some(rest) if rest.is_empty() => self.home.clone(),
            Some(rest) => format!("{}{}", self.home, rest),
            None => host.into_owned(),
        }
    }
}

/// Lexical path normalization: collapses duplicate slashes and `.`, resolves
/// `..` without touching the filesystem.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            part => parts.push(part),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_owned()
    } else {
        joined
    }
}

/// Recursive size of a directory tree in bytes; symlinks are not followed.
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.path().symlink_metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new(
            "bob",
            Path::new("/var/log/fishler/fishyfs/bob/mount"),
            Path::new("/var/log/fishler/fishyfs/bob/mirror"),
        )
    }

    #[test]
    fn clean_normalizes() {
        assert_eq!(clean("/home/bob//x/./y"), "/home/bob/x/y");
        assert_eq!(clean("/home/bob/../bob/z"), "/home/bob/z");
        assert_eq!(clean("/../etc"), "/etc");
        assert_eq!(clean(""), ".");
        assert_eq!(clean("a/../../b"), "../b");
    }

    #[test]
    fn maps_home_onto_mountpoint() {
        let t = translator();
        assert_eq!(
            t.to_host("/home/bob/secret.txt").unwrap(),
            PathBuf::from("/var/log/fishler/fishyfs/bob/mount/secret.txt")
        );
        assert_eq!(
            t.to_host("notes/todo.md").unwrap(),
            PathBuf::from("/var/log/fishler/fishyfs/bob/mount/notes/todo.md")
        );
        assert_eq!(t.to_host("/home/bob").unwrap(), t.mountpoint());
    }

    #[test]
    fn contains_traversal_attempts() {
        let t = translator();
        assert!(t.to_host("/home/bob/../alice/x").is_err());
        assert!(t.to_host("/home/bob/../../etc/passwd").is_err());
        assert!(t.to_host("../../../etc/shadow").is_err());
        assert!(t.to_host("/etc/passwd").is_err());
        assert!(t.to_host("/home/bob/a/b/../../../..").is_err());
        // duplicate slashes cannot smuggle a path out
        assert!(t.to_host("//etc//passwd").is_err());
    }

    #[test]
    fn root_user_home_is_slash_root() {
        let t = PathTranslator::new("root", Path::new("/base/root/mount"), Path::new("/base/root/mirror"));
        assert_eq!(
            t.to_host("/root/.ssh/authorized_keys").unwrap(),
            PathBuf::from("/base/root/mount/.ssh/authorized_keys")
        );
        assert!(t.to_host("/home/root/x").is_err());
    }

    #[test]
    fn trash_paths_stay_under_trash_root() {
        let t = translator();
        for request in ["/home/bob/secret.txt", "x/../y.txt", "/home/bob/../bob/z"] {
            let q = t.to_trash(request).unwrap();
            assert!(q.starts_with("/var/log/fishler/fishyfs/bob/mirror/trash"));
        }
        // fresh identifier per deletion
        let a = t.to_trash("/home/bob/f").unwrap();
        let b = t.to_trash("/home/bob/f").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn virtual_round_trip() {
        let t = translator();
        let host = t.to_host("/home/bob/d/file").unwrap();
        assert_eq!(t.to_virtual(&host), "/home/bob/d/file");
    }

    #[test]
    fn sizes_directories_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()).unwrap(), 150);
    }
}
