use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fishler_common::helpers::fs::create_secure_directory;
use fishler_common::SessionId;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::*;

use super::path::{dir_size, PathTranslator};

enum HandleState {
    File {
        file: tokio::fs::File,
        path: PathBuf,
        write: bool,
    },
    Dir {
        entries: VecDeque<File>,
        done: bool,
    },
}

/// One SFTP subsystem session: all request families route through here,
/// translated onto the user's overlay mount. Deletion is routed into the
/// trash mirror, and writes are refused once the overlay exceeds the
/// per-session disk budget.
pub struct SftpSession {
    session_id: SessionId,
    username: String,
    remote_address: SocketAddr,
    paths: PathTranslator,
    disk_limit_mb: u64,
    lock: Arc<Mutex<()>>,
    handles: HashMap<String, HandleState>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(
        session_id: SessionId,
        username: String,
        remote_address: SocketAddr,
        mountpoint: &Path,
        mirror: &Path,
        disk_limit_mb: u64,
    ) -> Self {
        Self {
            session_id,
            paths: PathTranslator::new(&username, mountpoint, mirror),
            username,
            remote_address,
            disk_limit_mb,
            lock: Arc::new(Mutex::new(())),
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn host_path(&self, request: &str) -> Result<PathBuf, StatusCode> {
        self.paths.to_host(request).map_err(|_| {
            warn!(
                session=%self.session_id,
                user=%self.username,
                address=%self.remote_address,
                path=request,
                "sftp path containment violation"
            );
            StatusCode::NoSuchFile
        })
    }

    /// Disk budget check; runs before anything is written.
    fn check_quota(&self) -> Result<(), StatusCode> {
        let size = dir_size(&self.paths.mountpoint()).unwrap_or(0);
        if size / (1024 * 1024) > self.disk_limit_mb {
            warn!(
                session=%self.session_id,
                user=%self.username,
                size,
                limit_mb = self.disk_limit_mb,
                "sftp quota exceeded"
            );
            return Err(StatusCode::Failure);
        }
        Ok(())
    }

    fn take_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }

    fn file_handle_mut(&mut self, handle: &str) -> Result<(&mut tokio::fs::File, PathBuf, bool), StatusCode> {
        match self.handles.get_mut(handle) {
            Some(HandleState::File { file, path, write }) => Ok((file, path.clone(), *write)),
            _ => Err(StatusCode::Failure),
        }
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_owned(),
            language_tag: "en-US".to_owned(),
        }
    }
}

fn io_status(error: &std::io::Error) -> StatusCode {
    match error.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

#[async_trait::async_trait]
impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(session=%self.session_id, version, ?extensions, "sftp session opened");
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        // The start directory reported to the client is the in-sandbox home.
        let resolved = self.paths.canonical_virtual(&path);
        Ok(Name {
            id,
            files: vec![File::dummy(resolved)],
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.host_path(&filename)?;
        let write = pflags.intersects(
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        );

        info!(
            session=%self.session_id,
            user=%self.username,
            path=%filename,
            ?pflags,
            "sftp open"
        );

        let lock = self.lock.clone();
        let _guard = lock.lock().await;

        if write {
            self.check_quota()?;
            if let Some(parent) = path.parent() {
                create_secure_directory(parent).map_err(|e| io_status(&e))?;
            }
            if path.is_dir() {
                return Err(StatusCode::OpUnsupported);
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE));
        let file = options.open(&path).await.map_err(|e| io_status(&e))?;

        let handle = self.take_handle();
        self.handles.insert(
            handle.clone(),
            HandleState::File { file, path, write },
        );
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.handles.remove(&handle);
        Ok(Self::ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let lock = self.lock.clone();
        let _guard = lock.lock().await;

        let (file, _, _) = self.file_handle_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file
                .read(&mut data[filled..])
                .await
                .map_err(|e| io_status(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let lock = self.lock.clone();
        let _guard = lock.lock().await;

        if let Err(refused) = self.check_quota() {
            // Leave no oversized partials behind for the next listing.
            if let Ok((_, path, _)) = self.file_handle_mut(&handle) {
                let _ = std::fs::remove_file(path);
            }
            self.handles.remove(&handle);
            return Err(refused);
        }

        let (file, _, writable) = self.file_handle_mut(&handle)?;
        if !writable {
            return Err(StatusCode::PermissionDenied);
        }
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(&data).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let host = self.host_path(&path)?;
        info!(session=%self.session_id, user=%self.username, path=%path, "sftp list");

        let mut dir = tokio::fs::read_dir(&host).await.map_err(|e| io_status(&e))?;
        let mut entries = VecDeque::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_status(&e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = match entry.metadata().await {
                Ok(metadata) => FileAttributes::from(&metadata),
                Err(_) => FileAttributes::default(),
            };
            entries.push_back(File::new(name, attrs));
        }

        let handle = self.take_handle();
        self.handles.insert(
            handle.clone(),
            HandleState::Dir {
                entries,
                done: false,
            },
        );
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        match self.handles.get_mut(&handle) {
            Some(HandleState::Dir { entries, done }) => {
                if *done || entries.is_empty() {
                    return Err(StatusCode::Eof);
                }
                *done = true;
                Ok(Name {
                    id,
                    files: entries.drain(..).collect(),
                })
            }
            _ => Err(StatusCode::Failure),
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let host = self.host_path(&path)?;
        let metadata = tokio::fs::metadata(&host).await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let host = self.host_path(&path)?;
        let metadata = tokio::fs::symlink_metadata(&host)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let (file, _, _) = self.file_handle_mut(&handle)?;
        let metadata = file.metadata().await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let host = self.host_path(&path)?;
        let lock = self.lock.clone();
        let _guard = lock.lock().await;

        let metadata = tokio::fs::metadata(&host).await.map_err(|e| io_status(&e))?;

        // A zero mode from the client falls back to 0644; directories are
        // always forced to 0755.
        let mut mode = attrs.permissions.unwrap_or(0) & 0o777;
        if mode == 0 {
            mode = 0o644;
        }
        if metadata.is_dir() {
            mode = 0o755;
        }

        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.trash(&filename).await?;
        Ok(Self::ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.trash(&path).await?;
        Ok(Self::ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let host = self.host_path(&path)?;
        let lock = self.lock.clone();
        let _guard = lock.lock().await;
        create_secure_directory(&host).map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.host_path(&oldpath)?;
        let to = self
            .paths
            .to_host(&newpath)
            .map_err(|_| StatusCode::OpUnsupported)?;

        let lock = self.lock.clone();
        let _guard = lock.lock().await;
        tokio::fs::rename(&from, &to).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        let link = self.host_path(&linkpath)?;
        let target = self
            .paths
            .to_host(&targetpath)
            .map_err(|_| StatusCode::OpUnsupported)?;

        let lock = self.lock.clone();
        let _guard = lock.lock().await;
        tokio::fs::symlink(&target, &link)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let host = self.host_path(&path)?;
        let target = tokio::fs::read_link(&host).await.map_err(|e| io_status(&e))?;
        Ok(Name {
            id,
            files: vec![File::dummy(self.paths.to_virtual(&target))],
        })
    }
}

impl SftpSession {
    /// Trash-on-delete: the attacker sees the file disappear; the bytes move
    /// under `<mirror>/trash/<uuid>/` for analyst review.
    async fn trash(&mut self, request: &str) -> Result<(), StatusCode> {
        let source = self.host_path(request)?;
        let tombstone = self
            .paths
            .to_trash(request)
            .map_err(|_| StatusCode::NoSuchFile)?;

        info!(
            session=%self.session_id,
            user=%self.username,
            path=%request,
            tombstone=?tombstone,
            "sftp delete routed to trash"
        );

        let lock = self.lock.clone();
        let _guard = lock.lock().await;

        if tokio::fs::symlink_metadata(&source).await.is_err() {
            return Err(StatusCode::NoSuchFile);
        }
        if let Some(parent) = tombstone.parent() {
            create_secure_directory(parent).map_err(|e| io_status(&e))?;
        }
        tokio::fs::rename(&source, &tombstone)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use russh_sftp::server::Handler;

    use super::*;

    struct Fixture {
        session: SftpSession,
        mountpoint: PathBuf,
        mirror: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture(disk_limit_mb: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mountpoint = dir.path().join("mount");
        let mirror = dir.path().join("mirror");
        std::fs::create_dir_all(&mountpoint).unwrap();
        std::fs::create_dir_all(mirror.join("trash")).unwrap();

        let session = SftpSession::new(
            uuid::Uuid::new_v4(),
            "bob".to_owned(),
            "203.0.113.7:4000".parse().unwrap(),
            &mountpoint,
            &mirror,
            disk_limit_mb,
        );
        Fixture {
            session,
            mountpoint,
            mirror,
            _dir: dir,
        }
    }

    async fn list_names(session: &mut SftpSession, path: &str) -> Vec<String> {
        let handle = session.opendir(1, path.to_owned()).await.unwrap().handle;
        let mut names = Vec::new();
        loop {
            match session.readdir(2, handle.clone()).await {
                Ok(name) => names.extend(name.files.into_iter().map(|f| f.filename)),
                Err(StatusCode::Eof) => break,
                Err(other) => panic!("unexpected status {other:?}"),
            }
        }
        let _ = session.close(3, handle).await;
        names
    }

    #[tokio::test]
    async fn start_directory_is_home() {
        let mut f = fixture(100);
        let name = f.session.realpath(1, ".".to_owned()).await.unwrap();
        assert_eq!(name.files[0].filename, "/home/bob");
    }

    #[tokio::test]
    async fn upload_then_read_back() {
        let mut f = fixture(100);
        let handle = f
            .session
            .open(
                1,
                "/home/bob/secret.txt".to_owned(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        f.session
            .write(2, handle.clone(), 0, b"hello".to_vec())
            .await
            .unwrap();
        f.session.close(3, handle).await.unwrap();

        let handle = f
            .session
            .open(
                4,
                "/home/bob/secret.txt".to_owned(),
                OpenFlags::READ,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;
        let data = f.session.read(5, handle.clone(), 0, 64).await.unwrap();
        assert_eq!(data.data, b"hello");
        assert!(matches!(
            f.session.read(6, handle.clone(), 5, 64).await,
            Err(StatusCode::Eof)
        ));
        f.session.close(7, handle).await.unwrap();
    }

    #[tokio::test]
    async fn remove_preserves_bytes_in_trash() {
        let mut f = fixture(100);
        std::fs::write(f.mountpoint.join("secret.txt"), b"hello").unwrap();

        f.session
            .remove(1, "/home/bob/secret.txt".to_owned())
            .await
            .unwrap();

        assert!(!list_names(&mut f.session, "/home/bob")
            .await
            .contains(&"secret.txt".to_owned()));

        let trash = f.mirror.join("trash");
        let tombstones: Vec<_> = std::fs::read_dir(&trash).unwrap().collect();
        assert_eq!(tombstones.len(), 1);
        let tombstone = tombstones[0].as_ref().unwrap().path();
        assert_eq!(
            std::fs::read(tombstone.join("secret.txt")).unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn quota_refuses_writes_and_leaves_no_partial() {
        let mut f = fixture(1);
        // already past the budget before the upload starts
        std::fs::write(f.mountpoint.join("filler"), vec![0u8; 2 * 1024 * 1024]).unwrap();

        let result = f
            .session
            .open(
                1,
                "/home/bob/big.bin".to_owned(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await;
        assert!(matches!(result, Err(StatusCode::Failure)));
        assert!(!list_names(&mut f.session, "/home/bob")
            .await
            .contains(&"big.bin".to_owned()));
    }

    #[tokio::test]
    async fn quota_mid_write_drops_partial_file() {
        let mut f = fixture(1);
        let handle = f
            .session
            .open(
                1,
                "/home/bob/big.bin".to_owned(),
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileAttributes::default(),
            )
            .await
            .unwrap()
            .handle;

        f.session
            .write(2, handle.clone(), 0, vec![0u8; 2 * 1024 * 1024])
            .await
            .unwrap();
        let result = f.session.write(3, handle, 2 * 1024 * 1024, vec![0u8; 16]).await;
        assert!(matches!(result, Err(StatusCode::Failure)));
        assert!(!list_names(&mut f.session, "/home/bob")
            .await
            .contains(&"big.bin".to_owned()));
    }

    #[tokio::test]
    async fn traversal_is_no_such_file() {
        let mut f = fixture(100);
        assert!(matches!(
            f.session.stat(1, "/etc/passwd".to_owned()).await,
            Err(StatusCode::NoSuchFile)
        ));
        assert!(matches!(
            f.session
                .open(
                    2,
                    "/home/bob/../../etc/shadow".to_owned(),
                    OpenFlags::READ,
                    FileAttributes::default(),
                )
                .await,
            Err(StatusCode::NoSuchFile)
        ));
    }

    #[tokio::test]
    async fn setstat_clamps_modes() {
        use std::os::unix::fs::PermissionsExt;

        let mut f = fixture(100);
        std::fs::write(f.mountpoint.join("file"), b"x").unwrap();
        std::fs::create_dir(f.mountpoint.join("dir")).unwrap();

        let mut attrs = FileAttributes::default();
        attrs.permissions = Some(0);
        f.session
            .setstat(1, "/home/bob/file".to_owned(), attrs.clone())
            .await
            .unwrap();
        let mode = std::fs::metadata(f.mountpoint.join("file"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);

        attrs.permissions = Some(0o640);
        f.session
            .setstat(2, "/home/bob/dir".to_owned(), attrs)
            .await
            .unwrap();
        let mode = std::fs::metadata(f.mountpoint.join("dir"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn mkdir_is_group_readable_only() {
        use std::os::unix::fs::PermissionsExt;

        let mut f = fixture(100);
        f.session
            .mkdir(1, "/home/bob/incoming".to_owned(), FileAttributes::default())
            .await
            .unwrap();
        let mode = std::fs::metadata(f.mountpoint.join("incoming"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
