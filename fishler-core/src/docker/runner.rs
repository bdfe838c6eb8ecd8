use std::path::PathBuf;
use std::time::Duration;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, RemoveContainerOptions, ResizeContainerTtyOptions,
    StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::service::{ContainerWaitResponse, HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use bytes::Bytes;
use fishler_common::helpers::bytes::byte_count_decimal;
use fishler_common::{sandbox_home, FishlerConfig, SessionId};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::*;

use super::image::ensure_image;
use super::profile::profile_tar;
use crate::TranscriptWriter;

/// System paths remounted read-only inside every sandbox. `/root` is added
/// on top for non-root identities.
const READONLY_PATHS: &[&str] = &[
    "/bin", "/dev", "/lib", "/media", "/mnt", "/opt", "/run", "/sbin", "/srv", "/sys", "/usr",
    "/var", "/tmp",
];

pub struct SandboxRequest {
    pub session_id: SessionId,
    pub username: String,
    /// Host-side overlay path bound onto the in-sandbox home.
    pub mountpoint: PathBuf,
    pub env: Vec<String>,
    /// Joined `exec` command; injected into stdin after attach.
    pub command: Option<String>,
    pub pty: bool,
}

/// The session side of the bridge. Dropping `output_tx`'s counterpart closes
/// the channel towards the client; closing `stdin_rx`'s senders half-closes
/// the sandbox stdin.
pub struct SandboxIo {
    pub output_tx: mpsc::Sender<Bytes>,
    pub stdin_rx: mpsc::UnboundedReceiver<Bytes>,
    pub resize_rx: mpsc::UnboundedReceiver<(u32, u32)>,
}

/// Provisions, attaches, seeds and runs one sandbox for one session, bridging
/// its I/O until exit. Returns the sandbox exit code; the caller reports it
/// on the SSH channel. Any error before the container runs surfaces as `Err`
/// (and the caller reports 255) after the container is reaped.
pub async fn run_session_sandbox(
    config: &FishlerConfig,
    request: SandboxRequest,
    io: SandboxIo,
    transcript: TranscriptWriter,
) -> anyhow::Result<i64> {
    let docker = Docker::connect_with_local_defaults()?;
    ensure_image(&docker, &config.docker_imagename, false).await?;

    let name = request.session_id.to_string();
    create_sandbox(&docker, config, &request, &name).await?;

    let result = run_created(&docker, config, &request, &name, io, transcript).await;
    reap(&docker, &name).await;
    result
}

async fn create_sandbox(
    docker: &Docker,
    config: &FishlerConfig,
    request: &SandboxRequest,
    name: &str,
) -> anyhow::Result<()> {
    let home = sandbox_home(&request.username);

    let mut readonly_paths: Vec<String> = READONLY_PATHS.iter().map(|p| (*p).to_owned()).collect();
    if request.username != "root" {
        readonly_paths.push("/root".to_owned());
    }

    let host_config = HostConfig {
        auto_remove: Some(true),
        network_mode: Some("none".to_owned()),
        dns: Some(vec!["127.0.0.1".to_owned()]),
        dns_search: Some(vec!["local".to_owned()]),
        privileged: Some(false),
        shm_size: Some(config.docker_shm_size),
        readonly_paths: Some(readonly_paths),
        memory: Some(config.docker_memory_limit * 1024 * 1024),
        binds: (!config.volumn.is_empty()).then(|| config.volumn.clone()),
        mounts: Some(vec![Mount {
            source: Some(request.mountpoint.to_string_lossy().into_owned()),
            target: Some(home.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }]),
        ..Default::default()
    };

    docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.to_owned(),
                ..Default::default()
            }),
            Config {
                image: Some(config.docker_imagename.clone()),
                hostname: Some(config.docker_hostname.clone()),
                user: Some(request.username.clone()),
                env: Some(request.env.clone()),
                tty: Some(request.pty),
                open_stdin: Some(true),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                stdin_once: Some(false),
                working_dir: Some(home),
                host_config: Some(host_config),
                ..Default::default()
            },
        )
        .await?;

    debug!(container = name, "sandbox created");
    Ok(())
}

async fn run_created(
    docker: &Docker,
    config: &FishlerConfig,
    request: &SandboxRequest,
    name: &str,
    io: SandboxIo,
    transcript: TranscriptWriter,
) -> anyhow::Result<i64> {
    let AttachContainerResults { mut output, mut input } = docker
        .attach_container(
            name,
            Some(AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(false),
                ..Default::default()
            }),
        )
        .await?;

    let profile = profile_tar(&request.username)?;
    docker
        .upload_to_container(
            name,
            Some(UploadToContainerOptions {
                path: "/etc".to_owned(),
                ..Default::default()
            }),
            profile.into(),
        )
        .await?;

    docker
        .start_container(name, None::<StartContainerOptions<String>>)
        .await?;
    debug!(container = name, "sandbox started");

    fixup_permissions(docker, name, &request.username).await?;

    let SandboxIo {
        output_tx,
        mut stdin_rx,
        mut resize_rx,
    } = io;

    let mut transcript = transcript;
    let c2s = tokio::spawn(async move {
        let mut total = 0u64;
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(chunk) => {
                    let bytes = Bytes::from(chunk.into_bytes());
                    total += bytes.len() as u64;
                    if let Err(error) = transcript.write(&bytes).await {
                        warn!(%error, "transcript write failed");
                    }
                    if output_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!(%error, "sandbox output stream ended");
                    break;
                }
            }
        }
        (transcript, total)
    });

    let command = request.command.clone();
    let s2c = tokio::spawn(async move {
        let mut total = 0u64;
        if let Some(command) = command {
            let line = format!("{command}\nexit\n");
            total += line.len() as u64;
            if input.write_all(line.as_bytes()).await.is_err() {
                return total;
            }
        }
        while let Some(bytes) = stdin_rx.recv().await {
            total += bytes.len() as u64;
            if input.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = input.flush().await;
        }
        let _ = input.shutdown().await;
        total
    });

    let resize = request.pty.then(|| {
        let docker = docker.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            while let Some((cols, rows)) = resize_rx.recv().await {
                let width = u16::try_from(cols).unwrap_or(1024);
                let height = u16::try_from(rows).unwrap_or(768);
                if let Err(error) = docker
                    .resize_container_tty(&name, ResizeContainerTtyOptions { width, height })
                    .await
                {
                    debug!(%error, container = name, "sandbox resize failed");
                    break;
                }
            }
        })
    });

    let exit_code = wait_for_exit(docker, config, name).await;

    // Drain the bridge before the transcript goes away. The stdin side can
    // only be waiting on the session, so it gets a bounded grace period and
    // is then aborted, which also drops its attach connection to the daemon.
    let (transcript, received) = c2s.await?;
    let abort_stdin = s2c.abort_handle();
    let sent = match tokio::time::timeout(Duration::from_secs(5), s2c).await {
        Ok(total) => total.unwrap_or(0),
        Err(_) => {
            abort_stdin.abort();
            0
        }
    };
    if let Some(resize) = resize {
        resize.abort();
    }
    transcript.finalize().await;

    info!(
        container = name,
        received = byte_count_decimal(received),
        sent = byte_count_decimal(sent),
        exit_code,
        "sandbox exited"
    );

    Ok(exit_code)
}

/// Runs `/fixme <user>` as root with a TTY and drains its attach stream. The
/// script normalizes ownership inside the sandbox and removes itself.
async fn fixup_permissions(docker: &Docker, name: &str, username: &str) -> anyhow::Result<()> {
    let exec = docker
        .create_exec(
            name,
            CreateExecOptions {
                user: Some("root".to_owned()),
                tty: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(vec!["/fixme".to_owned(), username.to_owned()]),
                ..Default::default()
            },
        )
        .await?;

    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, Some(StartExecOptions::default()))
        .await?
    {
        while let Some(chunk) = output.next().await {
            if chunk.is_err() {
                break;
            }
        }
    }
    Ok(())
}

async fn wait_for_exit(docker: &Docker, config: &FishlerConfig, name: &str) -> i64 {
    let mut wait = docker.wait_container(
        name,
        Some(WaitContainerOptions {
            condition: "not-running".to_owned(),
        }),
    );

    if config.ssh_max_timeout > Duration::ZERO {
        match tokio::time::timeout(config.ssh_max_timeout, wait.next()).await {
            Ok(item) => wait_status(item),
            Err(_) => {
                info!(container = name, "session deadline reached, killing sandbox");
                let _ = docker
                    .kill_container(name, None::<KillContainerOptions<String>>)
                    .await;
                wait_status(wait.next().await)
            }
        }
    } else {
        wait_status(wait.next().await)
    }
}

fn wait_status(
    item: Option<Result<ContainerWaitResponse, bollard::errors::Error>>,
) -> i64 {
    match item {
        Some(Ok(response)) => response.status_code,
        Some(Err(error)) => {
            // auto-remove can win the race against the wait call
            debug!(%error, "sandbox wait ended with error");
            255
        }
        None => 255,
    }
}

/// Idempotent teardown: force-removes the container if it still exists.
async fn reap(docker: &Docker, name: &str) {
    if docker.inspect_container(name, None).await.is_ok() {
        if let Err(error) = docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(%error, container = name, "sandbox already gone");
        }
    }
}
