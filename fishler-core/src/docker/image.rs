use std::collections::HashMap;
use std::io;

use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::Docker;
use futures::TryStreamExt;
use tar::{Builder, Header};
use tracing::*;

const DOCKERFILE: &str = include_str!("rootfs/Dockerfile");
const FIXME_SCRIPT: &str = include_str!("rootfs/fixme");
const BASH_SCRIPT: &str = include_str!("rootfs/bash");

/// Tars up the embedded build context: the Dockerfile plus the rootfs
/// scripts. The scripts are executable (0700) inside the archive.
fn build_context_tar() -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (name, body, mode) in [
        ("Dockerfile", DOCKERFILE, 0o600),
        ("fixme", FIXME_SCRIPT, 0o700),
        ("bash", BASH_SCRIPT, 0o700),
    ] {
        let mut header = Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes())?;
    }
    builder.into_inner()
}

pub async fn image_exists(docker: &Docker, image: &str) -> Result<bool, bollard::errors::Error> {
    let images = docker
        .list_images(Some(ListImagesOptions::<String> {
            all: true,
            filters: HashMap::from([("reference".to_owned(), vec![image.to_owned()])]),
            ..Default::default()
        }))
        .await?;
    Ok(!images.is_empty())
}

/// Builds the sandbox image unless it already exists; a no-op on the hot
/// path after the first session.
pub async fn ensure_image(docker: &Docker, image: &str, force: bool) -> anyhow::Result<()> {
    if !force && image_exists(docker, image).await? {
        return Ok(());
    }

    info!(image, "building sandbox image");
    let context = build_context_tar()?;
    let mut build = docker.build_image(
        BuildImageOptions {
            dockerfile: "Dockerfile".to_owned(),
            t: image.to_owned(),
            rm: true,
            nocache: true,
            q: true,
            ..Default::default()
        },
        None,
        Some(context.into()),
    );

    while let Some(update) = build.try_next().await? {
        if let Some(message) = update.stream {
            let message = message.trim();
            if !message.is_empty() {
                debug!(image, "build: {message}");
            }
        }
        if let Some(error) = update.error {
            anyhow::bail!("image build failed: {error}");
        }
    }

    info!(image, "sandbox image ready");
    Ok(())
}

pub async fn remove_image(docker: &Docker, image: &str) -> anyhow::Result<()> {
    docker
        .remove_image(
            image,
            Some(RemoveImageOptions {
                force: true,
                ..Default::default()
            }),
            None,
        )
        .await?;
    info!(image, "sandbox image removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn build_context_carries_executable_fixme() {
        let tar = build_context_tar().unwrap();
        let mut archive = tar::Archive::new(&tar[..]);

        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap();
            if name == "fixme" {
                assert_eq!(mode & 0o777, 0o700);
                let mut body = String::new();
                entry.read_to_string(&mut body).unwrap();
                assert!(body.starts_with("#!/bin/ash"));
                assert!(body.contains("unlink $0"));
            }
            seen.push(name);
        }
        assert_eq!(seen, vec!["Dockerfile", "fixme", "bash"]);
    }
}
