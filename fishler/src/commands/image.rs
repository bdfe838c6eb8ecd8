use anyhow::Result;
use bollard::Docker;
use clap::Subcommand;
use fishler_core::docker::{ensure_image, remove_image};

use crate::config::load_config;
use crate::logging::init_logging;
use crate::Cli;

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Build (or rebuild) the sandbox image.
    Build {
        /// The image reference to build.
        #[arg(long)]
        docker_imagename: Option<String>,
    },
    /// Remove the sandbox image.
    Remove {
        /// The image reference to remove.
        #[arg(long)]
        docker_imagename: Option<String>,
    },
}

pub async fn command(cli: &Cli, command: &ImageCommands) -> Result<()> {
    let serve_defaults = Default::default();
    let mut config = load_config(cli, &serve_defaults)?;
    init_logging(&config)?;

    let docker = Docker::connect_with_local_defaults()?;
    match command {
        ImageCommands::Build { docker_imagename } => {
            if let Some(image) = docker_imagename {
                config.docker_imagename = image.clone();
            }
            ensure_image(&docker, &config.docker_imagename, true).await
        }
        ImageCommands::Remove { docker_imagename } => {
            if let Some(image) = docker_imagename {
                config.docker_imagename = image.clone();
            }
            remove_image(&docker, &config.docker_imagename).await
        }
    }
}
