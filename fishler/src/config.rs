use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use fishler_common::FishlerConfig;

use crate::commands::serve::ServeArgs;
use crate::Cli;

/// Builds the runtime configuration. Precedence, highest first: CLI flags,
/// `FISHLER_*` environment variables, `.fishler.yaml` in the working
/// directory, compiled defaults (which live on the config struct itself).
pub fn load_config(cli: &Cli, args: &ServeArgs) -> Result<FishlerConfig> {
    let mut builder = Config::builder()
        .add_source(File::new(".fishler.yaml", FileFormat::Yaml).required(false))
        .add_source(Environment::with_prefix("FISHLER"));

    macro_rules! cli_override {
        ($key:literal, $value:expr) => {
            if let Some(value) = $value {
                builder = builder.set_override($key, value)?;
            }
        };
    }

    cli_override!("ip", args.ip.clone());
    cli_override!("port", args.port.map(i64::from));
    cli_override!("banner", args.banner.clone());
    cli_override!("random_sleep_count", args.random_sleep_count.map(|v| v as i64));
    cli_override!("docker_memory_limit", args.docker_memory_limit);
    cli_override!("docker_disk_limit", args.docker_disk_limit.map(|v| v as i64));
    cli_override!("docker_hostname", args.docker_hostname.clone());
    cli_override!("docker_imagename", args.docker_imagename.clone());
    cli_override!("ssh_idle_timeout", args.ssh_idle_timeout.clone());
    cli_override!("ssh_max_timeout", args.ssh_max_timeout.clone());
    cli_override!(
        "crypto_basepath",
        args.crypto_basepath
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    );
    cli_override!(
        "log_basepath",
        cli.log_basepath
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
    );
    cli_override!("uplink_server_address", args.uplink_server_address.clone());
    cli_override!("account_file", args.account_file.clone());
    cli_override!("password_file", args.password_file.clone());
    cli_override!("account", args.account.clone());
    cli_override!("password", args.password.clone());
    if !args.volumn.is_empty() {
        builder = builder.set_override("volumn", args.volumn.clone())?;
    }
    if args.any_account {
        builder = builder.set_override("any_account", true)?;
    }
    if args.no_account {
        builder = builder.set_override("no_account", true)?;
    }
    if cli.debug {
        builder = builder.set_override("debug", true)?;
    }

    builder
        .build()
        .context("assembling configuration")?
        .try_deserialize()
        .context("invalid configuration")
}
