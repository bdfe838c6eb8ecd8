mod defaults;

use std::path::PathBuf;
use std::time::Duration;

use defaults::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime configuration, immutable after start.
///
/// Every field can be set from (in descending priority) a CLI flag, a
/// `FISHLER_*` environment variable, or `.fishler.yaml` in the working
/// directory; unset fields take the compiled defaults below.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FishlerConfig {
    #[serde(default = "_default_ip")]
    pub ip: String,

    #[serde(default = "_default_port")]
    pub port: u16,

    /// Version string advertised in the identification banner,
    /// without the `SSH-2.0-` prefix.
    #[serde(default = "_default_banner")]
    pub banner: String,

    /// Upper bound, in seconds, of the random pre-auth delay. Zero disables it.
    #[serde(default)]
    pub random_sleep_count: u64,

    /// Per-sandbox memory cap in megabytes.
    #[serde(default = "_default_docker_memory_limit")]
    pub docker_memory_limit: i64,

    /// Per-session writable disk budget in megabytes, enforced by the SFTP handler.
    #[serde(default = "_default_docker_disk_limit")]
    pub docker_disk_limit: u64,

    /// Per-sandbox /dev/shm size in bytes.
    #[serde(default = "_default_docker_shm_size")]
    pub docker_shm_size: i64,

    #[serde(default = "_default_docker_hostname")]
    pub docker_hostname: String,

    #[serde(default = "_default_docker_imagename")]
    pub docker_imagename: String,

    /// Extra bind mounts in docker `-v` syntax, applied to every sandbox.
    #[serde(default)]
    pub volumn: Vec<String>,

    #[serde(default = "_default_no_timeout", with = "humantime_serde")]
    pub ssh_idle_timeout: Duration,

    #[serde(default = "_default_no_timeout", with = "humantime_serde")]
    pub ssh_max_timeout: Duration,

    #[serde(default = "_default_overlay_idle_ttl", with = "humantime_serde")]
    pub overlay_idle_ttl: Duration,

    #[serde(default = "_default_crypto_basepath")]
    pub crypto_basepath: PathBuf,

    #[serde(default = "_default_log_basepath")]
    pub log_basepath: PathBuf,

    /// Telemetry endpoint (`host:port`). Empty string disables the uplink entirely.
    #[serde(default)]
    pub uplink_server_address: String,

    #[serde(default = "_default_service_uuid")]
    pub service_uuid: Uuid,

    #[serde(default)]
    pub account_file: String,

    #[serde(default)]
    pub password_file: String,

    #[serde(default)]
    pub account: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub any_account: bool,

    #[serde(default)]
    pub no_account: bool,

    #[serde(default)]
    pub debug: bool,
}

impl Default for FishlerConfig {
    fn default() -> Self {
        #[allow(clippy::unwrap_used)]
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl FishlerConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// `SSH-2.0-<banner>` as sent on the wire.
    pub fn server_id(&self) -> String {
        format!("SSH-2.0-{}", self.banner)
    }

    pub fn session_log_dir(&self) -> PathBuf {
        self.log_basepath.join("session")
    }

    pub fn system_log_path(&self) -> PathBuf {
        self.log_basepath.join("system.log")
    }

    pub fn overlay_base_dir(&self) -> PathBuf {
        self.log_basepath.join("fishyfs")
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.crypto_basepath.join("id_rsa")
    }
}

/// The in-sandbox home directory for a username; doubles as the root of the
/// SFTP namespace for that user.
pub fn sandbox_home(username: &str) -> String {
    if username == "root" {
        "/root".to_owned()
    } else {
        format!("/home/{username}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = FishlerConfig::default();
        assert_eq!(config.listen_address(), "127.0.0.1:2222");
        assert_eq!(config.server_id(), "SSH-2.0-OpenSSH_8.8");
        assert_eq!(config.docker_disk_limit, 100);
        assert_eq!(config.overlay_idle_ttl, Duration::from_secs(86400));
        assert!(config.uplink_server_address.is_empty());
        assert!(config.service_uuid.is_nil());
    }

    #[test]
    fn sandbox_home_for_root_and_users() {
        assert_eq!(sandbox_home("root"), "/root");
        assert_eq!(sandbox_home("alice"), "/home/alice");
    }
}
