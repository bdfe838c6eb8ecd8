use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

pub(crate) fn _default_ip() -> String {
    "127.0.0.1".to_owned()
}

pub(crate) fn _default_port() -> u16 {
    2222
}

pub(crate) fn _default_banner() -> String {
    "OpenSSH_8.8".to_owned()
}

pub(crate) fn _default_docker_memory_limit() -> i64 {
    8
}

pub(crate) fn _default_docker_disk_limit() -> u64 {
    100
}

pub(crate) fn _default_docker_shm_size() -> i64 {
    4096
}

pub(crate) fn _default_docker_hostname() -> String {
    "localhost".to_owned()
}

pub(crate) fn _default_docker_imagename() -> String {
    "fishler".to_owned()
}

pub(crate) fn _default_crypto_basepath() -> PathBuf {
    "/opt/fishler/crypto".into()
}

pub(crate) fn _default_log_basepath() -> PathBuf {
    "/var/log/fishler".into()
}

pub(crate) fn _default_no_timeout() -> Duration {
    Duration::ZERO
}

pub(crate) fn _default_overlay_idle_ttl() -> Duration {
    Duration::from_secs(60 * 60 * 24)
}

pub(crate) fn _default_service_uuid() -> Uuid {
    Uuid::nil()
}
