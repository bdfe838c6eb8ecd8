mod common;
mod hassh;
mod keys;
mod server;
mod sftp;

use std::net::SocketAddr;

use anyhow::Result;
pub use common::*;
use fishler_core::Services;
pub use hassh::{HasshInfo, HasshStream};
pub use keys::load_or_generate_host_key;
pub use server::run_server;

#[derive(Clone)]
pub struct SshProtocolServer {
    services: Services,
}

impl SshProtocolServer {
    pub fn new(services: &Services) -> Self {
        SshProtocolServer {
            services: services.clone(),
        }
    }

    pub async fn run(self, address: SocketAddr) -> Result<()> {
        run_server(self.services, address).await
    }
}

impl std::fmt::Debug for SshProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SshProtocolServer")
    }
}
