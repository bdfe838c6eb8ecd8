mod russh_handler;
mod session;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use fishler_core::Services;
pub use russh_handler::ServerHandler;
use russh::{MethodKind, MethodSet, SshId};
pub use session::ServerSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tracing::*;

use crate::hassh::HasshStream;
use crate::keys::load_or_generate_host_key;

pub async fn run_server(services: Services, address: SocketAddr) -> Result<()> {
    let russh_config = {
        let config = services.config.lock().await;
        russh::server::Config {
            server_id: SshId::Standard(config.server_id().into()),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: (config.ssh_idle_timeout > Duration::ZERO)
                .then_some(config.ssh_idle_timeout),
            methods: MethodSet::from(
                &[
                    MethodKind::PublicKey,
                    MethodKind::Password,
                    MethodKind::KeyboardInteractive,
                ][..],
            ),
            keys: vec![load_or_generate_host_key(&config)?],
            nodelay: true,
            ..<_>::default()
        }
    };

    let russh_config = Arc::new(russh_config);

    let listener = TcpListener::bind(address)
        .await
        .context("binding listener")?;
    info!(%address, "listening");

    loop {
        let (stream, remote_address) = listener.accept().await.context("accepting connection")?;
        let russh_config = russh_config.clone();

        // The fingerprint has to be in place before the first auth callback
        // fires, so the wrapper goes between accept and handshake.
        let hassh = Arc::new(OnceLock::new());
        let stream = HasshStream::new(stream, remote_address, {
            let hassh = hassh.clone();
            move |info| {
                info!(
                    hash = %info.hash,
                    client = %info.client_id,
                    address = %info.remote_addr,
                    "client fingerprint"
                );
                let _ = hassh.set(info);
            }
        });

        let state_entry = services
            .state
            .lock()
            .await
            .register_session(remote_address);
        let id = state_entry.lock().await.id;

        let (event_tx, event_rx) = unbounded_channel();
        let handler = ServerHandler { event_tx };

        let session = match ServerSession::start(
            id,
            remote_address,
            &services,
            state_entry,
            hassh,
            event_rx,
        )
        .await
        {
            Ok(session) => session,
            Err(error) => {
                error!(%error, "Error setting up session");
                continue;
            }
        };

        tokio::spawn(session);
        tokio::spawn(_run_stream(russh_config, stream, handler));
    }
}

async fn _run_stream<R>(
    config: Arc<russh::server::Config>,
    socket: R,
    handler: ServerHandler,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    let ret = async move {
        let session = russh::server::run_stream(config, socket, handler).await?;
        session.await?;
        Ok(())
    }
    .await;

    if let Err(ref error) = ret {
        error!(%error, "Session failed");
    }

    ret
}
