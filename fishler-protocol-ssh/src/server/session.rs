use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::Bytes;
use fishler_common::{FishlerError, Secret, SessionId};
use fishler_core::docker::{run_session_sandbox, SandboxIo, SandboxRequest};
use fishler_core::uplink::{AuthMethod, ConnectionEvent, SourceIp};
use fishler_core::{Services, SessionState};
use futures::Future;
use rand::{Rng, RngExt};
use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Handle, Msg};
use russh::{Channel, Sig};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tracing::*;

use super::russh_handler::ServerHandlerEvent;
use crate::common::{PtyRequest, ServerChannelId};
use crate::hassh::HasshInfo;
use crate::sftp::SftpSession;

const MAX_BUFFERED_SIGNALS: usize = 128;

/// Guards the one-shot `exit-status` send for a channel.
#[derive(Clone)]
pub(crate) struct ExitClaim {
    sent: Arc<AtomicBool>,
}

impl ExitClaim {
    pub(crate) fn new() -> Self {
        Self {
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Succeeds exactly once; every later claim fails.
    pub(crate) fn claim(&self) -> Result<(), FishlerError> {
        if self.sent.swap(true, Ordering::SeqCst) {
            Err(FishlerError::AlreadyExited)
        } else {
            Ok(())
        }
    }
}

struct ChannelState {
    /// Present until a shell consumes the events or SFTP takes the stream.
    channel: Option<Channel<Msg>>,
    pty: Option<PtyRequest>,
    env: Vec<String>,
    handled: bool,
    exit: ExitClaim,
    stdin_tx: Option<mpsc::UnboundedSender<Bytes>>,
    resize_tx: Option<mpsc::UnboundedSender<(u32, u32)>>,
    signal_buffer: Vec<Sig>,
}

impl ChannelState {
    fn new(channel: Channel<Msg>) -> Self {
        Self {
            channel: Some(channel),
            pty: None,
            env: Vec::new(),
            handled: false,
            exit: ExitClaim::new(),
            stdin_tx: None,
            resize_tx: None,
            signal_buffer: Vec::new(),
        }
    }
}

pub struct ServerSession {
    id: SessionId,
    username: Option<String>,
    session_handle: Option<Handle>,
    remote_address: SocketAddr,
    services: Services,
    state_entry: Arc<Mutex<SessionState>>,
    hassh: Arc<OnceLock<HasshInfo>>,
    channels: HashMap<ServerChannelId, ChannelState>,
}

fn session_debug_tag(id: &SessionId, remote_address: &SocketAddr) -> String {
    format!("[{id} - {remote_address}]")
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", session_debug_tag(&self.id, &self.remote_address))
    }
}

impl ServerSession {
    pub async fn start(
        id: SessionId,
        remote_address: SocketAddr,
        services: &Services,
        state_entry: Arc<Mutex<SessionState>>,
        hassh: Arc<OnceLock<HasshInfo>>,
        mut handler_event_rx: UnboundedReceiver<ServerHandlerEvent>,
    ) -> Result<impl Future<Output = Result<()>>> {
        let mut this = Self {
            id,
            username: None,
            session_handle: None,
            remote_address,
            services: services.clone(),
            state_entry,
            hassh,
            channels: HashMap::new(),
        };

        let span = info_span!("SSH", session=%id);
        Ok(async move {
            while let Some(event) = handler_event_rx.recv().await {
                let done = matches!(event, ServerHandlerEvent::Disconnect);
                this.handle_event(event).await?;
                if done {
                    break;
                }
            }
            this.teardown().await;
            debug!("No more events");
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span))
    }

    async fn handle_event(&mut self, event: ServerHandlerEvent) -> Result<()> {
        match event {
            ServerHandlerEvent::Authenticated(handle) => {
                self.session_handle = Some(handle.0);
            }
            ServerHandlerEvent::AuthPassword(username, password, reply) => {
                let result = self
                    .handle_auth_password(username.expose_secret(), password.expose_secret())
                    .await;
                let _ = reply.send(result);
            }
            ServerHandlerEvent::AuthPublicKey(username, key, reply) => {
                let result = self.handle_auth_publickey(username.expose_secret(), &key).await;
                let _ = reply.send(result);
            }
            ServerHandlerEvent::AuthKeyboardInteractive(username, response, reply) => {
                let result = self
                    .handle_auth_keyboard_interactive(username.expose_secret(), response)
                    .await;
                let _ = reply.send(result);
            }
            ServerHandlerEvent::ChannelOpenSession(id, channel, reply) => {
                debug!(channel=%id, "session channel open");
                self.channels.insert(id, ChannelState::new(channel));
                let _ = reply.send(true);
            }
            ServerHandlerEvent::PtyRequest(id, request, reply) => {
                let accepted = match self.channels.get_mut(&id) {
                    Some(state) if !state.handled => {
                        debug!(channel=%id, term=%request.term, cols=request.col_width, rows=request.row_height, "pty requested");
                        state.pty = Some(request);
                        true
                    }
                    _ => false,
                };
                let _ = reply.send(accepted);
            }
            ServerHandlerEvent::EnvRequest(id, name, value, reply) => {
                let accepted = match self.channels.get_mut(&id) {
                    Some(state) if !state.handled => {
                        state.env.push(format!("{name}={value}"));
                        true
                    }
                    _ => false,
                };
                let _ = reply.send(accepted);
            }
            ServerHandlerEvent::ShellRequest(id, reply) => {
                let accepted = self.start_shell(id, None).await;
                let _ = reply.send(accepted);
            }
            ServerHandlerEvent::ExecRequest(id, data, reply) => {
                let command = String::from_utf8_lossy(&data).into_owned();
                let accepted = self.start_shell(id, Some(command)).await;
                let _ = reply.send(accepted);
            }
            ServerHandlerEvent::SubsystemRequest(id, name, reply) => {
                let accepted = if name == "sftp" {
                    self.start_sftp(id).await
                } else {
                    debug!(channel=%id, subsystem=%name, "refusing unknown subsystem");
                    false
                };
                let _ = reply.send(accepted);
            }
            ServerHandlerEvent::WindowChangeRequest(id, request, reply) => {
                if let Some(state) = self.channels.get_mut(&id) {
                    if let Some(resize_tx) = &state.resize_tx {
                        let _ = resize_tx.send((request.col_width, request.row_height));
                    }
                    if let Some(pty) = &mut state.pty {
                        pty.col_width = request.col_width;
                        pty.row_height = request.row_height;
                    }
                }
                let _ = reply.send(());
            }
            ServerHandlerEvent::Signal(id, signal, reply) => {
                if let Some(state) = self.channels.get_mut(&id) {
                    if state.signal_buffer.len() < MAX_BUFFERED_SIGNALS {
                        debug!(channel=%id, ?signal, "buffering client signal");
                        state.signal_buffer.push(signal);
                    }
                }
                let _ = reply.send(());
            }
            ServerHandlerEvent::AgentForwardRequest(id, reply) => {
                // Recorded, acknowledged, never forwarded.
                info!(channel=%id, "agent forwarding requested");
                let _ = reply.send(true);
            }
            ServerHandlerEvent::Data(id, data, reply) => {
                if let Some(state) = self.channels.get_mut(&id) {
                    if let Some(stdin_tx) = &state.stdin_tx {
                        let _ = stdin_tx.send(data);
                    }
                }
                let _ = reply.send(());
            }
            ServerHandlerEvent::ChannelEof(id, reply) => {
                if let Some(state) = self.channels.get_mut(&id) {
                    // half-close towards the sandbox
                    state.stdin_tx = None;
                }
                let _ = reply.send(());
            }
            ServerHandlerEvent::ChannelClose(id, reply) => {
                if let Some(state) = self.channels.remove(&id) {
                    if !state.signal_buffer.is_empty() {
                        debug!(channel=%id, signals=?state.signal_buffer, "signals recorded during session");
                    }
                }
                let _ = reply.send(());
            }
            ServerHandlerEvent::Disconnect => {}
        }
        Ok(())
    }

    fn fingerprint(&self) -> (String, String) {
        match self.hassh.get() {
            Some(info) => (info.hash.clone(), info.client_id.clone()),
            None => (String::new(), String::new()),
        }
    }

    /// Honeypot affordance, not a security control: stall scanners for a
    /// uniform 1..=B seconds before a password-based verdict.
    async fn random_sleep(&self) {
        let bound = self.services.config.lock().await.random_sleep_count;
        if bound > 0 {
            let secs = rand::rng().random_range(1.0..=bound as f64);
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
        }
    }

    async fn record_auth(&mut self, method: AuthMethod, username: &str, credential: &str) {
        let (fingerprint_hash, client_version) = self.fingerprint();
        let timestamp_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();

        let event = ConnectionEvent {
            timestamp_micros,
            service_uuid: self.services.uplink.service_uuid(),
            session_uuid: self.id,
            auth_method: method,
            username: username.to_owned(),
            credential: credential.to_owned(),
            client_version,
            fingerprint_hash,
            source_ip: SourceIp::from(self.remote_address),
            source_port: self.remote_address.port() as u32,
        };
        self.services.uplink.beam_event(&event).await;
    }

    async fn decide(&mut self, method: AuthMethod, username: &str, password: &str) -> Auth {
        self.random_sleep().await;
        self.record_auth(method, username, password).await;

        let success = self.services.policy.authenticate(username, password);
        let (_, client_version) = self.fingerprint();
        info!(
            address=%self.remote_address,
            username,
            password,
            success,
            version=%client_version,
            "authentication event"
        );

        if success {
            self.username = Some(username.to_owned());
            self.state_entry.lock().await.username = Some(username.to_owned());
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    async fn handle_auth_password(&mut self, username: &str, password: &str) -> Auth {
        self.decide(AuthMethod::Password, username, password).await
    }

    /// Records the offered key, then refuses: the honeypot never accepts
    /// key authentication.
    async fn handle_auth_publickey(&mut self, username: &str, key: &PublicKey) -> Auth {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        self.record_auth(AuthMethod::PublicKey, username, &fingerprint)
            .await;
        info!(
            address=%self.remote_address,
            username,
            publickey=%fingerprint,
            success = false,
            "authentication event"
        );
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    async fn handle_auth_keyboard_interactive(
        &mut self,
        username: &str,
        response: Option<Secret<String>>,
    ) -> Auth {
        match response {
            None => Auth::Partial {
                name: "".into(),
                instructions: "".into(),
                prompts: vec![("Password: ".into(), false)].into(),
            },
            Some(password) => {
                self.decide(
                    AuthMethod::KeyboardInteractive,
                    username,
                    password.expose_secret(),
                )
                .await
            }
        }
    }

    /// `shell` and `exec` both land here; the only difference is the command
    /// injected into the sandbox stdin after attach.
    async fn start_shell(&mut self, id: ServerChannelId, command: Option<String>) -> bool {
        let Some(username) = self.username.clone() else {
            return false;
        };
        let Some(handle) = self.session_handle.clone() else {
            return false;
        };
        let Some(state) = self.channels.get_mut(&id) else {
            return false;
        };
        if state.handled {
            return false;
        }
        state.handled = true;
        // data now flows through handler events only
        state.channel = None;

        let pty = state.pty.clone();
        let env = state.env.clone();
        let exit = state.exit.clone();

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        if let Some(pty) = &pty {
            let _ = resize_tx.send((pty.col_width, pty.row_height));
        }
        state.stdin_tx = Some(stdin_tx);
        state.resize_tx = Some(resize_tx);

        let (_, client_version) = self.fingerprint();
        info!(
            address=%self.remote_address,
            username=%username,
            command=?command,
            environment=?env,
            version=%client_version,
            pty = pty.is_some(),
            "session event"
        );

        let services = self.services.clone();
        let session_id = self.id;
        let channel_id = id.0;
        tokio::spawn(
            async move {
                let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(64);

                let forwarder = tokio::spawn({
                    let handle = handle.clone();
                    async move {
                        while let Some(bytes) = output_rx.recv().await {
                            if handle
                                .data(channel_id, bytes)
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                });

                let result = async {
                    let mountpoint = services.overlay.get_mount_point(&username).await?;
                    let transcript = services.transcripts.lock().await.start(&session_id).await?;
                    let config = services.config.lock().await.clone();

                    let request = SandboxRequest {
                        session_id,
                        username: username.clone(),
                        mountpoint,
                        env,
                        command,
                        pty: pty.is_some(),
                    };
                    let io = SandboxIo {
                        output_tx,
                        stdin_rx,
                        resize_rx,
                    };
                    run_session_sandbox(&config, request, io, transcript).await
                }
                .await;

                let _ = forwarder.await;

                let code = match result {
                    Ok(code) => code as u32,
                    Err(error) => {
                        error!(%error, "sandbox session failed");
                        255
                    }
                };

                if exit.claim().is_ok() {
                    info!(exit_code = code, "session exit");
                    let _ = handle.exit_status_request(channel_id, code).await;
                    let _ = handle.eof(channel_id).await;
                    let _ = handle.close(channel_id).await;
                }
                services.overlay.release(&username).await;
            }
            .instrument(info_span!("sandbox", session=%self.id)),
        );

        true
    }

    async fn start_sftp(&mut self, id: ServerChannelId) -> bool {
        let Some(username) = self.username.clone() else {
            return false;
        };
        let Some(handle) = self.session_handle.clone() else {
            return false;
        };
        let Some(state) = self.channels.get_mut(&id) else {
            return false;
        };
        if state.handled || state.channel.is_none() {
            return false;
        }

        let result: Result<(std::path::PathBuf, std::path::PathBuf), FishlerError> = async {
            let mountpoint = self.services.overlay.get_mount_point(&username).await?;
            let mirror = self.services.overlay.get_mirror_dir(&username).await?;
            Ok((mountpoint, mirror))
        }
        .await;

        let (mountpoint, mirror) = match result {
            Ok(paths) => paths,
            Err(error) => {
                error!(%error, "failed to prepare overlay for sftp");
                return false;
            }
        };

        let Some(state) = self.channels.get_mut(&id) else {
            return false;
        };
        state.handled = true;
        #[allow(clippy::unwrap_used)]
        let channel = state.channel.take().unwrap();
        let exit = state.exit.clone();

        let disk_limit_mb = self.services.config.lock().await.docker_disk_limit;
        let sftp = SftpSession::new(
            self.id,
            username.clone(),
            self.remote_address,
            &mountpoint,
            &mirror,
            disk_limit_mb,
        );

        info!(
            address=%self.remote_address,
            username=%username,
            subsystem = "sftp",
            "session event"
        );

        let services = self.services.clone();
        let channel_id = id.0;
        let session_id = self.id;
        tokio::spawn(
            async move {
                russh_sftp::server::run(channel.into_stream(), sftp).await;

                if exit.claim().is_ok() {
                    let _ = handle.exit_status_request(channel_id, 0).await;
                    let _ = handle.eof(channel_id).await;
                    let _ = handle.close(channel_id).await;
                }
                services.overlay.release(&username).await;
            }
            .instrument(info_span!("sftp", session=%session_id)),
        );

        true
    }

    async fn teardown(&mut self) {
        // Dropping the stdin/resize senders lets any sandbox bridges drain
        // out; the sandbox tasks release their own overlay references.
        self.channels.clear();
        self.services.state.lock().await.remove_session(&self.id);
        info!(address=%self.remote_address, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_is_sent_exactly_once() {
        let claim = ExitClaim::new();
        assert!(claim.claim().is_ok());
        assert!(matches!(claim.claim(), Err(FishlerError::AlreadyExited)));
        assert!(matches!(claim.claim(), Err(FishlerError::AlreadyExited)));

        let other = claim.clone();
        assert!(matches!(other.claim(), Err(FishlerError::AlreadyExited)));
    }
}
