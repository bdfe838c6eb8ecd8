mod event;

pub use event::{parse_net_addr, AuthMethod, ConnectionEvent, SourceIp, FALLBACK_PORT};
use fishler_common::FishlerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::*;
use uuid::Uuid;

/// Client for the optional telemetry sink. Events are fire-and-mostly-forget:
/// a failed send gets one reconnect and one retry, then the event is dropped.
pub struct UplinkClient {
    endpoint: Option<String>,
    service_uuid: Uuid,
    conn: Mutex<Option<TcpStream>>,
}

impl UplinkClient {
    pub fn new(config: &FishlerConfig) -> Self {
        let endpoint = match config.uplink_server_address.as_str() {
            "" => None,
            address => Some(address.to_owned()),
        };
        Self {
            endpoint,
            service_uuid: config.service_uuid,
            conn: Mutex::new(None),
        }
    }

    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// Ships one event. A no-op without a configured endpoint; errors are
    /// logged, never surfaced to the session path.
    pub async fn beam_event(&self, event: &ConnectionEvent) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let frame = match encode_frame(event) {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "failed to serialize telemetry event");
                return;
            }
        };

        let mut conn = self.conn.lock().await;

        if let Some(stream) = conn.as_mut() {
            if stream.write_all(&frame).await.is_ok() {
                return;
            }
            *conn = None;
        }

        // Dial outside the happy path only; one reconnect, one retry.
        drop(conn);
        let stream = match TcpStream::connect(endpoint).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, endpoint, "telemetry reconnect failed, dropping event");
                return;
            }
        };

        let mut conn = self.conn.lock().await;
        *conn = Some(stream);
        #[allow(clippy::unwrap_used)]
        if let Err(error) = conn.as_mut().unwrap().write_all(&frame).await {
            warn!(%error, endpoint, "telemetry send failed after reconnect, dropping event");
            *conn = None;
        }
    }
}

/// Length-prefixed JSON framing: 4-byte big-endian length, then the payload.
fn encode_frame(event: &ConnectionEvent) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(event)?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    fn event() -> ConnectionEvent {
        ConnectionEvent {
            timestamp_micros: 1_700_000_000_000_000,
            service_uuid: Uuid::nil(),
            session_uuid: Uuid::new_v4(),
            auth_method: AuthMethod::Password,
            username: "root".into(),
            credential: "123456".into(),
            client_version: "SSH-2.0-OpenSSH_9.6".into(),
            fingerprint_hash: "d41d8cd98f00b204e9800998ecf8427e".into(),
            source_ip: SourceIp::Ipv4(0x7f000001),
            source_port: 40022,
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> ConnectionEvent {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn disabled_without_endpoint() {
        let client = UplinkClient::new(&FishlerConfig::default());
        assert!(!client.enabled());
        // must not attempt any connection
        client.beam_event(&event()).await;
        assert!(client.conn.lock().await.is_none());
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = FishlerConfig::default();
        config.uplink_server_address = listener.local_addr().unwrap().to_string();
        let client = UplinkClient::new(&config);

        client.beam_event(&event()).await;
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut second = event();
        second.username = "admin".into();
        client.beam_event(&second).await;

        assert_eq!(read_frame(&mut stream).await.username, "root");
        assert_eq!(read_frame(&mut stream).await.username, "admin");
    }

    #[tokio::test]
    async fn reconnects_once_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = FishlerConfig::default();
        config.uplink_server_address = listener.local_addr().unwrap().to_string();
        let client = UplinkClient::new(&config);

        client.beam_event(&event()).await;
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        // The write into the dead connection may only fail once the peer's
        // reset comes back; keep beaming until the client re-dials.
        let mut second = event();
        second.username = "admin".into();
        let (mut stream, _) =
            tokio::time::timeout(std::time::Duration::from_secs(5), async {
                loop {
                    client.beam_event(&second).await;
                    tokio::select! {
                        accepted = listener.accept() => break accepted.unwrap(),
                        _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
                    }
                }
            })
            .await
            .unwrap();

        let received = read_frame(&mut stream).await;
        assert_eq!(received.username, "admin");
    }
}
