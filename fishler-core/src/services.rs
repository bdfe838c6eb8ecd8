use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fishler_common::{AuthPolicy, FishlerConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::*;

use crate::overlay::OverlayManager;
use crate::uplink::UplinkClient;
use crate::{SessionTranscripts, State};

const OVERLAY_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Mutex<FishlerConfig>>,
    pub policy: Arc<AuthPolicy>,
    pub state: Arc<Mutex<State>>,
    pub transcripts: Arc<Mutex<SessionTranscripts>>,
    pub overlay: Arc<OverlayManager>,
    pub uplink: Arc<UplinkClient>,
    overlay_gc: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Services {
    pub async fn new(config: FishlerConfig) -> Result<Self> {
        let policy = Arc::new(AuthPolicy::from_config(&config)?);
        let transcripts = Arc::new(Mutex::new(SessionTranscripts::new(&config)?));
        let overlay = Arc::new(OverlayManager::new(&config));
        let uplink = Arc::new(UplinkClient::new(&config));

        let overlay_gc = tokio::spawn(overlay.clone().run_gc(OVERLAY_GC_INTERVAL));

        Ok(Self {
            config: Arc::new(Mutex::new(config)),
            policy,
            state: Arc::new(Mutex::new(State::new())),
            transcripts,
            overlay,
            uplink,
            overlay_gc: Arc::new(Mutex::new(Some(overlay_gc))),
        })
    }

    /// Shutdown path: stops the overlay GC and drains every mount.
    pub async fn shutdown(&self) {
        if let Some(gc) = self.overlay_gc.lock().await.take() {
            gc.abort();
        }
        if let Err(error) = self.overlay.unmount_all().await {
            error!(%error, "failed to unmount overlays on shutdown");
        }
    }
}
