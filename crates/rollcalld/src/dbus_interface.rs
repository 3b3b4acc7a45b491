use crate::engine::CameraHandle;
use rollcall_core::{
    HttpVerificationClient, ScanEvent, ScanLoop, ScanObserver, ScanTiming,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "io.rollcall.Scanner1";
pub const OBJECT_PATH: &str = "/io/rollcall/Scanner1";

pub type DaemonLoop = ScanLoop<CameraHandle, HttpVerificationClient>;

/// D-Bus interface for the Rollcall scanner daemon.
///
/// Bus name: io.rollcall.Scanner1
/// Object path: /io/rollcall/Scanner1
pub struct ScannerService {
    scan: Arc<Mutex<DaemonLoop>>,
    timing: ScanTiming,
    observer: Arc<dyn ScanObserver>,
}

impl ScannerService {
    pub fn new(
        scan: Arc<Mutex<DaemonLoop>>,
        timing: ScanTiming,
        observer: Arc<dyn ScanObserver>,
    ) -> Self {
        Self {
            scan,
            timing,
            observer,
        }
    }

    fn scan(&self) -> zbus::fdo::Result<MutexGuard<'_, DaemonLoop>> {
        self.scan
            .lock()
            .map_err(|_| zbus::fdo::Error::Failed("scan loop lock poisoned".into()))
    }
}

#[interface(name = "io.rollcall.Scanner1")]
impl ScannerService {
    /// Current state, its display message and recent activity as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let scan = self.scan()?;
        let state = scan.state();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "running": scan.is_running(),
            "state": state,
            "message": state.message(),
            "interval_ms": self.timing.interval.as_millis() as u64,
            "cooldown_ms": self.timing.cooldown.as_millis() as u64,
            "recent": scan.recent_activity(),
        })
        .to_string())
    }

    /// Recent fresh confirmations, newest first, as a JSON array.
    async fn recent_activity(&self) -> zbus::fdo::Result<String> {
        let recent = self.scan()?.recent_activity();
        serde_json::to_string(&recent).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Begin scanning. Fails if already running.
    async fn start(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start requested");
        self.scan()?
            .start(self.timing, Arc::clone(&self.observer))
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Stop scanning. No-op if not running.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        self.scan()?.stop();
        Ok(())
    }

    /// Emitted on every scan state change.
    #[zbus(signal)]
    async fn state_changed(
        emitter: &SignalEmitter<'_>,
        state_json: &str,
        message: &str,
    ) -> zbus::Result<()>;
}

/// Drain observer events: log them and re-publish state changes as
/// `StateChanged` signals.
pub async fn publish_events(conn: zbus::Connection, mut events: mpsc::UnboundedReceiver<ScanEvent>) {
    let iface = match conn
        .object_server()
        .interface::<_, ScannerService>(OBJECT_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(e) => {
            tracing::error!(error = %e, "scanner interface not registered; events will not be published");
            return;
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            ScanEvent::Activity(entry) => {
                tracing::info!(
                    identity = %entry.identity.id,
                    name = %entry.identity.name,
                    attendance_id = ?entry.attendance_id,
                    "attendance recorded"
                );
            }
            ScanEvent::StateChanged { state, recent } => {
                let message = state.message();
                tracing::debug!(message = %message, recent = recent.len(), "state changed");
                let state_json = match serde_json::to_string(&state) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize scan state");
                        continue;
                    }
                };
                if let Err(e) =
                    ScannerService::state_changed(iface.signal_emitter(), &state_json, &message)
                        .await
                {
                    tracing::warn!(error = %e, "failed to emit StateChanged");
                }
            }
        }
    }
}
