use rollcall_core::{FrameSource, FrameUnavailable, StillFrame};
use rollcall_hw::{Camera, CameraError, Frame};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn camera thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("camera thread exited")]
    ChannelClosed,
}

/// Capture request sent to the camera thread; the reply carries the still.
type CaptureRequest = oneshot::Sender<Result<Frame, CameraError>>;

/// Clone-safe handle to the camera thread.
#[derive(Clone)]
pub struct CameraHandle {
    tx: mpsc::Sender<CaptureRequest>,
}

impl CameraHandle {
    /// Ask the camera thread for one encoded still.
    pub async fn capture_frame(&self) -> Result<Frame, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let frame = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(frame)
    }
}

impl FrameSource for CameraHandle {
    async fn capture(&self) -> Result<StillFrame, FrameUnavailable> {
        match self.capture_frame().await {
            Ok(frame) => {
                tracing::trace!(
                    seq = frame.sequence,
                    bytes = frame.jpeg.len(),
                    width = frame.width,
                    height = frame.height,
                    "captured still"
                );
                Ok(StillFrame::jpeg(frame.jpeg))
            }
            Err(e) => Err(FrameUnavailable(e.to_string())),
        }
    }
}

/// Spawn the camera on a dedicated OS thread.
///
/// Opens the device and discards warmup frames before returning, so a
/// missing or busy camera fails startup instead of the first scan.
pub fn spawn_camera(
    camera_device: &str,
    width: u32,
    height: u32,
    warmup_frames: usize,
) -> Result<CameraHandle, EngineError> {
    let camera = Camera::open(camera_device, width, height)?;
    tracing::info!(
        device = camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        format = ?camera.pixel_format(),
        "camera opened"
    );

    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        if let Err(e) = camera.discard_frames(warmup_frames) {
            tracing::warn!(error = %e, "warmup capture failed; continuing");
        }
    }

    let (tx, mut rx) = mpsc::channel::<CaptureRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-camera".into())
        .spawn(move || {
            tracing::info!("camera thread started");
            while let Some(reply) = rx.blocking_recv() {
                let _ = reply.send(camera.capture_still());
            }
            tracing::info!("camera thread exiting");
        })?;

    Ok(CameraHandle { tx })
}
