use presence_core::{decode_image, Descriptor, EmbeddingProvider, FaceGate, NoFaceReason, ProviderError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const ENGINE_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("no usable face: {0:?}")]
    NoFace(NoFaceReason),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Descriptor, EngineError>>,
    },
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `image`, run the provider and return the descriptor of the one usable face.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Descriptor, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Owner of the embedding provider, running it on a dedicated OS thread.
///
/// The provider is never touched from async tasks; extraction never holds
/// any lock shared with the recorder.
pub struct Engine {
    handle: EngineHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Engine {
    /// Open the provider and spawn the engine thread. Fails fast if the provider cannot open.
    pub fn open(mut provider: Box<dyn EmbeddingProvider>, gate: FaceGate) -> Result<Self, EngineError> {
        provider.open()?;
        tracing::info!(provider = provider.name(), "embedding provider opened");

        let (tx, mut rx) = mpsc::channel::<EngineRequest>(ENGINE_QUEUE_DEPTH);

        let thread = std::thread::Builder::new()
            .name("presence-engine".into())
            .spawn(move || {
                tracing::info!("engine thread started");
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        EngineRequest::Extract { image, reply } => {
                            // Caller gave up (timeout or disconnect); skip the work.
                            if reply.is_closed() {
                                tracing::debug!("extract request abandoned before start");
                                continue;
                            }
                            let result = run_extract(provider.as_mut(), &gate, &image);
                            let _ = reply.send(result);
                        }
                        EngineRequest::Shutdown => break,
                    }
                }
                provider.close();
                tracing::info!("engine thread exiting");
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            handle: EngineHandle { tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the engine thread after queued requests drain, and close the provider.
    pub async fn close(mut self) {
        let _ = self.handle.tx.send(EngineRequest::Shutdown).await;
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("engine thread panicked"),
                Err(err) => tracing::error!(error = %err, "failed to join engine thread"),
            }
        }
    }
}

/// Decode, detect, and gate one image.
fn run_extract(
    provider: &mut dyn EmbeddingProvider,
    gate: &FaceGate,
    image: &[u8],
) -> Result<Descriptor, EngineError> {
    let decoded = decode_image(image)?;
    let (width, height) = decoded.dimensions();

    let faces = provider.detect(&decoded)?;
    tracing::debug!(faces = faces.len(), width, height, "extract: provider returned faces");

    gate.select(faces, width, height).map_err(EngineError::NoFace)
}
