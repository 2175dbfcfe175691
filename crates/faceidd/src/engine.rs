use faceid_core::{AuthOutcome, EnrollOutcome, FaceAuthError, FacialAuthService, StoreError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoding store: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Service(#[from] FaceAuthError),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("engine workers exited")]
    ChannelClosed,
    #[error("cannot spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Messages sent from D-Bus handlers to the worker pool.
enum EngineRequest {
    Enroll {
        identity: String,
        image: Vec<u8>,
        reply: oneshot::Sender<EnrollOutcome>,
    },
    Authenticate {
        image: Vec<u8>,
        reply: oneshot::Sender<AuthOutcome>,
    },
    Verify {
        identity: String,
        image: Vec<u8>,
        reply: oneshot::Sender<AuthOutcome>,
    },
}

/// Snapshot reported by the `Status` method.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub enrolled: usize,
    pub workers: usize,
    pub strict_mode: bool,
    pub threshold: f64,
}

/// Clone-safe handle to the worker pool.
///
/// Recognition runs on dedicated OS threads; store lookups that do not touch
/// pixels go through `spawn_blocking` instead of queueing behind them.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    service: Arc<FacialAuthService>,
    workers: usize,
    timeout: Duration,
}

impl EngineHandle {
    pub async fn enroll(&self, identity: String, image: Vec<u8>) -> Result<EnrollOutcome, EngineError> {
        self.request(|reply| EngineRequest::Enroll { identity, image, reply })
            .await
    }

    pub async fn authenticate(&self, image: Vec<u8>) -> Result<AuthOutcome, EngineError> {
        self.request(|reply| EngineRequest::Authenticate { image, reply })
            .await
    }

    pub async fn verify(&self, identity: String, image: Vec<u8>) -> Result<AuthOutcome, EngineError> {
        self.request(|reply| EngineRequest::Verify { identity, image, reply })
            .await
    }

    pub async fn has_enrollment(&self, identity: String) -> Result<bool, EngineError> {
        self.blocking(move |svc| Ok(svc.has_enrollment(&identity)?))
            .await
    }

    pub async fn remove_enrollment(&self, identity: String) -> Result<bool, EngineError> {
        self.blocking(move |svc| Ok(svc.remove_enrollment(&identity)?))
            .await
    }

    /// Drop the known-face cache so the next search rereads the store.
    pub fn reload(&self) {
        self.service.reload();
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let workers = self.workers;
        self.blocking(move |svc| {
            Ok(EngineStatus {
                enrolled: svc.enrolled_count()?,
                workers,
                strict_mode: svc.config().strict_mode,
                threshold: svc.engine().threshold(),
            })
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed),
            Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn blocking<T: Send + 'static>(
        &self,
        op: impl FnOnce(&FacialAuthService) -> Result<T, EngineError> + Send + 'static,
    ) -> Result<T, EngineError> {
        let service = Arc::clone(&self.service);
        let task = tokio::task::spawn_blocking(move || op(&service));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined.map_err(|_| EngineError::ChannelClosed)?,
            Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// Spawn `workers` recognition threads sharing one request queue.
///
/// A request whose caller has already timed out is still processed; its
/// reply is dropped.
pub fn spawn_pool(
    service: Arc<FacialAuthService>,
    workers: usize,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * 4);
    let rx = Arc::new(Mutex::new(rx));

    for index in 0..workers {
        let rx = Arc::clone(&rx);
        let service = Arc::clone(&service);
        std::thread::Builder::new()
            .name(format!("faceid-worker-{index}"))
            .spawn(move || worker_loop(index, &rx, &service))
            .map_err(EngineError::Spawn)?;
    }
    tracing::info!(workers, timeout_secs = timeout.as_secs(), "engine workers started");

    Ok(EngineHandle {
        tx,
        service,
        workers,
        timeout,
    })
}

fn worker_loop(index: usize, rx: &Mutex<mpsc::Receiver<EngineRequest>>, service: &FacialAuthService) {
    tracing::debug!(worker = index, "engine worker started");
    loop {
        // The lock is held only while waiting; processing runs unlocked.
        let next = {
            let mut guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.blocking_recv()
        };
        let Some(req) = next else { break };
        match req {
            EngineRequest::Enroll { identity, image, reply } => {
                let _ = reply.send(service.enroll(&identity, &image));
            }
            EngineRequest::Authenticate { image, reply } => {
                let _ = reply.send(service.authenticate(&image));
            }
            EngineRequest::Verify { identity, image, reply } => {
                let _ = reply.send(service.verify(&identity, &image));
            }
        }
    }
    tracing::debug!(worker = index, "engine worker exiting");
}
