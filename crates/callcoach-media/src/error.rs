use callcoach_types::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("no workers available, initialize the pool first")]
    NoWorkersInitialized,

    #[error("no available worker found")]
    NoWorkerAvailable,

    #[error("media worker {0} is unavailable")]
    WorkerUnavailable(usize),

    #[error("router {0} is closed")]
    RouterClosed(String),

    #[error("transport {0} is closed")]
    TransportClosed(String),

    #[error("transport {0} is already connected")]
    AlreadyConnected(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),
}

impl From<MediaError> for AppError {
    fn from(err: MediaError) -> Self {
        match &err {
            MediaError::NoWorkersInitialized
            | MediaError::NoWorkerAvailable
            | MediaError::WorkerUnavailable(_) => {
                AppError::upstream("WORKER_UNAVAILABLE", err.to_string(), err)
            }
            MediaError::ProducerNotFound(_) => {
                AppError::not_found("PRODUCER_NOT_FOUND", err.to_string())
            }
            MediaError::RouterClosed(_) => {
                AppError::not_found("ROUTER_CLOSED", err.to_string())
            }
            MediaError::TransportClosed(_) => {
                AppError::validation("TRANSPORT_CLOSED", err.to_string())
            }
            MediaError::AlreadyConnected(_) => {
                AppError::validation("TRANSPORT_ALREADY_CONNECTED", err.to_string())
            }
        }
    }
}
