use manifest_cache_common::{blob::BlobError, fetch::FetchError, queue::QueueError};
use thiserror::Error;

/// Enumeration of errors from caching the manifest referenced by one document.
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("error parsing document: {0}")]
    Parse(#[from] roxmltree::Error),
    #[error("empty or nonsensical manifest URL [{0}]")]
    BadUrl(String),
    #[error("error fetching manifest: {0}")]
    Fetch(#[from] FetchError),
    #[error("error storing manifest: {0}")]
    Store(#[from] BlobError),
}

impl RewriteError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            RewriteError::Encoding(_) | RewriteError::Parse(_) => "parse",
            RewriteError::BadUrl(_) => "bad_url",
            RewriteError::Fetch(_) => "fetch",
            RewriteError::Store(_) => "store",
        }
    }
}

/// Failures of a whole batch. Anything reported here is fatal to the process.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("publishing to the outbound queue failed: {0}")]
    Publish(#[source] QueueError),
    #[error("deleting from the inbound queue failed: {0}")]
    Delete(#[source] QueueError),
}

/// Enumeration of errors related to initialization and running of the service.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker {worker} failed to process a block: {error}")]
    Reconcile {
        worker: usize,
        #[source]
        error: ReconcileError,
    },
    #[error("polling the inbound queue failed: {0}")]
    Poll(#[source] QueueError),
    #[error("failed to resolve queue: {0}")]
    Queue(#[source] QueueError),
    #[error("failed to initialize worker: {0}")]
    Init(#[from] FetchError),
}
