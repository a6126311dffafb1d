//! Central error type shared by the reconciler, composer, credential manager,
//! and persistence coordinator. Classified per the error taxonomy so the
//! reconciler knows whether to retry, fail the session, or repair silently.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes API error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("object storage error: {0}")]
    ObjectStore(String),

    #[error("invalid session spec: {0}")]
    InvalidSpec(String),

    #[error("missing required credential: {0}")]
    MissingCredential(String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("session record is missing required metadata: {0}")]
    MissingMetadata(String),

    #[error("reconcile exceeded its soft deadline of {0:?}")]
    DeadlineExceeded(std::time::Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Class 1-2 transient errors: the reconcile function should return them
    /// so the work queue requeues under backoff. Everything else is either a
    /// permanent spec/workload error (surfaced via `status.phase = Failed`)
    /// or an invariant violation the controller repairs silently; neither
    /// should propagate as a reconcile error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            Error::ObjectStore(_) => true,
            Error::InvalidSpec(_) | Error::MissingCredential(_) | Error::MissingMetadata(_) => {
                false
            }
            Error::Json { .. } => false,
            Error::DeadlineExceeded(_) => true,
        }
    }
}

fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => matches!(resp.code, 409 | 429 | 500..=599),
        kube::Error::Auth(_) | kube::Error::Service(_) => true,
        _ => true,
    }
}
