//! Error types for the export pipeline

use std::fmt;

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Option validation, before any remote work
    Prepare,
    /// Contract loading, provider construction and channel setup
    Provider,
    Session,
    Identify,
    Lock,
    Download,
    Reassemble,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Provider => "provider",
            Self::Session => "session",
            Self::Identify => "identify",
            Self::Lock => "lock",
            Self::Download => "download",
            Self::Reassemble => "reassemble",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault returned by the remote server, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFault {
    pub code: tonic::Code,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " Detail={}", detail)?;
        }
        Ok(())
    }
}

/// Outcome of a failed remote call
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("server fault: {0}")]
    Fault(RemoteFault),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn fault(code: tonic::Code, message: impl Into<String>, detail: Option<String>) -> Self {
        Self::Fault(RemoteFault {
            code,
            message: message.into(),
            detail,
        })
    }
}

impl From<tonic::Status> for RemoteError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
                Self::Transport(status.message().to_string())
            }
            code => {
                let detail = status
                    .metadata()
                    .get(crate::grpc::FAULT_DETAIL_METADATA)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .or_else(|| {
                        let details = status.details();
                        (!details.is_empty())
                            .then(|| String::from_utf8_lossy(details).into_owned())
                    });
                Self::fault(code, status.message(), detail)
            }
        }
    }
}

impl From<tonic::transport::Error> for RemoteError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Every failure the pipeline can produce
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("contract binding not found: {0}")]
    ContractNotFound(String),

    #[error("contract binding '{name}' is ambiguous between: {}", candidates.join(", "))]
    ContractAmbiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("invalid contract manifest: {0}")]
    Config(String),

    #[error("missing client identity: {0} is empty")]
    MissingIdentity(&'static str),

    #[error("invalid model path '{0}'")]
    InvalidModelPath(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("lock denied by server: {0}")]
    RemoteLockDenied(RemoteFault),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("server fault: {0}")]
    RemoteFault(RemoteFault),

    #[error("invalid manifest entry '{0}'")]
    InvalidManifestEntry(String),

    #[error("download response for '{0}' carries no payload")]
    NoPayloadFound(String),

    #[error("incomplete staging set: {0}")]
    IncompleteStagingSet(String),

    #[error("reassembly failed: {0}")]
    ReassemblyFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Server fault detail, when the failure came from the remote server
    pub fn remote_fault(&self) -> Option<&RemoteFault> {
        match self {
            Self::RemoteLockDenied(fault) | Self::RemoteFault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Attach the stage this error surfaced in
    pub fn at(self, stage: Stage) -> ExportError {
        ExportError {
            stage,
            source: self,
        }
    }
}

impl From<RemoteError> for PipelineError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Fault(fault) => Self::RemoteFault(fault),
            RemoteError::Transport(msg) => Self::TransportError(msg),
        }
    }
}

/// Tagged error surfaced by the exporter
#[derive(Debug, thiserror::Error)]
#[error("[{stage}] {source}")]
pub struct ExportError {
    pub stage: Stage,
    pub source: PipelineError,
}

impl ExportError {
    pub fn remote_detail(&self) -> Option<&str> {
        self.source
            .remote_fault()
            .and_then(|fault| fault.detail.as_deref())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ExportResult<T> = Result<T, ExportError>;
