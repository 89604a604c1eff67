//! Narrow interface to the remote model service
//!
//! The pipeline only ever talks to the server through [`ModelService`]. The gRPC
//! adapter in [`crate::grpc`] implements it for real servers; tests implement it
//! with in-memory fakes.

use async_trait::async_trait;
use prost::bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::RemoteError;
use crate::lock::{CheckoutEpoch, LockRequest};
use crate::session::{ModelIdentity, ServiceModelSessionToken, ServiceSessionToken};

/// Readable download body
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Response of a download call
///
/// Servers expose the body in different shapes; each probe returns `None` when
/// the envelope does not carry that shape. Probes are consulted in declaration
/// order by [`crate::retrieval::extract_payload`].
pub trait DownloadEnvelope: Send {
    /// Body already exposed as a stream
    fn take_stream(&mut self) -> Option<PayloadReader> {
        None
    }

    /// Body obtained through an accessor that opens a reader
    fn open_reader(&mut self) -> Option<PayloadReader> {
        None
    }

    /// Body materialized as one buffer
    fn take_buffer(&mut self) -> Option<Bytes> {
        None
    }

    /// Envelope that is itself the raw body
    fn take_raw(&mut self) -> Option<Vec<u8>> {
        None
    }
}

impl DownloadEnvelope for Vec<u8> {
    fn take_raw(&mut self) -> Option<Vec<u8>> {
        (!self.is_empty()).then(|| std::mem::take(self))
    }
}

/// Operations the export pipeline calls on the remote model service
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Resolve a server-native relative path to the model's identity
    async fn identify_model(
        &self,
        token: &ServiceSessionToken,
        relative_path: &str,
    ) -> Result<ModelIdentity, RemoteError>;

    /// Acquire a checkout lock; returns the epoch pinning later reads
    async fn lock_data(
        &self,
        token: &ServiceModelSessionToken,
        request: &LockRequest,
    ) -> Result<CheckoutEpoch, RemoteError>;

    /// Complete data-file manifest of the model
    async fn list_data_files(
        &self,
        token: &ServiceModelSessionToken,
    ) -> Result<Vec<String>, RemoteError>;

    async fn download_file(
        &self,
        token: &ServiceModelSessionToken,
        epoch: &CheckoutEpoch,
        source_name: &str,
    ) -> Result<Box<dyn DownloadEnvelope>, RemoteError>;
}
