//! Model Export - checkout and export of versioned models
//!
//! Locks a model on a remote model server, downloads its data files over a
//! dynamically resolved gRPC contract and reassembles them into one
//! self-contained artifact.

pub mod config;
pub mod contract;
pub mod error;
pub mod exporter;
pub mod grpc;
pub mod lock;
pub mod metrics;
pub mod reassemble;
pub mod retrieval;
pub mod service;
pub mod session;
pub mod staging;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use config::{ExporterConfig, TransportConfig};
pub use error::{ExportError, ExportResult, PipelineError, PipelineResult, Stage};
pub use exporter::{CheckoutPipeline, ExportOptions, Exporter};
pub use reassemble::DataFormatVersion;
pub use retrieval::{NoProgress, Progress};
pub use service::ModelService;
pub use session::{ClientIdentity, LogicalModelPath};
