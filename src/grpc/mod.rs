//! gRPC adapter for the remote model service
//!
//! Message types are declared by hand in [`proto`]; method paths come from the
//! contract manifest, so the same client serves every server version.

pub mod channel;
pub mod client;
pub mod proto;
pub mod provider;
pub mod service;

pub use channel::{TonicChannel, TonicChannelFactory};
pub use client::ContractClient;
pub use provider::GrpcProxyProvider;
pub use service::GrpcModelService;

/// Metadata key carrying the server's fault detail
pub const FAULT_DETAIL_METADATA: &str = "fault-detail";
