//! Transport negotiation for multi-gigabyte payloads
//!
//! Channel limits are baked in when a channel opens, so an opened channel is
//! never reconfigured in place. The negotiator builds a replacement channel with
//! large-message limits, opens it, and only then closes the original. If any step
//! fails the original channel is handed back untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::contract::ServiceContract;
use crate::error::{PipelineError, PipelineResult, RemoteError};
use crate::service::ModelService;

/// Message ceiling a freshly created binding starts with
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Buffer needed by streamed transfer (headers only)
pub const STREAMED_BUFFER_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Body flows as a sequence of chunks
    Streamed,
    /// Whole message materialized in memory; size must fit a 32-bit length
    Buffered,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streamed => "streamed",
            Self::Buffered => "buffered",
        }
    }
}

/// Decoder limits applied to incoming messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeQuotas {
    pub max_depth: u32,
    pub max_string_content_length: u32,
    pub max_array_length: u32,
    pub max_bytes_per_read: u32,
}

impl DecodeQuotas {
    pub const fn permissive() -> Self {
        let max = i32::MAX as u32;
        Self {
            max_depth: max,
            max_string_content_length: max,
            max_array_length: max,
            max_bytes_per_read: max,
        }
    }
}

impl Default for DecodeQuotas {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_string_content_length: 8192,
            max_array_length: 16384,
            max_bytes_per_read: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    pub open: Duration,
    pub close: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl ChannelTimeouts {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            open: Duration::from_secs(config.open_timeout_secs),
            close: Duration::from_secs(config.close_timeout_secs),
            send: Duration::from_secs(config.send_timeout_secs),
            receive: Duration::from_secs(config.receive_timeout_secs),
        }
    }
}

/// Transport settings of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub transfer_mode: TransferMode,
    pub max_message_size: u64,
    pub max_buffer_size: u64,
    pub quotas: DecodeQuotas,
    pub timeouts: ChannelTimeouts,
    pub tls: bool,
    pub ca_certificate: Option<PathBuf>,
    pub accept_gzip: bool,
}

impl ChannelBinding {
    /// Binding with runtime-default limits
    pub fn new(transfer_mode: TransferMode, config: &TransportConfig) -> Self {
        Self {
            transfer_mode,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_buffer_size: DEFAULT_MAX_MESSAGE_SIZE,
            quotas: DecodeQuotas::default(),
            timeouts: ChannelTimeouts::from_config(config),
            tls: config.tls,
            ca_certificate: config.ca_certificate.clone(),
            accept_gzip: config.accept_gzip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Opened,
    Closed,
}

/// Client channel bound to one service contract and endpoint
#[async_trait]
pub trait RpcChannel: Send + Sync {
    fn contract(&self) -> &ServiceContract;

    fn state(&self) -> ChannelState;

    /// Endpoint address the channel talks to
    fn remote_address(&self) -> Option<String>;

    fn binding(&self) -> &ChannelBinding;

    /// Mutable binding; `None` once the channel has left the `Created` state
    fn binding_mut(&mut self) -> Option<&mut ChannelBinding>;

    async fn open(&mut self) -> Result<(), RemoteError>;

    async fn close(&mut self) -> Result<(), RemoteError>;

    /// Service handle; only available while the channel is open
    fn service(&self) -> PipelineResult<Arc<dyn ModelService>>;
}

/// Creates channels for one service contract
pub trait ChannelFactory: Send + Sync {
    fn contract(&self) -> &ServiceContract;

    fn create(
        &self,
        endpoint: &str,
        binding: ChannelBinding,
    ) -> PipelineResult<Box<dyn RpcChannel>>;
}

/// Raises channel limits to the configured large-message ceilings
#[derive(Debug, Clone)]
pub struct TransportNegotiator {
    config: TransportConfig,
}

impl TransportNegotiator {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Transfer mode implied by an endpoint address; first matching rule wins
    pub fn infer_transfer_mode(&self, address: &str, current: TransferMode) -> TransferMode {
        let address = address.to_ascii_lowercase();
        self.config
            .transfer_mode_rules
            .iter()
            .find(|rule| address.contains(&rule.pattern.to_ascii_lowercase()))
            .map(|rule| rule.mode)
            .unwrap_or(current)
    }

    /// Set message, buffer and quota limits for the binding's transfer mode
    pub fn raise_limits(&self, binding: &mut ChannelBinding) {
        match binding.transfer_mode {
            TransferMode::Buffered => {
                binding.max_message_size = self.config.buffered_message_ceiling;
                binding.max_buffer_size = self.config.buffered_message_ceiling;
            }
            TransferMode::Streamed => {
                binding.max_message_size = self.config.streamed_message_ceiling;
                binding.max_buffer_size = STREAMED_BUFFER_SIZE;
            }
        }
        binding.quotas = DecodeQuotas::permissive();
    }

    /// Fresh binding configured for large messages
    pub fn large_message_binding(&self, mode: TransferMode) -> ChannelBinding {
        let mut binding = ChannelBinding::new(mode, &self.config);
        self.raise_limits(&mut binding);
        binding
    }

    /// Raise limits in place; returns false when the binding is no longer mutable
    pub fn configure_channel(&self, channel: &mut dyn RpcChannel) -> bool {
        match channel.binding_mut() {
            Some(binding) => {
                self.raise_limits(binding);
                true
            }
            None => false,
        }
    }

    /// Return a channel able to carry large payloads
    ///
    /// Unopened channels are reconfigured in place. Opened channels are replaced;
    /// on any replacement failure the original channel is returned unchanged.
    pub async fn ensure_large_message_capable(
        &self,
        mut channel: Box<dyn RpcChannel>,
        factory: &dyn ChannelFactory,
    ) -> Box<dyn RpcChannel> {
        if channel.state() != ChannelState::Opened {
            if !self.configure_channel(channel.as_mut()) {
                tracing::debug!(
                    state = ?channel.state(),
                    "Channel binding not mutable, left as is"
                );
            }
            return channel;
        }

        match self.open_replacement(channel.as_ref(), factory).await {
            Ok(replacement) => {
                let close_timeout = channel.binding().timeouts.close;
                match tokio::time::timeout(close_timeout, channel.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(
                            error = %e,
                            "Failed to close original channel after replacement"
                        )
                    }
                    Err(_) => {
                        tracing::warn!("Timed out closing original channel after replacement")
                    }
                }
                crate::metrics::record_channel_replacement("replaced");
                tracing::info!(
                    address = ?replacement.remote_address(),
                    transfer_mode = replacement.binding().transfer_mode.as_str(),
                    max_message_size = replacement.binding().max_message_size,
                    "Replaced channel with large-message binding"
                );
                replacement
            }
            Err(e) => {
                crate::metrics::record_channel_replacement("kept_original");
                tracing::warn!(
                    error = %e,
                    "Channel replacement failed, keeping original channel"
                );
                channel
            }
        }
    }

    async fn open_replacement(
        &self,
        original: &dyn RpcChannel,
        factory: &dyn ChannelFactory,
    ) -> PipelineResult<Box<dyn RpcChannel>> {
        let address = original.remote_address().ok_or_else(|| {
            PipelineError::TransportError("channel has no remote address".to_string())
        })?;

        if factory.contract() != original.contract() {
            return Err(PipelineError::TransportError(format!(
                "factory contract '{}' does not match channel contract '{}'",
                factory.contract().name,
                original.contract().name
            )));
        }

        let mode = self.infer_transfer_mode(&address, original.binding().transfer_mode);
        let binding = self.large_message_binding(mode);
        let open_timeout = binding.timeouts.open;

        let mut replacement = factory.create(&address, binding)?;
        let opened = match tokio::time::timeout(open_timeout, replacement.open()).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::TransportError(format!(
                "opening replacement channel to {} timed out",
                address
            ))),
        };

        if let Err(e) = opened {
            if replacement.state() == ChannelState::Opened {
                let _ = replacement.close().await;
            }
            return Err(e);
        }

        Ok(replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferModeRule;
    use crate::testing::{FakeChannel, FakeChannelFactory, test_contract};

    fn negotiator() -> TransportNegotiator {
        TransportNegotiator::new(TransportConfig::default())
    }

    #[test]
    fn test_infer_transfer_mode() {
        let n = negotiator();
        assert_eq!(
            n.infer_transfer_mode("http://rs1/ModelService/Streamed", TransferMode::Buffered),
            TransferMode::Streamed
        );
        assert_eq!(
            n.infer_transfer_mode("http://rs1/ModelService/buffered", TransferMode::Streamed),
            TransferMode::Buffered
        );
        assert_eq!(
            n.infer_transfer_mode("http://rs1/ModelService", TransferMode::Buffered),
            TransferMode::Buffered
        );
    }

    #[test]
    fn test_infer_transfer_mode_custom_rules() {
        let config = TransportConfig {
            transfer_mode_rules: vec![TransferModeRule {
                pattern: "bulk".to_string(),
                mode: TransferMode::Streamed,
            }],
            ..Default::default()
        };
        let n = TransportNegotiator::new(config);
        assert_eq!(
            n.infer_transfer_mode("http://rs1/bulk", TransferMode::Buffered),
            TransferMode::Streamed
        );
        assert_eq!(
            n.infer_transfer_mode("http://rs1/stream", TransferMode::Buffered),
            TransferMode::Buffered
        );
    }

    #[test]
    fn test_large_message_binding_limits() {
        let n = negotiator();

        let buffered = n.large_message_binding(TransferMode::Buffered);
        assert_eq!(buffered.max_message_size, i32::MAX as u64);
        assert_eq!(buffered.max_buffer_size, i32::MAX as u64);

        let streamed = n.large_message_binding(TransferMode::Streamed);
        assert_eq!(streamed.max_message_size, 8 * 1024 * 1024 * 1024);
        assert_eq!(streamed.max_buffer_size, STREAMED_BUFFER_SIZE);
        assert_eq!(streamed.quotas, DecodeQuotas::permissive());
    }

    #[tokio::test]
    async fn test_unopened_channel_configured_in_place() {
        let n = negotiator();
        let factory = FakeChannelFactory::new(test_contract());
        let channel = FakeChannel::boxed(test_contract(), "http://rs1/streamed");

        let channel = n.ensure_large_message_capable(channel, &factory).await;

        assert_eq!(channel.state(), ChannelState::Created);
        assert_eq!(channel.binding().max_message_size, 8 * 1024 * 1024 * 1024);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_opened_channel_replaced() {
        let n = negotiator();
        let factory = FakeChannelFactory::new(test_contract());
        let (channel, original) =
            FakeChannel::opened(test_contract(), "http://rs1/ModelService/buffered");

        let channel = n.ensure_large_message_capable(channel, &factory).await;

        assert_eq!(factory.created(), 1);
        assert_eq!(channel.state(), ChannelState::Opened);
        assert_eq!(channel.binding().transfer_mode, TransferMode::Buffered);
        assert_eq!(channel.binding().max_message_size, i32::MAX as u64);
        assert_eq!(original.state(), ChannelState::Closed);
        assert!(channel.service().is_ok());
    }

    #[tokio::test]
    async fn test_replacement_open_failure_keeps_original() {
        let n = negotiator();
        let factory = FakeChannelFactory::new(test_contract()).failing_open();
        let (channel, original) = FakeChannel::opened(test_contract(), "http://rs1/streamed");

        let channel = n.ensure_large_message_capable(channel, &factory).await;

        assert_eq!(factory.created(), 1);
        assert_eq!(channel.state(), ChannelState::Opened);
        assert_eq!(original.state(), ChannelState::Opened);
        assert_eq!(channel.binding().max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(channel.service().is_ok());
    }

    #[tokio::test]
    async fn test_replacement_create_failure_keeps_original() {
        let n = negotiator();
        let factory = FakeChannelFactory::new(test_contract()).failing_create();
        let (channel, original) = FakeChannel::opened(test_contract(), "http://rs1/streamed");

        let channel = n.ensure_large_message_capable(channel, &factory).await;

        assert_eq!(channel.state(), ChannelState::Opened);
        assert_eq!(original.state(), ChannelState::Opened);
    }

    #[tokio::test]
    async fn test_contract_mismatch_keeps_original() {
        let n = negotiator();
        let mut other = test_contract();
        other.name = "Other.IService".to_string();
        let factory = FakeChannelFactory::new(other);
        let (channel, original) = FakeChannel::opened(test_contract(), "http://rs1/streamed");

        let channel = n.ensure_large_message_capable(channel, &factory).await;

        assert_eq!(factory.created(), 0);
        assert_eq!(channel.state(), ChannelState::Opened);
        assert_eq!(original.state(), ChannelState::Opened);
    }

    #[tokio::test]
    async fn test_channel_without_address_kept() {
        let n = negotiator();
        let factory = FakeChannelFactory::new(test_contract());
        let (channel, original) = FakeChannel::opened(test_contract(), "");

        let channel = n.ensure_large_message_capable(channel, &factory).await;

        assert_eq!(factory.created(), 0);
        assert_eq!(channel.state(), ChannelState::Opened);
        assert_eq!(original.state(), ChannelState::Opened);
    }
}
