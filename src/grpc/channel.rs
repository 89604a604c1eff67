//! tonic-backed [`RpcChannel`]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tonic::codegen::http::Uri;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};

use super::client::ContractClient;
use super::service::GrpcModelService;
use crate::contract::ServiceContract;
use crate::error::{PipelineError, PipelineResult, RemoteError};
use crate::service::ModelService;
use crate::transport::{ChannelBinding, ChannelFactory, ChannelState, RpcChannel};

/// Endpoint origin (`scheme://authority`) and path prefix of an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub origin: String,
    pub path_prefix: String,
    pub tls: bool,
}

impl EndpointAddress {
    /// Split an endpoint URL; `force_tls` upgrades plain http to https
    pub fn parse(address: &str, force_tls: bool) -> Result<Self, RemoteError> {
        let uri: Uri = address
            .parse()
            .map_err(|e| RemoteError::Transport(format!("Invalid endpoint '{}': {}", address, e)))?;
        let authority = uri
            .authority()
            .ok_or_else(|| RemoteError::Transport(format!("Endpoint '{}' has no host", address)))?;

        let tls = force_tls || uri.scheme_str() == Some("https");
        let scheme = if tls { "https" } else { "http" };
        let path_prefix = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            origin: format!("{}://{}", scheme, authority),
            path_prefix,
            tls,
        })
    }
}

async fn build_endpoint(
    address: &EndpointAddress,
    binding: &ChannelBinding,
) -> Result<Endpoint, RemoteError> {
    let mut endpoint = Endpoint::from_shared(address.origin.clone())?
        .connect_timeout(binding.timeouts.open)
        .timeout(binding.timeouts.receive)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true)
        .initial_stream_window_size(window_size(binding.max_buffer_size))
        .initial_connection_window_size(window_size(binding.max_buffer_size));

    if address.tls {
        let mut tls = ClientTlsConfig::new().with_native_roots();
        if let Some(ca_path) = &binding.ca_certificate {
            let ca = tokio::fs::read(ca_path).await.map_err(|e| {
                RemoteError::Transport(format!("Failed to read CA {:?}: {}", ca_path, e))
            })?;
            tls = tls.ca_certificate(Certificate::from_pem(ca));
        }
        endpoint = endpoint.tls_config(tls)?;
    }

    Ok(endpoint)
}

/// HTTP/2 flow-control window sized from the binding's buffer limit
fn window_size(max_buffer_size: u64) -> Option<u32> {
    const MIN_WINDOW: u32 = 64 * 1024;
    let window = u32::try_from(max_buffer_size).unwrap_or(i32::MAX as u32);
    Some(window.clamp(MIN_WINDOW, i32::MAX as u32))
}

pub struct TonicChannel {
    contract: ServiceContract,
    address: String,
    binding: ChannelBinding,
    state: ChannelState,
    service: Option<Arc<GrpcModelService>>,
}

impl TonicChannel {
    pub fn new(
        contract: ServiceContract,
        address: impl Into<String>,
        binding: ChannelBinding,
    ) -> Self {
        Self {
            contract,
            address: address.into(),
            binding,
            state: ChannelState::Created,
            service: None,
        }
    }
}

#[async_trait]
impl RpcChannel for TonicChannel {
    fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    fn state(&self) -> ChannelState {
        self.state
    }

    fn remote_address(&self) -> Option<String> {
        (!self.address.is_empty()).then(|| self.address.clone())
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    fn binding_mut(&mut self) -> Option<&mut ChannelBinding> {
        match self.state {
            ChannelState::Created => Some(&mut self.binding),
            _ => None,
        }
    }

    async fn open(&mut self) -> Result<(), RemoteError> {
        if self.state != ChannelState::Created {
            return Err(RemoteError::Transport(format!(
                "channel to {} cannot be opened from state {:?}",
                self.address, self.state
            )));
        }

        let address = EndpointAddress::parse(&self.address, self.binding.tls)?;
        let endpoint = build_endpoint(&address, &self.binding).await?;
        let channel = endpoint.connect().await?;

        let client = ContractClient::new(
            channel,
            self.contract.operations.clone(),
            address.path_prefix,
            &self.binding,
        );
        let service = GrpcModelService::new(client, self.binding.quotas);
        self.service = Some(Arc::new(service));
        self.state = ChannelState::Opened;

        tracing::debug!(
            address = %self.address,
            transfer_mode = self.binding.transfer_mode.as_str(),
            max_message_size = self.binding.max_message_size,
            "Opened gRPC channel"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        // dropping the last client handle tears the connection down
        self.service = None;
        self.state = ChannelState::Closed;
        tracing::debug!(address = %self.address, "Closed gRPC channel");
        Ok(())
    }

    fn service(&self) -> PipelineResult<Arc<dyn ModelService>> {
        match (&self.state, &self.service) {
            (ChannelState::Opened, Some(service)) => {
                let service: Arc<dyn ModelService> = service.clone();
                Ok(service)
            }
            _ => Err(PipelineError::TransportError(format!(
                "channel to {} is not open",
                self.address
            ))),
        }
    }
}

/// Creates [`TonicChannel`]s for one contract
#[derive(Debug, Clone)]
pub struct TonicChannelFactory {
    contract: ServiceContract,
}

impl TonicChannelFactory {
    pub fn new(contract: ServiceContract) -> Self {
        Self { contract }
    }
}

impl ChannelFactory for TonicChannelFactory {
    fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    fn create(
        &self,
        endpoint: &str,
        binding: ChannelBinding,
    ) -> PipelineResult<Box<dyn RpcChannel>> {
        EndpointAddress::parse(endpoint, binding.tls)?;
        Ok(Box::new(TonicChannel::new(
            self.contract.clone(),
            endpoint,
            binding,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::testing::test_contract;
    use crate::transport::TransferMode;

    #[test]
    fn test_parse_endpoint_address() {
        let address =
            EndpointAddress::parse("http://rs1:8088/ModelService/2024/streamed/", false).unwrap();
        assert_eq!(address.origin, "http://rs1:8088");
        assert_eq!(address.path_prefix, "/ModelService/2024/streamed");
        assert!(!address.tls);

        let address = EndpointAddress::parse("https://rs1", false).unwrap();
        assert_eq!(address.origin, "https://rs1");
        assert_eq!(address.path_prefix, "");
        assert!(address.tls);

        let address = EndpointAddress::parse("http://rs1:8088", true).unwrap();
        assert_eq!(address.origin, "https://rs1:8088");
    }

    #[test]
    fn test_parse_endpoint_without_host() {
        assert!(matches!(
            EndpointAddress::parse("/relative/only", false),
            Err(RemoteError::Transport(_))
        ));
    }

    #[test]
    fn test_window_size_bounds() {
        assert_eq!(window_size(1024), Some(64 * 1024));
        assert_eq!(window_size(u64::MAX), Some(i32::MAX as u32));
    }

    #[test]
    fn test_channel_binding_frozen_after_close() {
        let binding = ChannelBinding::new(TransferMode::Streamed, &TransportConfig::default());
        let mut channel = TonicChannel::new(test_contract(), "http://rs1:8088", binding);
        assert!(channel.binding_mut().is_some());
        assert!(channel.service().is_err());

        tokio_test::block_on(channel.close()).unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.binding_mut().is_none());
    }

    #[tokio::test]
    async fn test_open_unreachable_endpoint_fails() {
        let config = TransportConfig {
            open_timeout_secs: 1,
            ..Default::default()
        };
        let binding = ChannelBinding::new(TransferMode::Streamed, &config);
        let mut channel = TonicChannel::new(test_contract(), "http://127.0.0.1:1", binding);

        let err = channel.open().await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)));
        assert_eq!(channel.state(), ChannelState::Created);
    }

    #[test]
    fn test_factory_rejects_bad_endpoint() {
        let factory = TonicChannelFactory::new(test_contract());
        let binding = ChannelBinding::new(TransferMode::Buffered, &TransportConfig::default());
        assert!(factory.create("not a url", binding).is_err());
    }
}
