//! Proxy provider backed by tonic channels

use async_trait::async_trait;
use std::sync::Arc;

use super::channel::TonicChannelFactory;
use crate::config::TransportConfig;
use crate::contract::{
    ClientProxy, EndpointTemplates, FactoryCall, ProxyMode, ProxyProvider, ServiceContract,
};
use crate::error::{PipelineError, PipelineResult};
use crate::transport::{ChannelBinding, ChannelFactory, TransferMode};

/// Hands out opened gRPC channels for the endpoints a manifest declares
#[derive(Debug, Clone)]
pub struct GrpcProxyProvider {
    version: String,
    endpoints: EndpointTemplates,
    transport: TransportConfig,
}

impl GrpcProxyProvider {
    pub fn new(
        version: impl Into<String>,
        endpoints: EndpointTemplates,
        transport: TransportConfig,
    ) -> Self {
        Self {
            version: version.into(),
            endpoints,
            transport,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn endpoint(&self, mode: ProxyMode, host: &str) -> Option<String> {
        self.endpoints.render(mode, host, &self.version)
    }
}

/// Routed proxies stream through a router endpoint
fn transfer_mode(mode: ProxyMode) -> TransferMode {
    match mode {
        ProxyMode::Streamed | ProxyMode::Routed => TransferMode::Streamed,
        ProxyMode::Buffered => TransferMode::Buffered,
    }
}

#[async_trait]
impl ProxyProvider for GrpcProxyProvider {
    fn capabilities(&self) -> Vec<ProxyMode> {
        self.endpoints.modes()
    }

    async fn proxy(
        &self,
        mode: ProxyMode,
        host: &str,
        contract: &ServiceContract,
    ) -> PipelineResult<ClientProxy> {
        let address = self.endpoint(mode, host).ok_or_else(|| {
            PipelineError::ContractNotFound(format!("no {} endpoint declared", mode))
        })?;

        let factory = Arc::new(TonicChannelFactory::new(contract.clone()));
        let binding = ChannelBinding::new(transfer_mode(mode), &self.transport);
        let mut channel = factory.create(&address, binding)?;

        tracing::info!(host, mode = %mode, address = %address, "Opening model service proxy");
        channel.open().await?;

        Ok(ClientProxy {
            mode,
            channel,
            factory,
        })
    }
}

/// Constructor registered under the built-in gRPC implementation key
pub fn construct(call: &FactoryCall<'_>) -> PipelineResult<Arc<dyn ProxyProvider>> {
    let endpoints = call.type_decl.endpoints.clone().ok_or_else(|| {
        PipelineError::Config(format!("{} declares no endpoints", call.type_decl.name))
    })?;

    let version = call
        .args
        .first()
        .cloned()
        .unwrap_or_else(|| call.context.version.clone());

    Ok(Arc::new(GrpcProxyProvider::new(
        version,
        endpoints,
        call.context.transport.clone(),
    )))
}
