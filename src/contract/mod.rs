//! Externally supplied service contracts
//!
//! Contract manifests describe the proxy provider and the model service the
//! pipeline talks to. The [`loader`] finds and loads them, the [`resolver`] turns
//! logical type names into a [`ProxyProvider`] and a [`ServiceContract`].

pub mod loader;
pub mod manifest;
pub mod resolver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::TransportConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::transport::{ChannelFactory, RpcChannel};

pub use loader::{LibraryLoader, LoadedLibrary};
pub use manifest::{EndpointTemplates, EntryPoint, EntryPointKind, LibraryManifest, TypeDecl};
pub use resolver::{ContractResolver, EntryPointSpec, FACTORY_ENTRY_POINTS, TypeHandle};

/// Library declaring the proxy provider
pub const PROXY_LIBRARY: &str = "ModelServer.Enterprise.Proxy";

/// Library declaring the model service contract
pub const MODEL_CONTRACT_LIBRARY: &str =
    "ModelServer.Enterprise.Common.ClientServer.ServiceContract";

pub const PROXY_PROVIDER_TYPE: &str = "ModelServer.Enterprise.Proxy.ProxyProvider";

pub const MODEL_SERVICE_TYPE: &str =
    "ModelServer.Enterprise.Common.ClientServer.ServiceContract.Model.IModelService";

/// Implementation key of the built-in gRPC proxy provider
pub const GRPC_PROXY_PROVIDER: &str = "grpc-proxy-provider";

/// Kind of client proxy a provider hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Streamed,
    Buffered,
    Routed,
}

impl ProxyMode {
    /// Order in which proxy modes are preferred
    pub const PREFERENCE: [ProxyMode; 3] = [Self::Streamed, Self::Routed, Self::Buffered];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streamed => "streamed",
            Self::Buffered => "buffered",
            Self::Routed => "routed",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote method paths of the model service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPaths {
    pub identify_model: String,
    pub lock_data: String,
    pub list_data_files: String,
    pub download_file: String,
}

impl Default for OperationPaths {
    fn default() -> Self {
        Self {
            identify_model: "/model.v1.ModelService/IdentifyModel".to_string(),
            lock_data: "/model.v1.ModelService/LockData".to_string(),
            list_data_files: "/model.v1.ModelService/GetListOfModelDataFilesWithoutLocking"
                .to_string(),
            download_file: "/model.v1.ModelService/DownloadFile".to_string(),
        }
    }
}

/// Resolved model service contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContract {
    pub name: String,
    pub operations: OperationPaths,
}

/// Channel handed out by a proxy provider, plus the factory able to rebuild it
pub struct ClientProxy {
    pub mode: ProxyMode,
    pub channel: Box<dyn RpcChannel>,
    pub factory: Arc<dyn ChannelFactory>,
}

/// Source of client proxies for one server version
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Proxy modes this provider can hand out; empty means unusable
    fn capabilities(&self) -> Vec<ProxyMode>;

    async fn proxy(
        &self,
        mode: ProxyMode,
        host: &str,
        contract: &ServiceContract,
    ) -> PipelineResult<ClientProxy>;

    /// Streamed, falling back to routed, then buffered
    fn preferred_mode(&self) -> Option<ProxyMode> {
        let capabilities = self.capabilities();
        ProxyMode::PREFERENCE
            .into_iter()
            .find(|mode| capabilities.contains(mode))
    }
}

/// Inputs available to a provider constructor
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub version: String,
    pub transport: TransportConfig,
}

/// One invocation of a provider entry point
pub struct FactoryCall<'a> {
    pub context: &'a ProviderContext,
    pub type_decl: &'a TypeDecl,
    pub entry_point: &'a EntryPoint,
    pub args: &'a [String],
}

pub type ProviderConstructor =
    Arc<dyn Fn(&FactoryCall<'_>) -> PipelineResult<Arc<dyn ProxyProvider>> + Send + Sync>;

/// Registry of provider implementations, keyed by manifest implementation key
#[derive(Clone, Default)]
pub struct Implementations {
    constructors: HashMap<String, ProviderConstructor>,
}

impl Implementations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the gRPC proxy provider
    pub fn builtin() -> Self {
        let mut implementations = Self::new();
        implementations.register(
            GRPC_PROXY_PROVIDER,
            Arc::new(crate::grpc::provider::construct),
        );
        implementations
    }

    pub fn register(&mut self, key: impl Into<String>, constructor: ProviderConstructor) {
        self.constructors.insert(key.into(), constructor);
    }

    pub fn get(&self, key: &str) -> Option<&ProviderConstructor> {
        self.constructors.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implementations")
            .field("keys", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Service contract declared by a resolved type
pub fn service_contract(handle: &TypeHandle) -> PipelineResult<ServiceContract> {
    let operations = handle.decl.operations.clone().ok_or_else(|| {
        PipelineError::ContractNotFound(format!(
            "{} declares no service operations",
            handle.decl.name
        ))
    })?;

    Ok(ServiceContract {
        name: handle.decl.name.clone(),
        operations,
    })
}
