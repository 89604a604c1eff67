//! In-memory collaborators for exercising the pipeline without a model server
//!
//! Every fake records what it was asked to do so tests can assert on call order.

use async_trait::async_trait;
use prost::bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::contract::{
    ClientProxy, MODEL_SERVICE_TYPE, OperationPaths, ProxyMode, ProxyProvider, ServiceContract,
};
use crate::error::{PipelineError, PipelineResult, RemoteError};
use crate::lock::{CheckoutEpoch, LockRequest};
use crate::service::{DownloadEnvelope, ModelService, PayloadReader};
use crate::session::{
    LocationKind, ModelIdentity, ModelLocation, SERVER_SEPARATOR, ServiceModelSessionToken,
    ServiceSessionToken,
};
use crate::transport::{ChannelBinding, ChannelFactory, ChannelState, RpcChannel, TransferMode};

pub const FAKE_IDENTITY: &str = "6c1f9a4e-5b7d-4e0a-9c3f-0d2b8e7a1f10";
pub const FAKE_EPOCH: &str = "638412345678901234";

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Model service contract with the default operation paths
pub fn test_contract() -> ServiceContract {
    ServiceContract {
        name: MODEL_SERVICE_TYPE.to_string(),
        operations: OperationPaths::default(),
    }
}

/// Model session token for `|ProjectA|Sub|model.ext` on `rs1`
pub fn model_token() -> ServiceModelSessionToken {
    ServiceModelSessionToken {
        identity: ModelIdentity::new(FAKE_IDENTITY),
        location: ModelLocation {
            server: "rs1".to_string(),
            relative_path: "ProjectA\\Sub\\model.ext".to_string(),
            kind: LocationKind::Server,
        },
        user_name: "ModelExport:ws01:1".to_string(),
        sso_user_name: String::new(),
        machine_name: "ws01".to_string(),
        session_id: Uuid::new_v4(),
        operation_id: Uuid::new_v4(),
    }
}

// ============================================================================
// Model service
// ============================================================================

/// Shape in which a fake download exposes its body
#[derive(Debug, Clone)]
pub enum FakePayload {
    Stream(Vec<u8>),
    Reader(Vec<u8>),
    Buffer(Vec<u8>),
    Raw(Vec<u8>),
    Empty,
}

impl FakePayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Stream(b) | Self::Reader(b) | Self::Buffer(b) | Self::Raw(b) => b.len(),
            Self::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FakeEnvelope(Option<FakePayload>);

impl DownloadEnvelope for FakeEnvelope {
    fn take_stream(&mut self) -> Option<PayloadReader> {
        match self.0.take() {
            Some(FakePayload::Stream(bytes)) => Some(Box::new(Cursor::new(bytes))),
            other => {
                self.0 = other;
                None
            }
        }
    }

    fn open_reader(&mut self) -> Option<PayloadReader> {
        match self.0.take() {
            Some(FakePayload::Reader(bytes)) => Some(Box::new(Cursor::new(bytes))),
            other => {
                self.0 = other;
                None
            }
        }
    }

    fn take_buffer(&mut self) -> Option<Bytes> {
        match self.0.take() {
            Some(FakePayload::Buffer(bytes)) => Some(Bytes::from(bytes)),
            other => {
                self.0 = other;
                None
            }
        }
    }
}

/// Scripted model service
pub struct FakeModelService {
    identity: ModelIdentity,
    epoch: CheckoutEpoch,
    files: Vec<(String, FakePayload)>,
    identify_fault: Option<tonic::Code>,
    lock_error: Option<RemoteError>,
    list_error: Option<RemoteError>,
    download_errors: HashMap<String, RemoteError>,
    calls: Mutex<Vec<String>>,
    download_tokens: Mutex<Vec<ServiceModelSessionToken>>,
}

impl FakeModelService {
    pub fn new() -> Self {
        Self {
            identity: ModelIdentity::new(FAKE_IDENTITY),
            epoch: CheckoutEpoch::new(FAKE_EPOCH),
            files: Vec::new(),
            identify_fault: None,
            lock_error: None,
            list_error: None,
            download_errors: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            download_tokens: Mutex::new(Vec::new()),
        }
    }

    /// Add a manifest entry served as a stream
    pub fn with_file(self, name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.with_payload(name, FakePayload::Stream(body.into()))
    }

    pub fn with_payload(mut self, name: impl Into<String>, payload: FakePayload) -> Self {
        self.files.push((name.into(), payload));
        self
    }

    pub fn with_identify_fault(mut self, code: tonic::Code) -> Self {
        self.identify_fault = Some(code);
        self
    }

    pub fn with_lock_fault(mut self, message: &str, detail: &str) -> Self {
        self.lock_error = Some(RemoteError::fault(
            tonic::Code::FailedPrecondition,
            message,
            Some(detail.to_string()),
        ));
        self
    }

    pub fn with_lock_transport_error(mut self, message: &str) -> Self {
        self.lock_error = Some(RemoteError::Transport(message.to_string()));
        self
    }

    pub fn with_list_fault(mut self, code: tonic::Code, message: &str) -> Self {
        self.list_error = Some(RemoteError::fault(code, message, None));
        self
    }

    pub fn with_download_error(mut self, name: impl Into<String>, error: RemoteError) -> Self {
        self.download_errors.insert(name.into(), error);
        self
    }

    pub fn identity(&self) -> ModelIdentity {
        self.identity.clone()
    }

    pub fn epoch(&self) -> CheckoutEpoch {
        self.epoch.clone()
    }

    /// Manifest entries in order
    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn file_size(&self, name: &str) -> Option<usize> {
        self.files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, payload)| payload.len())
    }

    /// Call trace: `identify:<path>`, `lock:<options>:<allow>`, `list`, `download:<source>`
    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    /// Tokens carried by each download call
    pub fn download_tokens(&self) -> Vec<ServiceModelSessionToken> {
        guard(&self.download_tokens).clone()
    }

    fn record(&self, call: String) {
        guard(&self.calls).push(call);
    }
}

impl Default for FakeModelService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelService for FakeModelService {
    async fn identify_model(
        &self,
        _token: &ServiceSessionToken,
        relative_path: &str,
    ) -> Result<ModelIdentity, RemoteError> {
        self.record(format!("identify:{}", relative_path));
        match self.identify_fault {
            Some(code) => Err(RemoteError::fault(
                code,
                format!("cannot identify {}", relative_path),
                None,
            )),
            None => Ok(self.identity.clone()),
        }
    }

    async fn lock_data(
        &self,
        _token: &ServiceModelSessionToken,
        request: &LockRequest,
    ) -> Result<CheckoutEpoch, RemoteError> {
        self.record(format!(
            "lock:{}:{}",
            request.options.bits(),
            request.allow_non_exclusive
        ));
        match &self.lock_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.epoch.clone()),
        }
    }

    async fn list_data_files(
        &self,
        _token: &ServiceModelSessionToken,
    ) -> Result<Vec<String>, RemoteError> {
        self.record("list".to_string());
        match &self.list_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.file_names()),
        }
    }

    async fn download_file(
        &self,
        token: &ServiceModelSessionToken,
        epoch: &CheckoutEpoch,
        source_name: &str,
    ) -> Result<Box<dyn DownloadEnvelope>, RemoteError> {
        self.record(format!("download:{}", source_name));
        guard(&self.download_tokens).push(token.clone());

        if epoch != &self.epoch {
            return Err(RemoteError::fault(
                tonic::Code::FailedPrecondition,
                "checkout epoch mismatch",
                None,
            ));
        }

        let prefix = format!("{}{}", self.identity.identity_guid, SERVER_SEPARATOR);
        let entry = source_name.strip_prefix(&prefix).ok_or_else(|| {
            RemoteError::fault(
                tonic::Code::InvalidArgument,
                format!("source {} is outside the model", source_name),
                None,
            )
        })?;

        if let Some(err) = self.download_errors.get(entry) {
            return Err(err.clone());
        }

        let payload = self
            .files
            .iter()
            .find(|(name, _)| name == entry)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| {
                RemoteError::fault(tonic::Code::NotFound, format!("no file {}", entry), None)
            })?;

        let envelope: Box<dyn DownloadEnvelope> = match payload {
            FakePayload::Raw(bytes) => Box::new(bytes),
            FakePayload::Empty => Box::new(FakeEnvelope(None)),
            other => Box::new(FakeEnvelope(Some(other))),
        };
        Ok(envelope)
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Observes the state of a channel after it has been handed away
#[derive(Debug, Clone)]
pub struct ChannelProbe {
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelProbe {
    pub fn state(&self) -> ChannelState {
        *guard(&self.state)
    }
}

pub struct FakeChannel {
    contract: ServiceContract,
    address: String,
    binding: ChannelBinding,
    state: Arc<Mutex<ChannelState>>,
    service: Arc<dyn ModelService>,
    fail_open: bool,
}

impl FakeChannel {
    pub fn new(
        contract: ServiceContract,
        address: impl Into<String>,
        binding: ChannelBinding,
        service: Arc<dyn ModelService>,
    ) -> Self {
        Self {
            contract,
            address: address.into(),
            binding,
            state: Arc::new(Mutex::new(ChannelState::Created)),
            service,
            fail_open: false,
        }
    }

    /// Unopened channel with default limits
    pub fn boxed(contract: ServiceContract, address: &str) -> Box<dyn RpcChannel> {
        Box::new(Self::new(
            contract,
            address,
            ChannelBinding::new(TransferMode::Streamed, &TransportConfig::default()),
            Arc::new(FakeModelService::new()),
        ))
    }

    /// Opened channel with default limits, plus a probe on its state
    pub fn opened(contract: ServiceContract, address: &str) -> (Box<dyn RpcChannel>, ChannelProbe) {
        let channel = Self::new(
            contract,
            address,
            ChannelBinding::new(TransferMode::Streamed, &TransportConfig::default()),
            Arc::new(FakeModelService::new()),
        );
        *guard(&channel.state) = ChannelState::Opened;
        let probe = channel.probe();
        (Box::new(channel), probe)
    }

    pub fn probe(&self) -> ChannelProbe {
        ChannelProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl RpcChannel for FakeChannel {
    fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    fn state(&self) -> ChannelState {
        *guard(&self.state)
    }

    fn remote_address(&self) -> Option<String> {
        (!self.address.is_empty()).then(|| self.address.clone())
    }

    fn binding(&self) -> &ChannelBinding {
        &self.binding
    }

    fn binding_mut(&mut self) -> Option<&mut ChannelBinding> {
        match self.state() {
            ChannelState::Created => Some(&mut self.binding),
            _ => None,
        }
    }

    async fn open(&mut self) -> Result<(), RemoteError> {
        if self.fail_open {
            return Err(RemoteError::Transport(format!(
                "connection to {} refused",
                self.address
            )));
        }
        *guard(&self.state) = ChannelState::Opened;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RemoteError> {
        *guard(&self.state) = ChannelState::Closed;
        Ok(())
    }

    fn service(&self) -> PipelineResult<Arc<dyn ModelService>> {
        match self.state() {
            ChannelState::Opened => Ok(self.service.clone()),
            state => Err(PipelineError::TransportError(format!(
                "channel is {:?}, not open",
                state
            ))),
        }
    }
}

pub struct FakeChannelFactory {
    contract: ServiceContract,
    service: Arc<dyn ModelService>,
    fail_open: bool,
    fail_create: bool,
    created: AtomicUsize,
    probes: Mutex<Vec<ChannelProbe>>,
}

impl FakeChannelFactory {
    pub fn new(contract: ServiceContract) -> Self {
        Self {
            contract,
            service: Arc::new(FakeModelService::new()),
            fail_open: false,
            fail_create: false,
            created: AtomicUsize::new(0),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn ModelService>) -> Self {
        self.service = service;
        self
    }

    /// Channels created by this factory fail to open
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Number of channels requested from this factory
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> Vec<ChannelProbe> {
        guard(&self.probes).clone()
    }
}

impl ChannelFactory for FakeChannelFactory {
    fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    fn create(
        &self,
        endpoint: &str,
        binding: ChannelBinding,
    ) -> PipelineResult<Box<dyn RpcChannel>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(PipelineError::TransportError(format!(
                "cannot create channel to {}",
                endpoint
            )));
        }
        let mut channel = FakeChannel::new(
            self.contract.clone(),
            endpoint,
            binding,
            self.service.clone(),
        );
        channel.fail_open = self.fail_open;
        guard(&self.probes).push(channel.probe());
        Ok(Box::new(channel))
    }
}

// ============================================================================
// Proxy provider
// ============================================================================

/// Provider handing out opened fake channels bound to one service
pub struct FakeProxyProvider {
    capabilities: Vec<ProxyMode>,
    service: Arc<dyn ModelService>,
    fail_replacement: bool,
    requests: Mutex<Vec<String>>,
    channels: Mutex<Vec<ChannelProbe>>,
}

impl FakeProxyProvider {
    pub fn new(capabilities: Vec<ProxyMode>) -> Self {
        Self {
            capabilities,
            service: Arc::new(FakeModelService::new()),
            fail_replacement: false,
            requests: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn ModelService>) -> Self {
        self.service = service;
        self
    }

    /// Replacement channels fail to open
    pub fn failing_replacement(mut self) -> Self {
        self.fail_replacement = true;
        self
    }

    /// `<mode>@<host>` for each proxy requested
    pub fn requests(&self) -> Vec<String> {
        guard(&self.requests).clone()
    }

    /// Probes on the channels handed out
    pub fn channels(&self) -> Vec<ChannelProbe> {
        guard(&self.channels).clone()
    }
}

#[async_trait]
impl ProxyProvider for FakeProxyProvider {
    fn capabilities(&self) -> Vec<ProxyMode> {
        self.capabilities.clone()
    }

    async fn proxy(
        &self,
        mode: ProxyMode,
        host: &str,
        contract: &ServiceContract,
    ) -> PipelineResult<ClientProxy> {
        guard(&self.requests).push(format!("{}@{}", mode, host));
        if !self.capabilities.contains(&mode) {
            return Err(PipelineError::InvalidInput(format!(
                "proxy mode {} not supported",
                mode
            )));
        }

        let mut channel = FakeChannel::new(
            contract.clone(),
            format!("fake://{}/ModelService/{}", host, mode),
            ChannelBinding::new(TransferMode::Streamed, &TransportConfig::default()),
            self.service.clone(),
        );
        channel.open().await.map_err(PipelineError::from)?;
        guard(&self.channels).push(channel.probe());

        let mut factory =
            FakeChannelFactory::new(contract.clone()).with_service(self.service.clone());
        factory.fail_open = self.fail_replacement;

        Ok(ClientProxy {
            mode,
            channel: Box::new(channel),
            factory: Arc::new(factory),
        })
    }
}
