//! Export orchestration
//!
//! [`Exporter`] resolves the contract, opens a large-message channel and hands
//! the model service to [`CheckoutPipeline`], which runs session, identify,
//! lock, download and reassemble strictly in that order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::{ExporterConfig, LockConfig};
use crate::contract::{
    ContractResolver, Implementations, LibraryLoader, PROXY_LIBRARY, ProviderContext,
};
use crate::error::{ExportResult, PipelineError, PipelineResult, Stage};
use crate::lock::LockManager;
use crate::reassemble::{DataFormatVersion, classify_staged_files, merge_to_artifact};
use crate::retrieval::{FileRetrieval, Progress, list_data_files};
use crate::service::ModelService;
use crate::session::{ClientIdentity, LogicalModelPath, SessionProtocol};
use crate::staging::StagingArea;
use crate::transport::{RpcChannel, TransportNegotiator};

/// Caller-facing export request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub server_host: String,
    /// Logical model path, e.g. `|ProjectA|Sub|model.ext`
    pub model_path: String,
    pub destination: PathBuf,
    pub format_version: DataFormatVersion,
    /// Server version hint for contract loading
    pub server_version: Option<String>,
    pub contracts_dir: Option<PathBuf>,
    pub overwrite: bool,
}

impl ExportOptions {
    pub fn new(
        server_host: impl Into<String>,
        model_path: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server_host: server_host.into(),
            model_path: model_path.into(),
            destination: destination.into(),
            format_version: DataFormatVersion::LATEST,
            server_version: None,
            contracts_dir: None,
            overwrite: false,
        }
    }

    /// Check the request before any remote work
    pub fn validate(&self) -> PipelineResult<LogicalModelPath> {
        if self.server_host.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "server host is required".to_string(),
            ));
        }
        let path = LogicalModelPath::parse(&self.model_path)?;
        if self.destination.as_os_str().is_empty() || self.destination.file_name().is_none() {
            return Err(PipelineError::InvalidInput(format!(
                "invalid destination {}",
                self.destination.display()
            )));
        }
        if self.destination.exists() && !self.overwrite {
            return Err(PipelineError::InvalidInput(format!(
                "destination {} already exists",
                self.destination.display()
            )));
        }
        Ok(path)
    }
}

/// Remote part of one checkout
#[derive(Debug, Clone, Copy)]
pub struct CheckoutRequest<'a> {
    pub server_host: &'a str,
    pub model_path: &'a LogicalModelPath,
    pub destination: &'a Path,
    pub format_version: DataFormatVersion,
    pub overwrite: bool,
}

/// Session, lock, download and reassembly against one model service
pub struct CheckoutPipeline {
    session: SessionProtocol,
    lock: LockConfig,
    chunk_size: usize,
    staging_root: Option<PathBuf>,
}

impl CheckoutPipeline {
    pub fn new(session: SessionProtocol, config: &ExporterConfig) -> Self {
        Self {
            session,
            lock: config.lock,
            chunk_size: config.chunk_size,
            staging_root: config.staging_root.clone(),
        }
    }

    pub async fn run(
        &self,
        service: &dyn ModelService,
        request: &CheckoutRequest<'_>,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> ExportResult<PathBuf> {
        // removed on every exit path
        let staging = StagingArea::create(self.staging_root.as_deref())
            .map_err(|e| PipelineError::from(e).at(Stage::Prepare))?;

        tracing::info!(
            stage = "session",
            host = request.server_host,
            model = %request.model_path,
            "Starting checkout"
        );
        let service_token = self
            .session
            .create_service_session_token()
            .map_err(|e| e.at(Stage::Session))?;

        tracing::info!(
            stage = "identify",
            model = %request.model_path,
            "Identifying model"
        );
        let identity = self
            .session
            .identify_model(service, &service_token, request.model_path)
            .await
            .map_err(|e| e.at(Stage::Identify))?;

        let model_token = self
            .session
            .create_model_session_token(identity, request.server_host, request.model_path)
            .map_err(|e| e.at(Stage::Session))?;

        tracing::info!(stage = "lock", model = %request.model_path, "Locking model");
        let mut lock = LockManager::new();
        let epoch = lock
            .lock(
                service,
                &model_token,
                self.lock.options,
                self.lock.allow_non_exclusive,
            )
            .await
            .map_err(|e| e.at(Stage::Lock))?;

        tracing::info!(stage = "download", epoch = %epoch, "Listing data files");
        let entries = list_data_files(service, &model_token)
            .await
            .map_err(|e| e.at(Stage::Download))?;

        let retrieval = FileRetrieval::new(
            service,
            &self.session,
            &model_token,
            &epoch,
            self.chunk_size,
        );
        let staged = retrieval
            .retrieve_all(&entries, staging.path(), progress, cancel)
            .await
            .map_err(|e| e.at(Stage::Download))?;

        let bytes: u64 = staged.iter().map(|file| file.bytes).sum();
        tracing::info!(
            stage = "reassemble",
            files = staged.len(),
            bytes,
            format = %request.format_version,
            "Reassembling artifact"
        );
        self.reassemble(staging.path(), request)
            .await
            .map_err(|e| e.at(Stage::Reassemble))?;

        Ok(request.destination.to_path_buf())
    }

    async fn reassemble(
        &self,
        staging_dir: &Path,
        request: &CheckoutRequest<'_>,
    ) -> PipelineResult<()> {
        let destination = request.destination;
        let version = request.format_version;
        prepare_destination(destination, request.overwrite).await?;
        let indices = classify_staged_files(staging_dir, version)?;
        merge_to_artifact(&indices, version, destination).await?;
        Ok(())
    }
}

/// Refuse an existing destination unless overwriting; otherwise delete it
async fn prepare_destination(destination: &Path, overwrite: bool) -> PipelineResult<()> {
    if tokio::fs::try_exists(destination).await? {
        if !overwrite {
            return Err(PipelineError::InvalidInput(format!(
                "destination {} already exists",
                destination.display()
            )));
        }
        tokio::fs::remove_file(destination).await?;
    }
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Library entry point of the export pipeline
pub struct Exporter {
    config: ExporterConfig,
    identity: ClientIdentity,
    implementations: Implementations,
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> Self {
        let identity = ClientIdentity::detect(&config);
        Self {
            config,
            identity,
            implementations: Implementations::builtin(),
        }
    }

    /// Replace the provider implementation registry
    pub fn with_implementations(mut self, implementations: Implementations) -> Self {
        self.implementations = implementations;
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Export one model; returns the destination path
    pub async fn export(
        &self,
        options: &ExportOptions,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> ExportResult<PathBuf> {
        let started = Instant::now();
        let result = self.run(options, progress, cancel).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if matches!(e.source, PipelineError::Cancelled) => "cancelled",
            Err(_) => "failure",
        };
        crate::metrics::record_run(outcome, started.elapsed());

        match &result {
            Ok(path) => tracing::info!(
                destination = %path.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Export completed"
            ),
            Err(e) => tracing::error!(
                stage = %e.stage,
                error = %e.source,
                detail = e.remote_detail().unwrap_or_default(),
                "Export failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        options: &ExportOptions,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> ExportResult<PathBuf> {
        let model_path = options.validate().map_err(|e| e.at(Stage::Prepare))?;

        let mut channel = self
            .open_channel(options)
            .await
            .map_err(|e| e.at(Stage::Provider))?;

        let result = match channel.service() {
            Ok(service) => {
                let session = SessionProtocol::new(self.identity.clone());
                let pipeline = CheckoutPipeline::new(session, &self.config);
                let request = CheckoutRequest {
                    server_host: &options.server_host,
                    model_path: &model_path,
                    destination: &options.destination,
                    format_version: options.format_version,
                    overwrite: options.overwrite,
                };
                pipeline
                    .run(service.as_ref(), &request, progress, cancel)
                    .await
            }
            Err(e) => Err(e.at(Stage::Provider)),
        };

        close_channel(channel.as_mut()).await;
        result
    }

    /// Load contracts, resolve the provider and open a large-message channel
    async fn open_channel(&self, options: &ExportOptions) -> PipelineResult<Box<dyn RpcChannel>> {
        let version_hint = options
            .server_version
            .clone()
            .or_else(|| self.config.server_version.clone());
        let contracts_dir = options
            .contracts_dir
            .clone()
            .or_else(|| self.config.contracts_dir.clone());
        let required = self.config.required_libraries.clone();

        let hint = version_hint.clone();
        let loader = tokio::task::spawn_blocking(move || {
            LibraryLoader::load(hint.as_deref(), contracts_dir.as_deref(), &required)
        })
        .await
        .map_err(|e| PipelineError::ContractNotFound(e.to_string()))??;

        let version = version_hint
            .or_else(|| {
                loader
                    .find_library(PROXY_LIBRARY)
                    .and_then(|library| library.manifest.version.clone())
            })
            .unwrap_or_default();

        let resolver = ContractResolver::new(
            Arc::new(loader),
            self.config.naming_rules.clone(),
            self.implementations.clone(),
        );
        let contract = resolver.resolve_service_contract()?;
        let context = ProviderContext {
            version,
            transport: self.config.transport.clone(),
        };
        let provider = resolver.resolve_provider(&context)?;
        let mode = provider.preferred_mode().ok_or_else(|| {
            PipelineError::ContractNotFound("proxy provider exposes no proxy mode".to_string())
        })?;

        tracing::info!(
            stage = "provider",
            host = %options.server_host,
            mode = %mode,
            version = %context.version,
            "Opening client proxy"
        );
        let proxy = provider
            .proxy(mode, options.server_host.as_str(), &contract)
            .await?;

        let negotiator = TransportNegotiator::new(self.config.transport.clone());
        Ok(negotiator
            .ensure_large_message_capable(proxy.channel, proxy.factory.as_ref())
            .await)
    }
}

/// Best-effort close bounded by the binding's close timeout
async fn close_channel(channel: &mut dyn RpcChannel) {
    let timeout = channel.binding().timeouts.close;
    match tokio::time::timeout(timeout, channel.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to close channel"),
        Err(_) => tracing::warn!("Timed out closing channel"),
    }
}
