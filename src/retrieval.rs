//! Manifest enumeration and per-file download into the staging area

use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};
use crate::lock::CheckoutEpoch;
use crate::service::{DownloadEnvelope, ModelService, PayloadReader};
use crate::session::{ModelIdentity, SERVER_SEPARATOR, ServiceModelSessionToken, SessionProtocol};

/// Recommended streaming copy chunk
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Observer of cumulative transferred bytes
pub trait Progress: Send + Sync {
    fn report(&self, bytes: u64);
}

impl<F> Progress for F
where
    F: Fn(u64) + Send + Sync,
{
    fn report(&self, bytes: u64) {
        self(bytes)
    }
}

/// Progress that discards every report
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _bytes: u64) {}
}

/// Shifts per-file progress by the bytes of earlier files
///
/// Only the first file may report `0`, so the cumulative sequence stays
/// strictly increasing across empty files.
struct OffsetProgress<'a> {
    inner: &'a dyn Progress,
    offset: u64,
    first: bool,
}

impl Progress for OffsetProgress<'_> {
    fn report(&self, bytes: u64) {
        if bytes == 0 && !self.first {
            return;
        }
        self.inner.report(self.offset + bytes);
    }
}

/// A relative file name within the model's storage; carries no size or hash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataFileEntry(String);

impl DataFileEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Server-side name: the model identity joined with the entry
    pub fn source_name(&self, identity: &ModelIdentity) -> String {
        format!("{}{}{}", identity.identity_guid, SERVER_SEPARATOR, self.0)
    }

    /// Last path segment, used as the staged file name
    pub fn staged_file_name(&self) -> PipelineResult<String> {
        let name = self.0.rsplit(['/', '\\']).next().unwrap_or("").trim();
        if name.is_empty() || name == "." || name == ".." {
            return Err(PipelineError::InvalidManifestEntry(self.0.clone()));
        }
        Ok(name.to_string())
    }
}

/// A file written to the staging area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub entry: DataFileEntry,
    pub path: PathBuf,
    pub bytes: u64,
}

/// One manifest call, no paging
pub async fn list_data_files(
    service: &dyn ModelService,
    token: &ServiceModelSessionToken,
) -> PipelineResult<Vec<DataFileEntry>> {
    let names = service.list_data_files(token).await?;
    Ok(names.into_iter().map(DataFileEntry::new).collect())
}

/// Staged name for every entry; flattened names must stay unique
pub fn plan_staging(entries: &[DataFileEntry]) -> PipelineResult<Vec<(DataFileEntry, String)>> {
    let mut seen = HashSet::with_capacity(entries.len());
    entries
        .iter()
        .map(|entry| {
            let staged = entry.staged_file_name()?;
            if !seen.insert(staged.to_ascii_lowercase()) {
                return Err(PipelineError::InvalidManifestEntry(
                    entry.name().to_string(),
                ));
            }
            Ok((entry.clone(), staged))
        })
        .collect()
}

/// Readable body of a download response
///
/// Probes the stream form, the reader accessor, the buffer form and finally the
/// envelope itself as raw bytes.
pub fn extract_payload(
    envelope: &mut dyn DownloadEnvelope,
    source_name: &str,
) -> PipelineResult<PayloadReader> {
    if let Some(reader) = envelope.take_stream() {
        return Ok(reader);
    }
    if let Some(reader) = envelope.open_reader() {
        return Ok(reader);
    }
    if let Some(buffer) = envelope.take_buffer() {
        return Ok(Box::new(Cursor::new(buffer)));
    }
    if let Some(raw) = envelope.take_raw() {
        return Ok(Box::new(Cursor::new(raw)));
    }
    Err(PipelineError::NoPayloadFound(source_name.to_string()))
}

/// Stream `reader` into `target` in fixed-size chunks
///
/// Reports cumulative bytes after every chunk (a single `0` for an empty body)
/// and checks `cancel` before each read.
pub async fn persist(
    mut reader: PayloadReader,
    target: &Path,
    chunk_size: usize,
    progress: &dyn Progress,
    cancel: &CancellationToken,
) -> PipelineResult<u64> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read]).await?;
        total += read as u64;
        progress.report(total);
    }

    if total == 0 {
        progress.report(0);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(total)
}

/// Downloads every manifest entry of one locked model
pub struct FileRetrieval<'a> {
    service: &'a dyn ModelService,
    session: &'a SessionProtocol,
    token: &'a ServiceModelSessionToken,
    epoch: &'a CheckoutEpoch,
    chunk_size: usize,
}

impl<'a> FileRetrieval<'a> {
    pub fn new(
        service: &'a dyn ModelService,
        session: &'a SessionProtocol,
        token: &'a ServiceModelSessionToken,
        epoch: &'a CheckoutEpoch,
        chunk_size: usize,
    ) -> Self {
        Self {
            service,
            session,
            token,
            epoch,
            chunk_size,
        }
    }

    /// Open the body of one entry under a freshly renewed token
    pub async fn download_file(&self, entry: &DataFileEntry) -> PipelineResult<PayloadReader> {
        let token = self.session.renew_model_session_token(self.token);
        let source_name = entry.source_name(&token.identity);

        tracing::debug!(
            file = entry.name(),
            source = %source_name,
            operation_id = %token.operation_id,
            "Downloading data file"
        );

        let mut envelope = self
            .service
            .download_file(&token, self.epoch, &source_name)
            .await?;
        extract_payload(envelope.as_mut(), &source_name)
    }

    /// Download entries sequentially, in manifest order
    ///
    /// `progress` sees strictly increasing totals across the whole manifest.
    pub async fn retrieve_all(
        &self,
        entries: &[DataFileEntry],
        staging_dir: &Path,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<StagedFile>> {
        let plan = plan_staging(entries)?;
        let mut staged = Vec::with_capacity(plan.len());
        let mut offset = 0u64;

        for (entry, staged_name) in plan {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let reader = self.download_file(&entry).await?;
            let path = staging_dir.join(&staged_name);
            let file_progress = OffsetProgress {
                inner: progress,
                offset,
                first: staged.is_empty(),
            };
            let bytes = persist(reader, &path, self.chunk_size, &file_progress, cancel).await?;

            offset += bytes;
            crate::metrics::record_file_downloaded(bytes);
            tracing::debug!(file = entry.name(), bytes, "Staged data file");

            staged.push(StagedFile { entry, path, bytes });
        }

        Ok(staged)
    }
}
