//! Contract-driven gRPC client
//!
//! A thin layer over [`tonic::client::Grpc`] that takes method paths from the
//! service contract instead of generated stubs.

use tonic::codec::{CompressionEncoding, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Status};

use crate::contract::OperationPaths;
use crate::transport::ChannelBinding;

/// Operations of the model service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    IdentifyModel,
    LockData,
    ListDataFiles,
    DownloadFile,
}

impl Operation {
    pub fn path<'a>(&self, operations: &'a OperationPaths) -> &'a str {
        match self {
            Self::IdentifyModel => &operations.identify_model,
            Self::LockData => &operations.lock_data,
            Self::ListDataFiles => &operations.list_data_files,
            Self::DownloadFile => &operations.download_file,
        }
    }
}

/// Clamp a 64-bit binding limit to the platform's message size type
pub fn message_limit(max: u64) -> usize {
    usize::try_from(max).unwrap_or(usize::MAX)
}

/// Prefix an operation path with the endpoint's own path
pub fn join_method_path(prefix: &str, operation: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if operation.starts_with('/') {
        format!("{}{}", prefix, operation)
    } else {
        format!("{}/{}", prefix, operation)
    }
}

/// Cheap to clone (the channel is shared)
#[derive(Debug, Clone)]
pub struct ContractClient {
    inner: tonic::client::Grpc<Channel>,
    operations: OperationPaths,
    path_prefix: String,
}

impl ContractClient {
    pub fn new(
        channel: Channel,
        operations: OperationPaths,
        path_prefix: impl Into<String>,
        binding: &ChannelBinding,
    ) -> Self {
        let limit = message_limit(binding.max_message_size);
        let mut inner = tonic::client::Grpc::new(channel)
            .max_decoding_message_size(limit)
            .max_encoding_message_size(limit);
        if binding.accept_gzip {
            inner = inner.accept_compressed(CompressionEncoding::Gzip);
        }

        Self {
            inner,
            operations,
            path_prefix: path_prefix.into(),
        }
    }

    pub fn operations(&self) -> &OperationPaths {
        &self.operations
    }

    fn method_path(&self, operation: Operation) -> Result<PathAndQuery, Status> {
        let path = join_method_path(&self.path_prefix, operation.path(&self.operations));
        PathAndQuery::try_from(path.as_str())
            .map_err(|e| Status::internal(format!("Invalid method path '{}': {}", path, e)))
    }

    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("Service was not ready: {}", e)))
    }

    pub async fn unary<Req, Resp>(
        &mut self,
        operation: Operation,
        message: Req,
    ) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let path = self.method_path(operation)?;
        self.ready().await?;

        let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
        let response = self.inner.unary(Request::new(message), path, codec).await?;
        Ok(response.into_inner())
    }

    pub async fn server_streaming<Req, Resp>(
        &mut self,
        operation: Operation,
        message: Req,
    ) -> Result<Streaming<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let path = self.method_path(operation)?;
        self.ready().await?;

        let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
        let response = self
            .inner
            .server_streaming(Request::new(message), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_method_path() {
        assert_eq!(
            join_method_path("", "/model.v1.ModelService/LockData"),
            "/model.v1.ModelService/LockData"
        );
        assert_eq!(
            join_method_path("/rs/2024/", "/model.v1.ModelService/LockData"),
            "/rs/2024/model.v1.ModelService/LockData"
        );
        assert_eq!(join_method_path("/rs", "svc/Op"), "/rs/svc/Op");
    }

    #[test]
    fn test_operation_paths() {
        let operations = OperationPaths::default();
        assert_eq!(
            Operation::DownloadFile.path(&operations),
            "/model.v1.ModelService/DownloadFile"
        );
        assert_eq!(
            Operation::ListDataFiles.path(&operations),
            "/model.v1.ModelService/GetListOfModelDataFilesWithoutLocking"
        );
    }

    #[test]
    fn test_message_limit_clamps() {
        assert_eq!(message_limit(1024), 1024);
        assert_eq!(message_limit(i32::MAX as u64), i32::MAX as usize);
    }
}
