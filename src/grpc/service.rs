//! [`ModelService`] over gRPC

use async_trait::async_trait;
use futures::Stream;
use prost::bytes::Bytes;
use tokio_util::io::StreamReader;
use tonic::codec::Streaming;

use super::client::{ContractClient, Operation};
use super::proto;
use super::proto::download_file_response::Payload;
use crate::error::RemoteError;
use crate::lock::{CheckoutEpoch, LockRequest};
use crate::service::{DownloadEnvelope, ModelService, PayloadReader};
use crate::session::{
    LocationKind, ModelIdentity, ModelLocation, ServiceModelSessionToken, ServiceSessionToken,
};
use crate::transport::DecodeQuotas;

impl From<&ServiceSessionToken> for proto::ServiceSessionToken {
    fn from(token: &ServiceSessionToken) -> Self {
        Self {
            user_name: token.user_name.clone(),
            sso_user_name: token.sso_user_name.clone(),
            machine_name: token.machine_name.clone(),
            operation_id: token.operation_id.to_string(),
        }
    }
}

impl From<&ModelLocation> for proto::ModelLocation {
    fn from(location: &ModelLocation) -> Self {
        let kind = match location.kind {
            LocationKind::Server => proto::LocationKind::Server,
            LocationKind::Local => proto::LocationKind::Local,
        };
        Self {
            server: location.server.clone(),
            relative_path: location.relative_path.clone(),
            kind: kind as i32,
        }
    }
}

impl From<&ServiceModelSessionToken> for proto::ModelSessionToken {
    fn from(token: &ServiceModelSessionToken) -> Self {
        Self {
            identity_guid: token.identity.identity_guid.clone(),
            location: Some((&token.location).into()),
            user_name: token.user_name.clone(),
            sso_user_name: token.sso_user_name.clone(),
            machine_name: token.machine_name.clone(),
            session_id: token.session_id.to_string(),
            operation_id: token.operation_id.to_string(),
        }
    }
}

/// Model service reached through a contract-driven gRPC client
#[derive(Debug, Clone)]
pub struct GrpcModelService {
    client: ContractClient,
    quotas: DecodeQuotas,
}

impl GrpcModelService {
    pub fn new(client: ContractClient, quotas: DecodeQuotas) -> Self {
        Self { client, quotas }
    }

    fn check_name(&self, name: &str) -> Result<(), RemoteError> {
        if name.len() as u64 > self.quotas.max_string_content_length as u64 {
            return Err(RemoteError::fault(
                tonic::Code::ResourceExhausted,
                format!(
                    "string content length {} exceeds quota {}",
                    name.len(),
                    self.quotas.max_string_content_length
                ),
                None,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ModelService for GrpcModelService {
    async fn identify_model(
        &self,
        token: &ServiceSessionToken,
        relative_path: &str,
    ) -> Result<ModelIdentity, RemoteError> {
        let request = proto::IdentifyModelRequest {
            token: Some(token.into()),
            relative_path: relative_path.to_string(),
            force_refresh: true,
        };
        let response: proto::IdentifyModelResponse = self
            .client
            .clone()
            .unary(Operation::IdentifyModel, request)
            .await?;

        if response.identity_guid.is_empty() {
            return Err(RemoteError::fault(
                tonic::Code::NotFound,
                format!("server returned no identity for {}", relative_path),
                None,
            ));
        }
        Ok(ModelIdentity::new(response.identity_guid))
    }

    async fn lock_data(
        &self,
        token: &ServiceModelSessionToken,
        request: &LockRequest,
    ) -> Result<CheckoutEpoch, RemoteError> {
        let message = proto::LockDataRequest {
            token: Some(token.into()),
            options: request.options.bits(),
            allow_non_exclusive: request.allow_non_exclusive,
            version: Some(proto::ModelVersion {
                version_number: request.version_number,
                history_episode: request.history.episode().unwrap_or_default().to_string(),
            }),
        };
        let response: proto::LockDataResponse = self
            .client
            .clone()
            .unary(Operation::LockData, message)
            .await?;
        Ok(CheckoutEpoch::new(response.checkout_epoch))
    }

    async fn list_data_files(
        &self,
        token: &ServiceModelSessionToken,
    ) -> Result<Vec<String>, RemoteError> {
        let message = proto::ListDataFilesRequest {
            token: Some(token.into()),
        };
        let response: proto::ListDataFilesResponse = self
            .client
            .clone()
            .unary(Operation::ListDataFiles, message)
            .await?;

        if response.file_names.len() as u64 > self.quotas.max_array_length as u64 {
            return Err(RemoteError::fault(
                tonic::Code::ResourceExhausted,
                format!(
                    "manifest of {} entries exceeds array quota {}",
                    response.file_names.len(),
                    self.quotas.max_array_length
                ),
                None,
            ));
        }
        for name in &response.file_names {
            self.check_name(name)?;
        }
        Ok(response.file_names)
    }

    async fn download_file(
        &self,
        token: &ServiceModelSessionToken,
        epoch: &CheckoutEpoch,
        source_name: &str,
    ) -> Result<Box<dyn DownloadEnvelope>, RemoteError> {
        let message = proto::DownloadFileRequest {
            token: Some(token.into()),
            checkout_epoch: epoch.as_str().to_string(),
            source_name: source_name.to_string(),
        };
        let mut stream: Streaming<proto::DownloadFileResponse> = self
            .client
            .clone()
            .server_streaming(Operation::DownloadFile, message)
            .await?;

        let first = stream.message().await?;
        Ok(Box::new(GrpcEnvelope::from_first_message(first, stream)))
    }
}

/// Download response, classified by its first message
enum GrpcEnvelope {
    Stream(PayloadReader),
    Buffer(Bytes),
    Empty,
}

impl GrpcEnvelope {
    fn from_first_message(
        first: Option<proto::DownloadFileResponse>,
        rest: Streaming<proto::DownloadFileResponse>,
    ) -> Self {
        match first.and_then(|message| message.payload) {
            Some(Payload::Chunk(chunk)) => {
                let stream = Box::pin(chunk_stream(chunk, rest));
                Self::Stream(Box::new(StreamReader::new(stream)))
            }
            Some(Payload::Buffer(buffer)) => Self::Buffer(buffer),
            None => Self::Empty,
        }
    }
}

/// Re-chain the peeked first chunk in front of the rest of the stream
fn chunk_stream(
    first: Bytes,
    mut rest: Streaming<proto::DownloadFileResponse>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    async_stream::try_stream! {
        yield first;
        while let Some(message) = rest.message().await.map_err(std::io::Error::other)? {
            if let Some(Payload::Chunk(chunk) | Payload::Buffer(chunk)) = message.payload {
                yield chunk;
            }
        }
    }
}

impl DownloadEnvelope for GrpcEnvelope {
    fn take_stream(&mut self) -> Option<PayloadReader> {
        match std::mem::replace(self, Self::Empty) {
            Self::Stream(reader) => Some(reader),
            other => {
                *self = other;
                None
            }
        }
    }

    fn take_buffer(&mut self) -> Option<Bytes> {
        match std::mem::replace(self, Self::Empty) {
            Self::Buffer(buffer) => Some(buffer),
            other => {
                *self = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::model_token;

    #[test]
    fn test_model_session_token_to_wire() {
        let token = model_token();
        let wire = proto::ModelSessionToken::from(&token);

        assert_eq!(wire.identity_guid, token.identity.identity_guid);
        assert_eq!(wire.operation_id, token.operation_id.to_string());
        let location = wire.location.unwrap();
        assert_eq!(location.server, "rs1");
        assert_eq!(location.relative_path, "ProjectA\\Sub\\model.ext");
        assert_eq!(location.kind, proto::LocationKind::Server as i32);
    }

    #[test]
    fn test_service_session_token_to_wire() {
        let session = model_token();
        let token = ServiceSessionToken {
            user_name: session.user_name.clone(),
            sso_user_name: String::new(),
            machine_name: session.machine_name.clone(),
            operation_id: uuid::Uuid::new_v4(),
        };
        let wire = proto::ServiceSessionToken::from(&token);
        assert_eq!(wire.user_name, "ModelExport:ws01:1");
        assert_eq!(wire.machine_name, "ws01");
        assert!(wire.sso_user_name.is_empty());
    }

    #[test]
    fn test_download_response_roundtrip_through_prost() {
        use prost::Message;

        let message = proto::DownloadFileResponse {
            payload: Some(Payload::Buffer(Bytes::from_static(b"abc"))),
        };
        let bytes = message.encode_to_vec();
        let decoded = proto::DownloadFileResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_empty_chunk_survives_the_wire() {
        use prost::Message;

        let message = proto::DownloadFileResponse {
            payload: Some(Payload::Chunk(Bytes::new())),
        };
        let bytes = message.encode_to_vec();
        assert!(!bytes.is_empty());

        let decoded = proto::DownloadFileResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.payload, Some(Payload::Chunk(Bytes::new())));

        let unset = proto::DownloadFileResponse { payload: None };
        let decoded = proto::DownloadFileResponse::decode(unset.encode_to_vec().as_slice());
        assert_eq!(decoded.unwrap().payload, None);
    }
}
