//! Wire messages of the model service

use prost::bytes::Bytes;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceSessionToken {
    #[prost(string, tag = "1")]
    pub user_name: String,
    #[prost(string, tag = "2")]
    pub sso_user_name: String,
    #[prost(string, tag = "3")]
    pub machine_name: String,
    #[prost(string, tag = "4")]
    pub operation_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum LocationKind {
    Server = 0,
    Local = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ModelLocation {
    #[prost(string, tag = "1")]
    pub server: String,
    #[prost(string, tag = "2")]
    pub relative_path: String,
    #[prost(enumeration = "LocationKind", tag = "3")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ModelSessionToken {
    #[prost(string, tag = "1")]
    pub identity_guid: String,
    #[prost(message, optional, tag = "2")]
    pub location: Option<ModelLocation>,
    #[prost(string, tag = "3")]
    pub user_name: String,
    #[prost(string, tag = "4")]
    pub sso_user_name: String,
    #[prost(string, tag = "5")]
    pub machine_name: String,
    #[prost(string, tag = "6")]
    pub session_id: String,
    #[prost(string, tag = "7")]
    pub operation_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentifyModelRequest {
    #[prost(message, optional, tag = "1")]
    pub token: Option<ServiceSessionToken>,
    #[prost(string, tag = "2")]
    pub relative_path: String,
    /// Always set by this client
    #[prost(bool, tag = "3")]
    pub force_refresh: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IdentifyModelResponse {
    #[prost(string, tag = "1")]
    pub identity_guid: String,
}

/// Version the lock starts from; an empty episode is the invalid marker
#[derive(Clone, PartialEq, prost::Message)]
pub struct ModelVersion {
    #[prost(int32, tag = "1")]
    pub version_number: i32,
    #[prost(string, tag = "2")]
    pub history_episode: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LockDataRequest {
    #[prost(message, optional, tag = "1")]
    pub token: Option<ModelSessionToken>,
    #[prost(uint32, tag = "2")]
    pub options: u32,
    #[prost(bool, tag = "3")]
    pub allow_non_exclusive: bool,
    #[prost(message, optional, tag = "4")]
    pub version: Option<ModelVersion>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LockDataResponse {
    #[prost(string, tag = "1")]
    pub checkout_epoch: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListDataFilesRequest {
    #[prost(message, optional, tag = "1")]
    pub token: Option<ModelSessionToken>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ListDataFilesResponse {
    #[prost(string, repeated, tag = "1")]
    pub file_names: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DownloadFileRequest {
    #[prost(message, optional, tag = "1")]
    pub token: Option<ModelSessionToken>,
    #[prost(string, tag = "2")]
    pub checkout_epoch: String,
    #[prost(string, tag = "3")]
    pub source_name: String,
}

/// One message of a download response stream
///
/// A body is either a run of `chunk` messages or one `buffer` message. A
/// zero-byte file is sent as a single empty `chunk`, since an empty oneof
/// member is still encoded. A stream that ends before its first message, or
/// whose first message has no payload set, carries no body at all.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DownloadFileResponse {
    #[prost(oneof = "download_file_response::Payload", tags = "1, 2")]
    pub payload: Option<download_file_response::Payload>,
}

pub mod download_file_response {
    use super::Bytes;

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        /// Part of a streamed body
        #[prost(bytes = "bytes", tag = "1")]
        Chunk(Bytes),
        /// Whole body in one message
        #[prost(bytes = "bytes", tag = "2")]
        Buffer(Bytes),
    }
}
