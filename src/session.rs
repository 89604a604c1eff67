//! Session token chain
//!
//! Every remote call carries a token. The chain is built in a fixed order:
//! service session token, then the model identity returned by the server, then
//! the model session token that binds identity and location together. Model
//! session tokens are renewed (never cloned) before each non-idempotent call so
//! that every call carries its own operation id.

use std::fmt;

use uuid::Uuid;

use crate::config::ExporterConfig;
use crate::error::{PipelineError, PipelineResult, RemoteError};
use crate::service::ModelService;

/// Delimiter of caller-facing logical model paths (`|Project|Sub|model.ext`)
pub const LOGICAL_DELIMITER: char = '|';

/// Path separator the server expects in relative model paths
pub const SERVER_SEPARATOR: &str = "\\";

/// Who is calling, from which machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_name: String,
    pub sso_user_name: String,
    pub machine_name: String,
}

impl ClientIdentity {
    pub fn new(
        user_name: impl Into<String>,
        sso_user_name: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            user_name: user_name.into(),
            sso_user_name: sso_user_name.into(),
            machine_name: machine_name.into(),
        }
    }

    /// Build the identity from configuration, falling back to the host name
    pub fn detect(config: &ExporterConfig) -> Self {
        let machine_name = config.machine_name.clone().unwrap_or_else(host_name);
        let user_name = config
            .user_name
            .clone()
            .unwrap_or_else(|| format!("{}:{}:1", config.client_name, machine_name));

        Self {
            user_name,
            sso_user_name: String::new(),
            machine_name,
        }
    }
}

fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

/// Identifies the caller for the lifetime of one export run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSessionToken {
    pub user_name: String,
    pub sso_user_name: String,
    pub machine_name: String,
    pub operation_id: Uuid,
}

/// Caller-supplied model path, split into segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalModelPath {
    segments: Vec<String>,
}

impl LogicalModelPath {
    /// Parse `|A|B|model.ext`; server-style `A\B\model.ext` is accepted as well
    pub fn parse(input: &str) -> PipelineResult<Self> {
        let trimmed = input.trim();
        let parts: Vec<&str> = if trimmed.contains(LOGICAL_DELIMITER) {
            trimmed.split(LOGICAL_DELIMITER).collect()
        } else {
            trimmed.split(['\\', '/']).collect()
        };

        let mut segments = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            if part.is_empty() {
                // only the leading delimiter may produce an empty segment
                if index == 0 {
                    continue;
                }
                return Err(PipelineError::InvalidModelPath(input.to_string()));
            }
            if *part == "." || *part == ".." {
                return Err(PipelineError::InvalidModelPath(input.to_string()));
            }
            segments.push(part.to_string());
        }

        if segments.is_empty() {
            return Err(PipelineError::InvalidModelPath(input.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Relative path in the server's native form (`A\B\model.ext`)
    pub fn to_native_relative(&self) -> String {
        self.segments.join(SERVER_SEPARATOR)
    }
}

impl fmt::Display for LogicalModelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{}{}", LOGICAL_DELIMITER, segment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Server,
    Local,
}

/// Where the model lives: server address plus native relative path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLocation {
    pub server: String,
    pub relative_path: String,
    pub kind: LocationKind,
}

impl ModelLocation {
    pub fn on_server(server: impl Into<String>, path: &LogicalModelPath) -> Self {
        Self {
            server: server.into(),
            relative_path: path.to_native_relative(),
            kind: LocationKind::Server,
        }
    }
}

/// Opaque model handle returned by the identify call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIdentity {
    pub identity_guid: String,
}

impl ModelIdentity {
    pub fn new(identity_guid: impl Into<String>) -> Self {
        Self {
            identity_guid: identity_guid.into(),
        }
    }
}

/// Token carried by every model-scoped call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceModelSessionToken {
    pub identity: ModelIdentity,
    pub location: ModelLocation,
    pub user_name: String,
    pub sso_user_name: String,
    pub machine_name: String,
    pub session_id: Uuid,
    pub operation_id: Uuid,
}

impl ServiceModelSessionToken {
    /// Same identity and location, fresh session and operation ids
    pub fn renew(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            location: self.location.clone(),
            user_name: self.user_name.clone(),
            sso_user_name: self.sso_user_name.clone(),
            machine_name: self.machine_name.clone(),
            session_id: Uuid::new_v4(),
            operation_id: Uuid::new_v4(),
        }
    }
}

/// Builds the token chain for one export run
#[derive(Debug, Clone)]
pub struct SessionProtocol {
    identity: ClientIdentity,
}

impl SessionProtocol {
    pub fn new(identity: ClientIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn create_service_session_token(&self) -> PipelineResult<ServiceSessionToken> {
        self.check_identity()?;

        Ok(ServiceSessionToken {
            user_name: self.identity.user_name.clone(),
            sso_user_name: self.identity.sso_user_name.clone(),
            machine_name: self.identity.machine_name.clone(),
            operation_id: Uuid::new_v4(),
        })
    }

    pub async fn identify_model(
        &self,
        service: &dyn ModelService,
        token: &ServiceSessionToken,
        path: &LogicalModelPath,
    ) -> PipelineResult<ModelIdentity> {
        let relative_path = path.to_native_relative();
        tracing::debug!(model = %path, relative_path = %relative_path, "Identifying model");

        match service.identify_model(token, &relative_path).await {
            Ok(identity) => Ok(identity),
            Err(RemoteError::Fault(fault)) if fault.code == tonic::Code::NotFound => {
                Err(PipelineError::ModelNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn create_model_session_token(
        &self,
        identity: ModelIdentity,
        server_host: &str,
        path: &LogicalModelPath,
    ) -> PipelineResult<ServiceModelSessionToken> {
        self.check_identity()?;
        if server_host.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "server host is required".to_string(),
            ));
        }

        Ok(ServiceModelSessionToken {
            identity,
            location: ModelLocation::on_server(server_host, path),
            user_name: self.identity.user_name.clone(),
            sso_user_name: self.identity.sso_user_name.clone(),
            machine_name: self.identity.machine_name.clone(),
            session_id: Uuid::new_v4(),
            operation_id: Uuid::new_v4(),
        })
    }

    pub fn renew_model_session_token(
        &self,
        existing: &ServiceModelSessionToken,
    ) -> ServiceModelSessionToken {
        existing.renew()
    }

    fn check_identity(&self) -> PipelineResult<()> {
        if self.identity.user_name.trim().is_empty() {
            return Err(PipelineError::MissingIdentity("user name"));
        }
        if self.identity.machine_name.trim().is_empty() {
            return Err(PipelineError::MissingIdentity("machine name"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeModelService;

    fn protocol() -> SessionProtocol {
        SessionProtocol::new(ClientIdentity::new("ModelExport:ws01:1", "", "ws01"))
    }

    #[test]
    fn test_logical_path_to_native() {
        let path = LogicalModelPath::parse("|ProjectA|Sub|model.ext").unwrap();
        assert_eq!(path.to_native_relative(), "ProjectA\\Sub\\model.ext");
        assert_eq!(path.to_string(), "|ProjectA|Sub|model.ext");
    }

    #[test]
    fn test_logical_path_accepts_server_style() {
        let path = LogicalModelPath::parse("ProjectA\\Sub\\model.ext").unwrap();
        assert_eq!(path.segments(), ["ProjectA", "Sub", "model.ext"]);
    }

    #[test]
    fn test_logical_path_rejects_invalid() {
        for input in ["", "   ", "|", "|A||b.ext", "|A|..|b.ext"] {
            assert!(
                matches!(
                    LogicalModelPath::parse(input),
                    Err(PipelineError::InvalidModelPath(_))
                ),
                "accepted {:?}",
                input
            );
        }
    }

    #[test]
    fn test_client_identity_detect_uses_config() {
        let config = ExporterConfig {
            machine_name: Some("ws42".to_string()),
            ..Default::default()
        };
        let identity = ClientIdentity::detect(&config);
        assert_eq!(identity.machine_name, "ws42");
        assert_eq!(identity.user_name, "ModelExport:ws42:1");
        assert!(identity.sso_user_name.is_empty());
    }

    #[test]
    fn test_service_session_token_fresh_operation_ids() {
        let protocol = protocol();
        let a = protocol.create_service_session_token().unwrap();
        let b = protocol.create_service_session_token().unwrap();
        assert_eq!(a.user_name, "ModelExport:ws01:1");
        assert_ne!(a.operation_id, b.operation_id);
    }

    #[test]
    fn test_missing_identity_is_fatal() {
        let protocol = SessionProtocol::new(ClientIdentity::new("user", "", ""));
        assert!(matches!(
            protocol.create_service_session_token(),
            Err(PipelineError::MissingIdentity("machine name"))
        ));

        let protocol = SessionProtocol::new(ClientIdentity::new(" ", "", "ws01"));
        assert!(matches!(
            protocol.create_service_session_token(),
            Err(PipelineError::MissingIdentity("user name"))
        ));
    }

    #[test]
    fn test_model_session_token_location() {
        let protocol = protocol();
        let path = LogicalModelPath::parse("|ProjectA|Sub|model.ext").unwrap();
        let token = protocol
            .create_model_session_token(ModelIdentity::new("abc"), "rs1", &path)
            .unwrap();

        assert_eq!(token.location.server, "rs1");
        assert_eq!(token.location.relative_path, "ProjectA\\Sub\\model.ext");
        assert_eq!(token.location.kind, LocationKind::Server);
        assert!(!token.location.relative_path.starts_with(LOGICAL_DELIMITER));
    }

    #[test]
    fn test_renew_mints_new_ids() {
        let protocol = protocol();
        let path = LogicalModelPath::parse("|A|m.ext").unwrap();
        let token = protocol
            .create_model_session_token(ModelIdentity::new("abc"), "rs1", &path)
            .unwrap();

        let first = protocol.renew_model_session_token(&token);
        let second = protocol.renew_model_session_token(&token);

        assert_ne!(first.operation_id, second.operation_id);
        assert_ne!(first.session_id, second.session_id);
        assert_ne!(first.operation_id, token.operation_id);
        assert_eq!(first.identity, second.identity);
        assert_eq!(first.location, second.location);
        assert_eq!(first.user_name, token.user_name);
    }

    #[tokio::test]
    async fn test_identify_model_sends_native_path() {
        let service = FakeModelService::new();
        let protocol = protocol();
        let token = protocol.create_service_session_token().unwrap();
        let path = LogicalModelPath::parse("|ProjectA|Sub|model.ext").unwrap();

        let identity = protocol
            .identify_model(&service, &token, &path)
            .await
            .unwrap();

        assert_eq!(identity, service.identity());
        assert_eq!(
            service.calls(),
            vec!["identify:ProjectA\\Sub\\model.ext".to_string()]
        );
    }

    #[tokio::test]
    async fn test_identify_model_not_found() {
        let service = FakeModelService::new().with_identify_fault(tonic::Code::NotFound);
        let protocol = protocol();
        let token = protocol.create_service_session_token().unwrap();
        let path = LogicalModelPath::parse("|Missing|model.ext").unwrap();

        let err = protocol
            .identify_model(&service, &token, &path)
            .await
            .unwrap_err();
        match err {
            PipelineError::ModelNotFound(path) => assert_eq!(path, "|Missing|model.ext"),
            other => panic!("expected ModelNotFound, got {:?}", other),
        }
    }
}
