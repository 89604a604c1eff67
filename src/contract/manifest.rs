//! Contract manifest format
//!
//! ```toml
//! library = "ModelServer.Enterprise.Proxy"
//! version = "2024"
//!
//! [[types]]
//! name = "ModelServer.Enterprise.Proxy.ProxyProvider"
//! implementation = "grpc-proxy-provider"
//!
//! [[types.entry_points]]
//! kind = "static-method"
//! name = "CreateProxyInstance"
//! arity = 1
//!
//! [types.endpoints]
//! streamed = "http://{host}:8088/ModelService/{version}/streamed"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{OperationPaths, ProxyMode};
use crate::error::{PipelineError, PipelineResult};

/// One contract library
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LibraryManifest {
    pub library: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub types: Vec<TypeDecl>,
}

impl LibraryManifest {
    pub fn from_toml(content: &str) -> PipelineResult<Self> {
        let manifest: Self =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.library.trim().is_empty() {
            return Err(PipelineError::Config(
                "library name cannot be empty".to_string(),
            ));
        }
        for decl in &self.types {
            if decl.name.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "type without a name in library '{}'",
                    self.library
                )));
            }
        }
        Ok(())
    }

    /// Declarations of `full_name` in this library
    pub fn find_types<'a>(&'a self, full_name: &'a str) -> impl Iterator<Item = &'a TypeDecl> {
        self.types.iter().filter(move |decl| decl.name == full_name)
    }
}

/// A type declared by a contract library
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TypeDecl {
    pub name: String,
    /// Key into the provider implementation registry
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default)]
    pub entry_points: Vec<EntryPoint>,
    #[serde(default)]
    pub endpoints: Option<EndpointTemplates>,
    #[serde(default)]
    pub operations: Option<OperationPaths>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryPointKind {
    StaticMethod,
    StaticProperty,
    Constructor,
}

/// Factory entry point declared on a type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct EntryPoint {
    pub kind: EntryPointKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arity: usize,
}

/// Endpoint URL templates; `{host}` and `{version}` are substituted
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointTemplates {
    #[serde(default)]
    pub streamed: Option<String>,
    #[serde(default)]
    pub buffered: Option<String>,
    #[serde(default)]
    pub routed: Option<String>,
}

impl EndpointTemplates {
    pub fn template(&self, mode: ProxyMode) -> Option<&str> {
        match mode {
            ProxyMode::Streamed => self.streamed.as_deref(),
            ProxyMode::Buffered => self.buffered.as_deref(),
            ProxyMode::Routed => self.routed.as_deref(),
        }
    }

    pub fn modes(&self) -> Vec<ProxyMode> {
        [ProxyMode::Streamed, ProxyMode::Buffered, ProxyMode::Routed]
            .into_iter()
            .filter(|mode| self.template(*mode).is_some())
            .collect()
    }

    pub fn render(&self, mode: ProxyMode, host: &str, version: &str) -> Option<String> {
        let rendered = self.template(mode)?.replace("{host}", host);
        Some(rendered.replace("{version}", version))
    }
}
