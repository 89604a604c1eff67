//! Contract type and factory resolution
//!
//! Type names have moved between namespaces across server versions, and the
//! provider has been exposed through several different entry points. Both are
//! handled with ordered lookup tables rather than per-version code.

use dashmap::DashMap;
use std::sync::Arc;

use super::loader::LibraryLoader;
use super::manifest::{EntryPoint, EntryPointKind, TypeDecl};
use super::{
    FactoryCall, Implementations, MODEL_SERVICE_TYPE, PROXY_PROVIDER_TYPE, ProviderContext,
    ProxyProvider, ServiceContract,
};
use crate::config::NamingRule;
use crate::error::{PipelineError, PipelineResult};

/// A type resolved from a loaded library
#[derive(Debug, Clone)]
pub struct TypeHandle {
    pub library: String,
    pub decl: Arc<TypeDecl>,
}

impl TypeHandle {
    pub fn name(&self) -> &str {
        &self.decl.name
    }
}

/// One row of the factory entry-point table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointSpec {
    pub kind: EntryPointKind,
    pub name: &'static str,
    pub arity: usize,
}

const fn method(name: &'static str, arity: usize) -> EntryPointSpec {
    EntryPointSpec {
        kind: EntryPointKind::StaticMethod,
        name,
        arity,
    }
}

const fn property(name: &'static str) -> EntryPointSpec {
    EntryPointSpec {
        kind: EntryPointKind::StaticProperty,
        name,
        arity: 0,
    }
}

const fn constructor(arity: usize) -> EntryPointSpec {
    EntryPointSpec {
        kind: EntryPointKind::Constructor,
        name: "",
        arity,
    }
}

/// Provider entry points, tried in order. Arity 1 receives the server version.
pub const FACTORY_ENTRY_POINTS: &[EntryPointSpec] = &[
    method("CreateProxyInstance", 1),
    method("CreateProxyInstance", 0),
    method("CreateInstance", 1),
    method("CreateInstance", 0),
    method("Create", 1),
    method("Create", 0),
    method("GetInstance", 1),
    method("GetInstance", 0),
    property("Instance"),
    property("Current"),
    property("Default"),
    constructor(0),
    constructor(1),
];

impl EntryPointSpec {
    pub fn matches(&self, entry: &EntryPoint) -> bool {
        entry.kind == self.kind
            && entry.arity == self.arity
            && (self.kind == EntryPointKind::Constructor || entry.name == self.name)
    }

    fn describe(&self) -> String {
        match self.kind {
            EntryPointKind::Constructor => format!("constructor/{}", self.arity),
            _ => format!("{}/{}", self.name, self.arity),
        }
    }
}

/// Resolves contract types and provider factories from loaded libraries
pub struct ContractResolver {
    loader: Arc<LibraryLoader>,
    naming_rules: Vec<NamingRule>,
    implementations: Implementations,
    cache: DashMap<String, TypeHandle>,
}

impl ContractResolver {
    pub fn new(
        loader: Arc<LibraryLoader>,
        naming_rules: Vec<NamingRule>,
        implementations: Implementations,
    ) -> Self {
        Self {
            loader,
            naming_rules,
            implementations,
            cache: DashMap::new(),
        }
    }

    /// Resolve a logical type name, trying the naming rules after the name as given
    pub fn resolve_type(&self, logical_name: &str) -> PipelineResult<TypeHandle> {
        if let Some(handle) = self.cache.get(logical_name) {
            return Ok(handle.clone());
        }

        let renamed = self
            .naming_rules
            .iter()
            .filter_map(|rule| rule.apply(logical_name));
        let candidates = std::iter::once(logical_name.to_string()).chain(renamed);

        for candidate in candidates {
            if let Some(handle) = self.loader.resolve_type_in_any_loaded_library(&candidate)? {
                tracing::debug!(
                    logical_name,
                    resolved = %candidate,
                    library = %handle.library,
                    "Resolved contract type"
                );
                self.cache.insert(logical_name.to_string(), handle.clone());
                return Ok(handle);
            }
        }

        Err(PipelineError::ContractNotFound(logical_name.to_string()))
    }

    /// Construct a provider through the first entry point that yields a usable one
    pub fn resolve_factory(
        &self,
        provider_type: &TypeHandle,
        table: &[EntryPointSpec],
        context: &ProviderContext,
    ) -> PipelineResult<Arc<dyn ProxyProvider>> {
        let decl = provider_type.decl.as_ref();
        let mut last_failure: Option<String> = None;

        for spec in table {
            let matching: Vec<&EntryPoint> = decl
                .entry_points
                .iter()
                .filter(|e| spec.matches(e))
                .collect();
            let entry_point = match matching.as_slice() {
                [] => continue,
                [single] => *single,
                _ => {
                    return Err(PipelineError::ContractAmbiguous {
                        name: format!("{}::{}", decl.name, spec.describe()),
                        candidates: matching
                            .iter()
                            .map(|e| format!("{:?} {}/{}", e.kind, e.name, e.arity))
                            .collect(),
                    });
                }
            };

            let key = decl.implementation.as_deref().ok_or_else(|| {
                PipelineError::ContractNotFound(format!("{} has no implementation", decl.name))
            })?;
            let construct = self.implementations.get(key).ok_or_else(|| {
                PipelineError::ContractNotFound(format!(
                    "no implementation registered for '{}' ({})",
                    key, decl.name
                ))
            })?;

            let args: Vec<String> = match spec.arity {
                0 => Vec::new(),
                _ => vec![context.version.clone()],
            };
            let call = FactoryCall {
                context,
                type_decl: decl,
                entry_point,
                args: &args,
            };

            match construct(&call) {
                Ok(provider) if !provider.capabilities().is_empty() => {
                    tracing::debug!(
                        provider = %decl.name,
                        entry_point = %spec.describe(),
                        "Constructed proxy provider"
                    );
                    return Ok(provider);
                }
                Ok(_) => {
                    last_failure = Some(format!(
                        "{} via {} exposes no proxy capability",
                        decl.name,
                        spec.describe()
                    ));
                }
                Err(e) => {
                    tracing::debug!(
                        entry_point = %spec.describe(),
                        error = %e,
                        "Provider entry point failed"
                    );
                    last_failure = Some(format!("{} via {}: {}", decl.name, spec.describe(), e));
                }
            }
        }

        let reason = match last_failure {
            Some(reason) => reason,
            None => format!("no usable factory entry point on {}", decl.name),
        };
        Err(PipelineError::ContractNotFound(reason))
    }

    /// Proxy provider through the default entry-point table
    pub fn resolve_provider(
        &self,
        context: &ProviderContext,
    ) -> PipelineResult<Arc<dyn ProxyProvider>> {
        let provider_type = self.resolve_type(PROXY_PROVIDER_TYPE)?;
        self.resolve_factory(&provider_type, FACTORY_ENTRY_POINTS, context)
    }

    pub fn resolve_service_contract(&self) -> PipelineResult<ServiceContract> {
        let handle = self.resolve_type(MODEL_SERVICE_TYPE)?;
        super::service_contract(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::contract::{ProxyMode, PROXY_LIBRARY};
    use crate::testing::FakeProxyProvider;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn context() -> ProviderContext {
        ProviderContext {
            version: "2024".to_string(),
            transport: TransportConfig::default(),
        }
    }

    fn loader_with(manifest: &str) -> (TempDir, Arc<LibraryLoader>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("proxy.toml"), manifest).unwrap();
        let loader = LibraryLoader::from_dir(dir.path(), &[PROXY_LIBRARY.to_string()]).unwrap();
        (dir, Arc::new(loader))
    }

    fn fake_implementations(
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: &'static [&'static str],
    ) -> Implementations {
        let mut implementations = Implementations::new();
        implementations.register(
            "fake",
            Arc::new(move |call: &FactoryCall<'_>| {
                let label = format!("{}/{}", call.entry_point.name, call.args.join(","));
                calls.lock().unwrap().push(label);
                if fail_on.contains(&call.entry_point.name.as_str()) {
                    return Err(PipelineError::InvalidInput("factory threw".to_string()));
                }
                let provider: Arc<dyn ProxyProvider> =
                    Arc::new(FakeProxyProvider::new(vec![ProxyMode::Buffered]));
                Ok(provider)
            }),
        );
        implementations.register(
            "incapable",
            Arc::new(|_: &FactoryCall<'_>| {
                let provider: Arc<dyn ProxyProvider> = Arc::new(FakeProxyProvider::new(vec![]));
                Ok(provider)
            }),
        );
        implementations
    }

    const RENAMED_PROVIDER: &str = r#"
        library = "ModelServer.Enterprise.Proxy"

        [[types]]
        name = "MS.Enterprise.Proxy.ProxyProvider"
        implementation = "fake"

        [[types.entry_points]]
        kind = "static-property"
        name = "Instance"

        [[types.entry_points]]
        kind = "static-method"
        name = "Create"
        arity = 1
    "#;

    #[test]
    fn test_resolve_type_through_naming_rule() {
        let (_dir, loader) = loader_with(RENAMED_PROVIDER);
        let resolver = ContractResolver::new(
            loader,
            vec![NamingRule::new("ModelServer.", "MS.")],
            Implementations::new(),
        );

        let handle = resolver.resolve_type(PROXY_PROVIDER_TYPE).unwrap();
        assert_eq!(handle.name(), "MS.Enterprise.Proxy.ProxyProvider");
        assert_eq!(handle.library, PROXY_LIBRARY);

        // served from the cache afterwards
        assert!(resolver.cache.contains_key(PROXY_PROVIDER_TYPE));
        let cached = resolver.resolve_type(PROXY_PROVIDER_TYPE).unwrap();
        assert_eq!(cached.name(), handle.name());
    }

    #[test]
    fn test_resolve_type_not_found() {
        let (_dir, loader) = loader_with(RENAMED_PROVIDER);
        let resolver = ContractResolver::new(loader, vec![], Implementations::new());

        assert!(matches!(
            resolver.resolve_type(PROXY_PROVIDER_TYPE),
            Err(PipelineError::ContractNotFound(name)) if name == PROXY_PROVIDER_TYPE
        ));
    }

    #[test]
    fn test_factory_table_order() {
        let (_dir, loader) = loader_with(RENAMED_PROVIDER);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = ContractResolver::new(
            loader,
            vec![NamingRule::new("ModelServer.", "MS.")],
            fake_implementations(calls.clone(), &[]),
        );

        let provider = resolver.resolve_provider(&context()).unwrap();
        assert_eq!(provider.preferred_mode(), Some(ProxyMode::Buffered));
        // Create/1 precedes the Instance property in the table
        assert_eq!(*calls.lock().unwrap(), vec!["Create/2024".to_string()]);
    }

    #[test]
    fn test_factory_falls_through_failing_entry_point() {
        let (_dir, loader) = loader_with(RENAMED_PROVIDER);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = ContractResolver::new(
            loader,
            vec![NamingRule::new("ModelServer.", "MS.")],
            fake_implementations(calls.clone(), &["Create"]),
        );

        resolver.resolve_provider(&context()).unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["Create/2024".to_string(), "Instance/".to_string()]
        );
    }

    #[test]
    fn test_factory_rejects_provider_without_capabilities() {
        let (_dir, loader) = loader_with(
            r#"
            library = "ModelServer.Enterprise.Proxy"
            [[types]]
            name = "ModelServer.Enterprise.Proxy.ProxyProvider"
            implementation = "incapable"
            [[types.entry_points]]
            kind = "constructor"
            "#,
        );
        let resolver = ContractResolver::new(
            loader,
            vec![],
            fake_implementations(Arc::new(Mutex::new(Vec::new())), &[]),
        );

        match resolver.resolve_provider(&context()) {
            Err(PipelineError::ContractNotFound(msg)) => {
                assert!(msg.contains("no proxy capability"), "{}", msg)
            }
            Err(other) => panic!("expected ContractNotFound, got {:?}", other),
            Ok(_) => panic!("incapable provider accepted"),
        }
    }

    #[test]
    fn test_duplicate_entry_point_is_ambiguous() {
        let (_dir, loader) = loader_with(
            r#"
            library = "ModelServer.Enterprise.Proxy"
            [[types]]
            name = "ModelServer.Enterprise.Proxy.ProxyProvider"
            implementation = "fake"
            [[types.entry_points]]
            kind = "static-method"
            name = "GetInstance"
            [[types.entry_points]]
            kind = "static-method"
            name = "GetInstance"
            "#,
        );
        let resolver = ContractResolver::new(
            loader,
            vec![],
            fake_implementations(Arc::new(Mutex::new(Vec::new())), &[]),
        );

        assert!(matches!(
            resolver.resolve_provider(&context()),
            Err(PipelineError::ContractAmbiguous { .. })
        ));
    }

    #[test]
    fn test_unregistered_implementation() {
        let (_dir, loader) = loader_with(
            r#"
            library = "ModelServer.Enterprise.Proxy"
            [[types]]
            name = "ModelServer.Enterprise.Proxy.ProxyProvider"
            implementation = "missing"
            [[types.entry_points]]
            kind = "constructor"
            "#,
        );
        let resolver = ContractResolver::new(loader, vec![], Implementations::new());

        assert!(matches!(
            resolver.resolve_provider(&context()),
            Err(PipelineError::ContractNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_service_contract() {
        let (_dir, loader) = loader_with(
            r#"
            library = "ModelServer.Enterprise.Proxy"
            [[types]]
            name = "ModelServer.Enterprise.Common.ClientServer.ServiceContract.Model.IModelService"
            [types.operations]
            identify_model = "/rs.Model/Identify"
            lock_data = "/rs.Model/Lock"
            list_data_files = "/rs.Model/List"
            download_file = "/rs.Model/Download"
            "#,
        );
        let resolver = ContractResolver::new(loader, vec![], Implementations::new());

        let contract = resolver.resolve_service_contract().unwrap();
        assert_eq!(contract.name, MODEL_SERVICE_TYPE);
        assert_eq!(contract.operations.lock_data, "/rs.Model/Lock");
    }
}
