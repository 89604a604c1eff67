//! Contract library discovery and loading

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::manifest::LibraryManifest;
use super::resolver::TypeHandle;
use super::PROXY_LIBRARY;
use crate::error::{PipelineError, PipelineResult};

/// Folder name whose manifests win over any other copy of the same library
const OVERRIDES_DIR: &str = "overrides";

/// A loaded contract library
#[derive(Debug, Clone)]
pub struct LoadedLibrary {
    pub name: String,
    pub path: PathBuf,
    pub manifest: LibraryManifest,
    pub modified: SystemTime,
    pub is_override: bool,
}

/// Contract libraries loaded from one directory
#[derive(Debug)]
pub struct LibraryLoader {
    directory: PathBuf,
    libraries: HashMap<String, Arc<LoadedLibrary>>,
}

impl LibraryLoader {
    /// Locate a contract directory and load the required libraries from it
    ///
    /// The first candidate directory containing the proxy library is used.
    pub fn load(
        version_hint: Option<&str>,
        explicit_dir: Option<&Path>,
        required: &[String],
    ) -> PipelineResult<Self> {
        let candidates = Self::candidate_dirs(version_hint, explicit_dir);

        for dir in &candidates {
            if !dir.is_dir() {
                continue;
            }
            let scanned = scan_directory(dir);
            if !scanned.contains_key(PROXY_LIBRARY) {
                tracing::debug!(dir = %dir.display(), "No proxy library in contract directory");
                continue;
            }
            return Self::from_scanned(dir, scanned, required);
        }

        Err(PipelineError::ContractNotFound(format!(
            "no contract directory contains {} (searched: {})",
            PROXY_LIBRARY,
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Load libraries from a known directory
    pub fn from_dir(dir: &Path, required: &[String]) -> PipelineResult<Self> {
        if !dir.is_dir() {
            return Err(PipelineError::ContractNotFound(format!(
                "contract directory {} does not exist",
                dir.display()
            )));
        }
        Self::from_scanned(dir, scan_directory(dir), required)
    }

    /// Search order: explicit dir, then versioned and plain `contracts` folders
    /// next to the executable, then in the user config dir
    pub fn candidate_dirs(version_hint: Option<&str>, explicit_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        if let Some(dir) = explicit_dir {
            dirs.push(dir.to_path_buf());
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let config_dir = dirs::config_dir().map(|dir| dir.join("model-export"));

        for base in [exe_dir, config_dir].into_iter().flatten() {
            let contracts = base.join("contracts");
            if let Some(version) = version_hint.filter(|v| !v.trim().is_empty()) {
                dirs.push(contracts.join(version));
            }
            dirs.push(contracts);
        }

        dirs
    }

    fn from_scanned(
        dir: &Path,
        libraries: HashMap<String, Arc<LoadedLibrary>>,
        required: &[String],
    ) -> PipelineResult<Self> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|name| !libraries.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::ContractNotFound(format!(
                "required contract libraries missing from {}: {}",
                dir.display(),
                missing.join(", ")
            )));
        }

        tracing::info!(
            dir = %dir.display(),
            libraries = libraries.len(),
            "Loaded contract libraries"
        );

        Ok(Self {
            directory: dir.to_path_buf(),
            libraries,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn find_library(&self, name: &str) -> Option<Arc<LoadedLibrary>> {
        self.libraries.get(name).cloned()
    }

    pub fn libraries(&self) -> impl Iterator<Item = &Arc<LoadedLibrary>> {
        self.libraries.values()
    }

    /// Look a fully qualified type up across every loaded library
    pub fn resolve_type_in_any_loaded_library(
        &self,
        full_name: &str,
    ) -> PipelineResult<Option<TypeHandle>> {
        let mut names: Vec<&String> = self.libraries.keys().collect();
        names.sort();

        let mut found = Vec::new();
        for name in names {
            let library = &self.libraries[name];
            for decl in library.manifest.find_types(full_name) {
                found.push(TypeHandle {
                    library: library.name.clone(),
                    decl: Arc::new(decl.clone()),
                });
            }
        }

        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(PipelineError::ContractAmbiguous {
                name: full_name.to_string(),
                candidates: found.iter().map(|h| h.library.clone()).collect(),
            }),
        }
    }
}

/// Load every manifest under `dir`, keeping the preferred copy of each library
fn scan_directory(dir: &Path) -> HashMap<String, Arc<LoadedLibrary>> {
    let mut libraries: HashMap<String, Arc<LoadedLibrary>> = HashMap::new();

    for path in manifest_files(dir) {
        let manifest = match LibraryManifest::load(&path) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable contract manifest"
                );
                continue;
            }
        };

        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let is_override = path
            .strip_prefix(dir)
            .map(|relative| {
                relative.components().any(|c| {
                    c.as_os_str()
                        .to_string_lossy()
                        .eq_ignore_ascii_case(OVERRIDES_DIR)
                })
            })
            .unwrap_or(false);

        let candidate = LoadedLibrary {
            name: manifest.library.clone(),
            path,
            manifest,
            modified,
            is_override,
        };

        let replace = libraries.get(&candidate.name).is_none_or(|current| {
            (candidate.is_override, candidate.modified) > (current.is_override, current.modified)
        });
        if replace {
            libraries.insert(candidate.name.clone(), Arc::new(candidate));
        }
    }

    libraries
}

fn manifest_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    dir = %current.display(),
                    error = %e,
                    "Cannot read contract directory"
                );
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MODEL_CONTRACT_LIBRARY;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_library(path: &Path, library: &str, types: &[&str]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut content = format!("library = \"{}\"\n", library);
        for name in types {
            content.push_str(&format!("\n[[types]]\nname = \"{}\"\n", name));
        }
        std::fs::write(path, content).unwrap();
    }

    fn required() -> Vec<String> {
        vec![
            PROXY_LIBRARY.to_string(),
            MODEL_CONTRACT_LIBRARY.to_string(),
        ]
    }

    #[test]
    fn test_load_from_explicit_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_library(&root.join("proxy.toml"), PROXY_LIBRARY, &["P.Provider"]);
        write_library(
            &root.join("nested/contract.toml"),
            MODEL_CONTRACT_LIBRARY,
            &["C.IService"],
        );

        let loader = LibraryLoader::load(Some("2024"), Some(dir.path()), &required()).unwrap();
        assert_eq!(loader.directory(), dir.path());
        assert!(loader.find_library(PROXY_LIBRARY).is_some());
        assert!(loader.find_library(MODEL_CONTRACT_LIBRARY).is_some());
        assert!(loader.find_library("Unknown").is_none());
    }

    #[test]
    fn test_missing_required_library() {
        let dir = TempDir::new().unwrap();
        write_library(&dir.path().join("proxy.toml"), PROXY_LIBRARY, &[]);

        let err = LibraryLoader::from_dir(dir.path(), &required()).unwrap_err();
        match err {
            PipelineError::ContractNotFound(msg) => assert!(msg.contains(MODEL_CONTRACT_LIBRARY)),
            other => panic!("expected ContractNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_candidate_dirs_order() {
        let explicit = PathBuf::from("/opt/contracts");
        let dirs = LibraryLoader::candidate_dirs(Some("2024"), Some(&explicit));
        assert_eq!(dirs[0], explicit);
        assert!(dirs[1].ends_with("contracts/2024"));
        assert!(dirs[2].ends_with("contracts"));
    }

    #[test]
    fn test_override_folder_wins() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_library(
            &root.join("overrides/proxy.toml"),
            PROXY_LIBRARY,
            &["Old.Provider"],
        );
        write_library(&root.join("proxy.toml"), PROXY_LIBRARY, &["New.Provider"]);

        let loader = LibraryLoader::from_dir(dir.path(), &[]).unwrap();
        let library = loader.find_library(PROXY_LIBRARY).unwrap();
        assert!(library.is_override);
        assert_eq!(library.manifest.types[0].name, "Old.Provider");
    }

    #[test]
    fn test_newest_copy_wins() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("a/proxy.toml");
        let new = dir.path().join("b/proxy.toml");
        write_library(&old, PROXY_LIBRARY, &["Old.Provider"]);
        write_library(&new, PROXY_LIBRARY, &["New.Provider"]);

        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let loader = LibraryLoader::from_dir(dir.path(), &[]).unwrap();
        let library = loader.find_library(PROXY_LIBRARY).unwrap();
        assert_eq!(library.path, new);
    }

    #[test]
    fn test_invalid_manifest_skipped() {
        let dir = TempDir::new().unwrap();
        write_library(&dir.path().join("proxy.toml"), PROXY_LIBRARY, &[]);
        std::fs::write(dir.path().join("broken.toml"), "library = ").unwrap();

        let loader = LibraryLoader::from_dir(dir.path(), &[]).unwrap();
        assert_eq!(loader.libraries().count(), 1);
    }

    #[test]
    fn test_type_declared_twice_is_ambiguous() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_library(&root.join("a.toml"), "LibA", &["Shared.Type"]);
        write_library(&root.join("b.toml"), "LibB", &["Shared.Type", "Only.B"]);

        let loader = LibraryLoader::from_dir(dir.path(), &[]).unwrap();

        let handle = loader
            .resolve_type_in_any_loaded_library("Only.B")
            .unwrap()
            .unwrap();
        assert_eq!(handle.library, "LibB");
        let missing = loader
            .resolve_type_in_any_loaded_library("Missing")
            .unwrap();
        assert!(missing.is_none());

        match loader.resolve_type_in_any_loaded_library("Shared.Type") {
            Err(PipelineError::ContractAmbiguous { name, candidates }) => {
                assert_eq!(name, "Shared.Type");
                assert_eq!(candidates, vec!["LibA".to_string(), "LibB".to_string()]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }
}
