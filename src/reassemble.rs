//! Artifact reassembly
//!
//! Staged data files are classified per format version into three indices and
//! merged into one deterministic tar container.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PipelineError, PipelineResult};

/// Target format of the composite artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DataFormatVersion {
    /// Legacy layout
    V1,
    #[default]
    V2,
}

impl DataFormatVersion {
    pub const LATEST: Self = Self::V2;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    fn schema(&self) -> &'static Schema {
        match self {
            Self::V1 => &V1_SCHEMA,
            Self::V2 => &V2_SCHEMA,
        }
    }
}

impl fmt::Display for DataFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataFormatVersion {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" | "v2" | "2" => Ok(Self::V2),
            "v1" | "1" => Ok(Self::V1),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown format version '{}'",
                other
            ))),
        }
    }
}

/// File naming of one format version
struct Schema {
    header: &'static str,
    element: (&'static str, &'static str),
    auxiliary: (&'static str, &'static str),
}

const V1_SCHEMA: Schema = Schema {
    header: "ModelHeader",
    element: ("Elem_", ""),
    auxiliary: ("Steel_", ""),
};

const V2_SCHEMA: Schema = Schema {
    header: "DataHeader.dat",
    element: ("Element", ".dat"),
    auxiliary: ("Auxiliary", ".dat"),
};

fn parse_index(name: &str, (prefix, suffix): (&str, &str)) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Staged files partitioned for the merge step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedIndices {
    /// Non-indexed assets keyed by file name; includes the header
    pub assets: BTreeMap<String, PathBuf>,
    pub elements: BTreeMap<u32, PathBuf>,
    pub auxiliary: BTreeMap<u32, PathBuf>,
}

impl StagedIndices {
    pub fn len(&self) -> usize {
        self.assets.len() + self.elements.len() + self.auxiliary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition the staging directory for `version`
pub fn classify_staged_files(
    staging_dir: &Path,
    version: DataFormatVersion,
) -> PipelineResult<StagedIndices> {
    let schema = version.schema();
    let mut indices = StagedIndices::default();

    for entry in std::fs::read_dir(staging_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        let duplicate = if let Some(index) = parse_index(&name, schema.element) {
            indices.elements.insert(index, path).is_some()
        } else if let Some(index) = parse_index(&name, schema.auxiliary) {
            indices.auxiliary.insert(index, path).is_some()
        } else {
            indices.assets.insert(name.clone(), path).is_some()
        };
        if duplicate {
            return Err(PipelineError::IncompleteStagingSet(format!(
                "{} collides with another staged file",
                name
            )));
        }
    }

    if !indices.assets.contains_key(schema.header) {
        return Err(PipelineError::IncompleteStagingSet(format!(
            "missing {} required by format {}",
            schema.header, version
        )));
    }

    tracing::debug!(
        assets = indices.assets.len(),
        elements = indices.elements.len(),
        auxiliary = indices.auxiliary.len(),
        format = %version,
        "Classified staged files"
    );

    Ok(indices)
}

/// Write the composite artifact to `destination`
///
/// The container is written to a temporary sibling and renamed into place, so
/// `destination` is either absent or complete.
pub async fn merge_to_artifact(
    indices: &StagedIndices,
    version: DataFormatVersion,
    destination: &Path,
) -> PipelineResult<u64> {
    let indices = indices.clone();
    let destination = destination.to_path_buf();

    tokio::task::spawn_blocking(move || write_artifact(&indices, version, &destination))
        .await
        .map_err(|e| PipelineError::ReassemblyFailed(e.to_string()))?
}

fn write_artifact(
    indices: &StagedIndices,
    version: DataFormatVersion,
    destination: &Path,
) -> PipelineResult<u64> {
    let file_name = destination
        .file_name()
        .ok_or_else(|| {
            PipelineError::ReassemblyFailed(format!(
                "destination {} has no file name",
                destination.display()
            ))
        })?
        .to_string_lossy()
        .into_owned();
    let temp_file = destination.with_file_name(format!(".{}.tmp", file_name));

    let result = build_container(indices, version, &temp_file).and_then(|size| {
        std::fs::rename(&temp_file, destination)?;
        Ok(size)
    });

    result.map_err(|e| {
        let _ = std::fs::remove_file(&temp_file);
        PipelineError::ReassemblyFailed(format!("{}: {}", destination.display(), e))
    })
}

fn build_container(
    indices: &StagedIndices,
    version: DataFormatVersion,
    path: &Path,
) -> std::io::Result<u64> {
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let marker = format!("{}\n", version);
    let size = marker.len() as u64;
    append(&mut builder, "FORMAT", size, marker.as_bytes())?;

    for (name, source) in &indices.assets {
        append_file(&mut builder, &format!("assets/{}", name), source)?;
    }
    for (index, source) in &indices.elements {
        append_file(&mut builder, &format!("elements/{}", index), source)?;
    }
    for (index, source) in &indices.auxiliary {
        append_file(&mut builder, &format!("auxiliary/{}", index), source)?;
    }

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    file.metadata().map(|m| m.len())
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    source: &Path,
) -> std::io::Result<()> {
    let file = File::open(source)?;
    let size = file.metadata()?.len();
    append(builder, name, size, file)
}

fn append<W: Write, R: std::io::Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: R,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, name, data)
}
