use super::{
    CustomHandlerSpec, DataSource, DataSourceKind, HandlerSpec, ProjectDescriptor,
    ProjectNetwork, BLOCK_HANDLER, CALL_HANDLER, EVENT_HANDLER, RUNTIME_DATASOURCE,
};
use crate::{
    error::{IndexerError, Result},
    filter::{BlockFilter, CallFilter, EventFilter, HandlerFilter},
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::debug;

const MANIFEST_FILE: &str = "project.yaml";
const DEFAULT_ENTRY: &str = "main";

/// Project manifest as written on disk, discriminated by `specVersion`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "specVersion")]
pub enum ManifestVersion {
    #[serde(rename = "0.0.1")]
    V0_0_1(ProjectManifestV0_0_1),
    #[serde(rename = "0.2.0")]
    V0_2_0(ProjectManifestV0_2_0),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifestV0_0_1 {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    pub schema: String,
    pub network: NetworkV0_0_1,
    pub data_sources: Vec<DataSourceV0_0_1>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkV0_0_1 {
    pub endpoint: String,
    #[serde(default)]
    pub network_indexer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceV0_0_1 {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub filter: Option<NetworkFilter>,
    pub mapping: RawMapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifestV0_2_0 {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    pub schema: FileReference,
    pub network: NetworkV0_2_0,
    pub data_sources: Vec<DataSourceV0_2_0>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkV0_2_0 {
    pub genesis_hash: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceV0_2_0 {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default)]
    pub filter: Option<NetworkFilter>,
    #[serde(default)]
    pub processor: Option<FileReference>,
    #[serde(default)]
    pub assets: BTreeMap<String, FileReference>,
    pub mapping: RawMapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileReference {
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFilter {
    #[serde(default)]
    pub spec_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMapping {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub handlers: Vec<RawHandler>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHandler {
    pub handler: String,
    pub kind: String,
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
}

fn typed_filter<T: serde::de::DeserializeOwned + Default>(
    raw: &RawHandler,
) -> Result<T> {
    match &raw.filter {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            IndexerError::Manifest(format!("invalid filter for {}: {}", raw.handler, e))
        }),
    }
}

fn runtime_handler(raw: &RawHandler) -> Result<HandlerSpec> {
    let filter = match raw.kind.as_str() {
        BLOCK_HANDLER => HandlerFilter::Block(typed_filter::<BlockFilter>(raw)?),
        CALL_HANDLER => HandlerFilter::Call(typed_filter::<CallFilter>(raw)?),
        EVENT_HANDLER => HandlerFilter::Event(typed_filter::<EventFilter>(raw)?),
        other => {
            return Err(IndexerError::Manifest(format!(
                "handler {} has unsupported kind {} for a runtime data source",
                raw.handler, other
            )))
        }
    };
    Ok(HandlerSpec {
        handler: raw.handler.clone(),
        filter,
    })
}

fn runtime_kind(mapping: &RawMapping) -> Result<DataSourceKind> {
    let handlers = mapping
        .handlers
        .iter()
        .map(runtime_handler)
        .collect::<Result<Vec<_>>>()?;
    Ok(DataSourceKind::Runtime { handlers })
}

impl DataSourceV0_0_1 {
    fn normalize(self) -> Result<DataSource> {
        if self.kind != RUNTIME_DATASOURCE {
            return Err(IndexerError::Manifest(format!(
                "data source {} has kind {}, only {} is supported by manifest 0.0.1",
                self.name, self.kind, RUNTIME_DATASOURCE
            )));
        }
        Ok(DataSource {
            kind: runtime_kind(&self.mapping)?,
            start_block: self.start_block.unwrap_or(1),
            spec_name: self.filter.and_then(|f| f.spec_name),
            entry: self.mapping.file.unwrap_or_else(|| DEFAULT_ENTRY.into()),
            name: self.name,
        })
    }
}

impl DataSourceV0_2_0 {
    fn normalize(self, position: usize) -> Result<DataSource> {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("datasource-{}", position));
        let entry = self.mapping.file.clone().ok_or_else(|| {
            IndexerError::Manifest(format!("data source {} has no mapping.file", name))
        })?;

        let kind = if self.kind == RUNTIME_DATASOURCE {
            runtime_kind(&self.mapping)?
        } else {
            let processor = self.processor.map(|p| p.file).ok_or_else(|| {
                IndexerError::Manifest(format!(
                    "custom data source {} does not declare a processor",
                    name
                ))
            })?;
            DataSourceKind::Custom {
                kind: self.kind.clone(),
                processor,
                assets: self
                    .assets
                    .into_iter()
                    .map(|(k, v)| (k, v.file))
                    .collect(),
                handlers: self
                    .mapping
                    .handlers
                    .iter()
                    .map(|h| CustomHandlerSpec {
                        handler: h.handler.clone(),
                        kind: h.kind.clone(),
                        filter: h.filter.clone(),
                    })
                    .collect(),
            }
        };

        Ok(DataSource {
            name,
            start_block: self.start_block.unwrap_or(1),
            spec_name: self.filter.and_then(|f| f.spec_name),
            entry,
            kind,
        })
    }
}

impl ManifestVersion {
    pub fn spec_version(&self) -> &'static str {
        match self {
            Self::V0_0_1(_) => "0.0.1",
            Self::V0_2_0(_) => "0.2.0",
        }
    }

    /// Converts any manifest version into the canonical descriptor.
    pub fn normalize(self, root: &Path) -> Result<ProjectDescriptor> {
        match self {
            Self::V0_0_1(m) => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "project".into());
                Ok(ProjectDescriptor {
                    name,
                    root: root.to_path_buf(),
                    schema: m.schema,
                    network: ProjectNetwork {
                        endpoint: Some(m.network.endpoint),
                        genesis_hash: None,
                        network_indexer: m.network.network_indexer,
                    },
                    data_sources: m
                        .data_sources
                        .into_iter()
                        .map(DataSourceV0_0_1::normalize)
                        .collect::<Result<_>>()?,
                })
            }
            Self::V0_2_0(m) => Ok(ProjectDescriptor {
                name: m.name,
                root: root.to_path_buf(),
                schema: m.schema.file,
                network: ProjectNetwork {
                    endpoint: m.network.endpoint,
                    genesis_hash: Some(m.network.genesis_hash),
                    network_indexer: None,
                },
                data_sources: m
                    .data_sources
                    .into_iter()
                    .enumerate()
                    .map(|(i, ds)| ds.normalize(i))
                    .collect::<Result<_>>()?,
            }),
        }
    }
}

/// Loads `project.yaml` from a project directory, or the given manifest file.
pub fn load_project(path: &Path) -> Result<ProjectDescriptor> {
    let (root, file): (PathBuf, PathBuf) = if path.is_dir() {
        (path.to_path_buf(), path.join(MANIFEST_FILE))
    } else {
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        (root, path.to_path_buf())
    };

    match file.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") | Some("json") => {}
        other => {
            return Err(IndexerError::Manifest(format!(
                "extension {:?} not supported",
                other
            )))
        }
    }

    let raw = std::fs::read_to_string(&file).map_err(|e| {
        IndexerError::Manifest(format!("failed to read {}: {}", file.display(), e))
    })?;
    let manifest: ManifestVersion = serde_yaml::from_str(&raw)?;
    debug!(
        spec_version = manifest.spec_version(),
        file = %file.display(),
        "Loaded project manifest"
    );
    manifest.normalize(&root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SpecVersionRange;

    const V0_0_1: &str = r#"
specVersion: 0.0.1
description: balances
repository: ""
schema: ./schema.graphql
network:
  endpoint: wss://rpc.polkadot.io
  networkIndexer: https://index.example.com/graphql
dataSources:
  - name: main
    kind: substrate/Runtime
    startBlock: 5
    filter:
      specName: polkadot
    mapping:
      handlers:
        - handler: handleBlock
          kind: substrate/BlockHandler
        - handler: handleTransfer
          kind: substrate/EventHandler
          filter:
            module: balances
            method: Transfer
            specVersion: [1, 10]
"#;

    const V0_2_0: &str = r#"
specVersion: 0.2.0
name: balances-project
version: 1.0.0
schema:
  file: ./schema.graphql
network:
  genesisHash: "0x91b171bb158e2d3848fa23a9f1c25182fb8e20313b2c1eb49219da7a70ce90c3"
dataSources:
  - kind: substrate/Runtime
    mapping:
      file: balances
      handlers:
        - handler: handleCall
          kind: substrate/CallHandler
          filter:
            module: balances
            success: true
  - name: evm
    kind: substrate/Moonbeam
    startBlock: 100
    processor:
      file: ./moonbeam.js
    assets:
      erc20:
        file: ./erc20.abi.json
    mapping:
      file: evm
      handlers:
        - handler: handleLog
          kind: substrate/MoonbeamEvent
          filter:
            topics: ["Transfer(address,address,uint256)"]
"#;

    #[test]
    fn test_normalize_v0_0_1() {
        let manifest: ManifestVersion = serde_yaml::from_str(V0_0_1).unwrap();
        let project = manifest.normalize(Path::new("/projects/balances")).unwrap();

        assert_eq!(project.name, "balances");
        assert_eq!(project.network.endpoint.as_deref(), Some("wss://rpc.polkadot.io"));
        assert_eq!(project.network.genesis_hash, None);
        assert_eq!(
            project.network.network_indexer.as_deref(),
            Some("https://index.example.com/graphql")
        );

        let ds = &project.data_sources[0];
        assert_eq!(ds.entry, "main");
        assert_eq!(ds.start_block, 5);
        assert_eq!(ds.spec_name.as_deref(), Some("polkadot"));
        let DataSourceKind::Runtime { handlers } = &ds.kind else {
            panic!("expected runtime data source");
        };
        assert_eq!(handlers[0], HandlerSpec::block("handleBlock"));
        assert_eq!(
            handlers[1].filter,
            HandlerFilter::Event(EventFilter {
                module: Some("balances".into()),
                method: Some("Transfer".into()),
                spec_version: Some(SpecVersionRange(Some(1), Some(10))),
            })
        );
    }

    #[test]
    fn test_normalize_v0_2_0() {
        let manifest: ManifestVersion = serde_yaml::from_str(V0_2_0).unwrap();
        assert_eq!(manifest.spec_version(), "0.2.0");
        let project = manifest.normalize(Path::new("/p")).unwrap();

        assert_eq!(project.name, "balances-project");
        assert!(project.network.genesis_hash.unwrap().starts_with("0x91b1"));
        assert_eq!(project.network.network_indexer, None);

        let runtime = &project.data_sources[0];
        assert_eq!(runtime.start_block, 1);
        assert_eq!(runtime.entry, "balances");

        let custom = &project.data_sources[1];
        let DataSourceKind::Custom {
            kind,
            assets,
            handlers,
            ..
        } = &custom.kind
        else {
            panic!("expected custom data source");
        };
        assert_eq!(kind, "substrate/Moonbeam");
        assert_eq!(assets["erc20"], "./erc20.abi.json");
        assert_eq!(handlers[0].kind, "substrate/MoonbeamEvent");
        assert!(handlers[0].filter.is_some());
    }

    #[test]
    fn test_unknown_spec_version_rejected() {
        let raw = V0_0_1.replace("0.0.1", "9.9.9");
        assert!(serde_yaml::from_str::<ManifestVersion>(&raw).is_err());
    }

    #[test]
    fn test_runtime_source_rejects_custom_handler() {
        let raw = V0_0_1.replace("substrate/BlockHandler", "substrate/MoonbeamEvent");
        let manifest: ManifestVersion = serde_yaml::from_str(&raw).unwrap();
        assert!(matches!(
            manifest.normalize(Path::new("/p")),
            Err(IndexerError::Manifest(_))
        ));
    }

    #[test]
    fn test_load_project_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("project.yaml"), V0_2_0).unwrap();

        let project = load_project(dir.path()).unwrap();
        assert_eq!(project.data_sources.len(), 2);
        assert_eq!(project.root, dir.path());

        let txt = dir.path().join("project.txt");
        std::fs::write(&txt, V0_2_0).unwrap();
        assert!(load_project(&txt).is_err());
    }
}
