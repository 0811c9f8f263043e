//! File-based artifact store adapter
//!
//! Layout: `<root>/<entity type>/<entity id>.json`, one JSON-encoded
//! [`EntityRecord`] per file. Path components are percent-encoded so ids can
//! never escape the root. Writes go through a temp file and a rename.

use crate::adapter::{Extraction, ProbeReport, StoreAdapter};
use crate::descriptor::{StoreCapabilities, StoreDescriptor, StoreId, StoreRole};
use crate::entity::{EntityId, EntityKey, EntityRecord, EntityType};
use crate::error::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const RECORD_EXT: &str = "json";

/// Adapter for the artifact directory tree
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    descriptor: StoreDescriptor,
    root: PathBuf,
}

type Walked = Vec<(EntityKey, Result<EntityRecord, String>)>;

impl ArtifactStore {
    /// Create an artifact store rooted at `root`
    #[inline]
    #[must_use]
    pub fn new(store_id: impl Into<StoreId>, authority_rank: u32, root: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: StoreDescriptor::global(store_id, StoreRole::Artifact, authority_rank),
            root: root.into(),
        }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`
    #[must_use]
    pub fn record_path(&self, key: &EntityKey) -> PathBuf {
        self.type_dir(&key.entity_type)
            .join(format!("{}.{RECORD_EXT}", encode_component(key.id.as_str())))
    }

    fn type_dir(&self, entity_type: &EntityType) -> PathBuf {
        self.root.join(encode_component(entity_type.as_str()))
    }

    fn io_err(&self, err: &std::io::Error) -> StoreError {
        StoreError::io(&self.descriptor.store_id, err.to_string())
    }

    async fn ids_in(&self, dir: &Path) -> Result<Vec<(EntityId, PathBuf)>, StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_err(&err)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_err(&e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_component);
            if let Some(id) = decoded {
                ids.push((EntityId::new(id), path));
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn entity_types(&self) -> Result<Vec<EntityType>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_err(&err)),
        };
        let mut types = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_err(&e))? {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| self.io_err(&e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(decode_component) {
                types.push(EntityType::new(name));
            }
        }
        Ok(types)
    }

    async fn walk(&self) -> Result<Walked, StoreError> {
        let mut walked = Vec::new();
        for entity_type in self.entity_types().await? {
            for (id, path) in self.ids_in(&self.type_dir(&entity_type)).await? {
                let key = EntityKey::new(entity_type.clone(), id);
                let decoded = match tokio::fs::read(&path).await {
                    Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| e.to_string()),
                    Err(err) => Err(err.to_string()),
                };
                walked.push((key, decoded));
            }
        }
        Ok(walked)
    }
}

#[async_trait]
impl StoreAdapter for ArtifactStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::FULL
    }

    async fn probe(&self) -> Result<ProbeReport, StoreError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StoreError::Corrupted {
                    store_id: self.descriptor.store_id.clone(),
                    detail: format!("{} is not a directory", self.root.display()),
                })
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(ProbeReport::default().with_warning("artifact root missing"));
            }
            Err(err) => return Err(self.io_err(&err)),
        }

        let walked = self.walk().await?;
        let unreadable = walked.iter().filter(|(_, record)| record.is_err()).count();
        let mut report =
            ProbeReport::ok().with_record_count((walked.len() - unreadable) as u64);
        if unreadable > 0 {
            report.structural_failure = true;
            report.warning = Some(format!("{unreadable} unreadable artifact files"));
        }
        Ok(report)
    }

    async fn read_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StoreError> {
        let bytes = match tokio::fs::read(self.record_path(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_err(&err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupted {
                store_id: self.descriptor.store_id.clone(),
                detail: format!("{key}: {e}"),
            })
    }

    async fn write_entity(&self, key: &EntityKey, record: EntityRecord) -> Result<(), StoreError> {
        let path = self.record_path(key);
        let dir = self.type_dir(&key.entity_type);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.io_err(&e))?;

        let bytes = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| self.io_err(&e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| self.io_err(&e))
    }

    async fn delete_entity(&self, key: &EntityKey) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.io_err(&err)),
        }
    }

    async fn list_entities(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError> {
        let ids = self.ids_in(&self.type_dir(entity_type)).await?;
        Ok(ids.into_iter().map(|(id, _)| id).collect())
    }

    async fn extract(&self) -> Result<Extraction, StoreError> {
        let mut extraction = Extraction::default();
        for (key, record) in self.walk().await? {
            match record {
                Ok(record) => extraction.records.push((key, record)),
                Err(reason) => {
                    tracing::debug!(store = %self.descriptor.store_id, %key, %reason, "skipping unreadable artifact");
                    extraction.skipped.push(key);
                }
            }
        }
        Ok(extraction)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| self.io_err(&e))
    }

    async fn recreate(&self) -> Result<(), StoreError> {
        tracing::warn!(store = %self.descriptor.store_id, root = %self.root.display(), "recreating artifact store");
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(self.io_err(&err)),
        }
        self.initialize().await
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_component(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
