//! Content-addressed on-disk store. Every discovered file — the root
//! input and every carved or extracted child — lives in its own
//! subdirectory named by the SHA-256 hex of its bytes (the root is the
//! one well-known exception, named `root`).
//!
//! Grounded on the original project's `OffsetInputFile`/`MetaDirectory`
//! pair for the on-disk shape, and on the teacher's `ArchiveWriter`
//! temp-file-then-rename commit pattern for atomic writes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, TriageError};

fn default_schema_version() -> u32 {
    1
}

/// The committed info record for one MetaDirectory. Self-describing and
/// forward-compatible: unknown keys round-trip through `extra` so a
/// reader built against an older schema version never loses data it
/// doesn't understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaInfo {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub unpack_parser: Option<String>,
    #[serde(default)]
    pub extracted_files: BTreeMap<String, String>,
    #[serde(default)]
    pub unpacked_relative_files: BTreeMap<String, String>,
    #[serde(default)]
    pub unpacked_absolute_files: BTreeMap<String, String>,
    #[serde(default)]
    pub unpacked_symlinks: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MetaInfo {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            labels: BTreeSet::new(),
            metadata: Map::new(),
            unpack_parser: None,
            extracted_files: BTreeMap::new(),
            unpacked_relative_files: BTreeMap::new(),
            unpacked_absolute_files: BTreeMap::new(),
            unpacked_symlinks: BTreeMap::new(),
            extra: Map::new(),
        }
    }
}

/// A store-relative handle to one MetaDirectory: either the literal
/// string `"root"` or the lowercase hex SHA-256 of its bytes. Cheap to
/// clone and pass through channels — this is the "parent-to-child links
/// are by string, not by pointer" design the store relies on to avoid
/// cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetaDirectoryRef(pub String);

impl std::fmt::Display for MetaDirectoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

const TMP_PREFIX: &str = ".tmp-";

pub struct MetaDirectoryStore {
    root: PathBuf,
}

impl MetaDirectoryStore {
    /// Opens (creating if necessary) the store rooted at `root`.
    pub fn open_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| TriageError::io(e, root.clone()))?;
        Ok(Self { root })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn root_ref() -> MetaDirectoryRef {
        MetaDirectoryRef("root".to_string())
    }

    fn path_for(&self, r: &MetaDirectoryRef) -> PathBuf {
        self.root.join(&r.0)
    }

    /// Registers the initial input as the root MetaDirectory. Per the
    /// store's documented exception, the root's bytes are not copied
    /// into the store — `file_path` simply records the original path.
    pub fn register_root(&self, input_path: &Path) -> Result<MetaDirectoryRef> {
        let r = Self::root_ref();
        let dir = self.path_for(&r);
        fs::create_dir_all(&dir).map_err(|e| TriageError::io(e, dir.clone()))?;
        let name = input_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| input_path.to_string_lossy().to_string());
        fs::write(dir.join("pathname"), name.as_bytes())
            .map_err(|e| TriageError::io(e, dir.join("pathname")))?;
        fs::write(
            dir.join("file_path"),
            input_path.to_string_lossy().as_bytes(),
        )
        .map_err(|e| TriageError::io(e, dir.join("file_path")))?;
        if !dir.join("info.json").exists() {
            self.write_info(&r, &MetaInfo::default())?;
        }
        Ok(r)
    }

    /// Resolves where a MetaDirectory's bytes currently live on disk: a
    /// carved blob for anything created by the store itself, or the
    /// recorded external path for the root.
    pub fn file_path(&self, r: &MetaDirectoryRef) -> Result<PathBuf> {
        let dir = self.path_for(r);
        let blob = dir.join("blob");
        if blob.exists() {
            return Ok(blob);
        }
        let recorded = dir.join("file_path");
        if recorded.exists() {
            let text = fs::read_to_string(&recorded).map_err(|e| TriageError::io(e, recorded))?;
            return Ok(PathBuf::from(text));
        }
        Err(TriageError::store(format!(
            "no backing bytes found for meta-directory '{}'",
            r.0
        )))
    }

    pub fn logical_name(&self, r: &MetaDirectoryRef) -> Result<String> {
        let path = self.path_for(r).join("pathname");
        if path.exists() {
            fs::read_to_string(&path).map_err(|e| TriageError::io(e, path))
        } else {
            Ok(r.0.clone())
        }
    }

    pub fn read_info(&self, r: &MetaDirectoryRef) -> Result<MetaInfo> {
        let path = self.path_for(r).join("info.json");
        let data = fs::read(&path).map_err(|e| TriageError::io(e, path))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_info(&self, r: &MetaDirectoryRef, info: &MetaInfo) -> Result<()> {
        let dir = self.path_for(r);
        fs::create_dir_all(&dir).map_err(|e| TriageError::io(e, dir.clone()))?;
        let data = serde_json::to_vec_pretty(info)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| TriageError::io(e, dir.clone()))?;
        use std::io::Write;
        tmp.write_all(&data).map_err(|e| TriageError::io(e, dir.clone()))?;
        tmp.persist(dir.join("info.json"))
            .map_err(|e| TriageError::store(e.to_string()))?;
        Ok(())
    }

    /// Enters a scope in which `r`'s info record is loaded into memory
    /// and mutated by `f`. On normal (`Ok`) return, if `info_write` is
    /// set and nothing inside already called [`MetaDirectoryHandle::write_ahead`],
    /// the record is committed atomically (temp + rename). On an `Err`
    /// return, no commit occurs — this is the Rust expression of "scoped
    /// acquisition with guaranteed release on every exit path" for a
    /// resource whose release means a conditional write rather than a
    /// `close()` call.
    pub fn open<F, T>(&self, r: &MetaDirectoryRef, info_write: bool, f: F) -> Result<T>
    where
        F: FnOnce(&mut MetaDirectoryHandle<'_>) -> Result<T>,
    {
        let info = self.read_info(r)?;
        let mut handle = MetaDirectoryHandle {
            store: self,
            meta_ref: r.clone(),
            info,
            committed: false,
        };
        let result = f(&mut handle);
        match result {
            Ok(value) => {
                if info_write && !handle.committed {
                    handle.commit()?;
                }
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Content-addresses `bytes`, writes them as a fresh child
    /// MetaDirectory, and returns its ref. If a MetaDirectory with this
    /// hash already exists, the write is skipped and the existing ref is
    /// returned — this is the store-level half of duplicate detection
    /// (the scheduler's dedup set is the other half, avoiding repeated
    /// parsing work; this guards the on-disk invariant regardless of
    /// who calls it).
    ///
    /// Implemented as: write into a `tempfile::TempDir` (whose `Drop`
    /// removes it on any early return), then rename into place. This is
    /// the scoped-acquisition guarantee spec.md describes for
    /// `unpack_regular_file`, translated into Rust's ownership model
    /// instead of a `with`-block.
    pub fn create_child_from_bytes(
        &self,
        logical_name: &str,
        bytes: &[u8],
    ) -> Result<MetaDirectoryRef> {
        let digest = Sha256::digest(bytes);
        let hex_name = hex::encode(digest);
        let r = MetaDirectoryRef(hex_name);
        let final_dir = self.path_for(&r);
        if final_dir.exists() {
            return Ok(r);
        }

        let tmp_dir = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| TriageError::io(e, self.root.clone()))?;
        fs::write(tmp_dir.path().join("blob"), bytes)
            .map_err(|e| TriageError::io(e, tmp_dir.path().to_path_buf()))?;
        fs::write(tmp_dir.path().join("pathname"), logical_name.as_bytes())
            .map_err(|e| TriageError::io(e, tmp_dir.path().to_path_buf()))?;
        let info = MetaInfo::default();
        fs::write(tmp_dir.path().join("info.json"), serde_json::to_vec_pretty(&info)?)
            .map_err(|e| TriageError::io(e, tmp_dir.path().to_path_buf()))?;

        match fs::rename(tmp_dir.path(), &final_dir) {
            Ok(()) => {
                // Ownership of the path has moved; forget the guard so its
                // Drop doesn't try to remove what's no longer there.
                let _ = tmp_dir.into_path();
                Ok(r)
            }
            Err(e) => {
                if final_dir.exists() {
                    // Lost a race with another worker writing identical
                    // content — not an error, just a redundant write.
                    Ok(r)
                } else {
                    Err(TriageError::io(e, final_dir))
                }
            }
        }
    }

    /// Stamps an already-created child as a synthesized residual: the
    /// `SynthesizingParser` treatment from the dispatcher's gap-handling
    /// step.
    pub fn stamp_synthesized(&self, r: &MetaDirectoryRef) -> Result<()> {
        self.open(r, true, |handle| {
            handle.info.labels.insert("synthesized".to_string());
            handle.info.unpack_parser = Some("synthesizingparser".to_string());
            Ok(())
        })
    }

    /// Materializes a human-browsable link from a parent's `rel`/`abs`
    /// subtree to a child's store directory, alongside the authoritative
    /// string entry already recorded in the parent's children map. On
    /// Unix this is a real symlink; elsewhere (no native symlink
    /// primitive without elevated privileges) it's a pointer file
    /// carrying the target path, mirroring the unix/non-unix split the
    /// teacher's filesystem shim uses elsewhere.
    pub fn materialize_link(
        &self,
        parent: &MetaDirectoryRef,
        subtree: &str,
        logical_name: &str,
        child: &MetaDirectoryRef,
    ) -> Result<()> {
        let link_path = self.path_for(parent).join(subtree).join(logical_name);
        if let Some(dir) = link_path.parent() {
            fs::create_dir_all(dir).map_err(|e| TriageError::io(e, dir.to_path_buf()))?;
        }
        let target = self.path_for(child);

        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;
            if link_path.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&link_path);
            }
            symlink(&target, &link_path).map_err(|e| TriageError::io(e, link_path))?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&link_path, target.to_string_lossy().as_bytes())
                .map_err(|e| TriageError::io(e, link_path))?;
        }
        Ok(())
    }

    /// Lists every MetaDirectory currently in the store (excluding
    /// in-flight temporary directories).
    pub fn walk(&self) -> Result<Vec<MetaDirectoryRef>> {
        let mut refs = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| TriageError::io(e, self.root.clone()))?;
        for entry in entries {
            let entry = entry.map_err(|e| TriageError::io(e, self.root.clone()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            refs.push(MetaDirectoryRef(name));
        }
        refs.sort();
        Ok(refs)
    }
}

/// A MetaDirectory acquired for the lifetime of one [`MetaDirectoryStore::open`]
/// scope. Mutates its `info` in place; the store decides whether and
/// when that mutation is committed.
pub struct MetaDirectoryHandle<'s> {
    store: &'s MetaDirectoryStore,
    meta_ref: MetaDirectoryRef,
    pub info: MetaInfo,
    committed: bool,
}

impl<'s> MetaDirectoryHandle<'s> {
    pub fn meta_ref(&self) -> &MetaDirectoryRef {
        &self.meta_ref
    }

    pub fn store(&self) -> &'s MetaDirectoryStore {
        self.store
    }

    /// Commits the info record immediately and keeps the scope open.
    /// Required before handing a MetaDirectory off to another worker —
    /// the receiving worker must see committed info, never an in-memory
    /// draft.
    pub fn write_ahead(&mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        self.store.write_info(&self.meta_ref, &self.info)?;
        self.committed = true;
        Ok(())
    }
}
