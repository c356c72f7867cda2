use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceStoreError {
    #[error("device store i/o failure at {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("device store backend failure: {0}")]
    Backend(String),
}

impl DeviceStoreError {
    fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Persistence for one opaque E2EE device identity blob.
pub trait DeviceStore: Send + Sync {
    fn load(&self) -> Result<Option<String>, DeviceStoreError>;

    fn save(&self, blob: &str) -> Result<(), DeviceStoreError>;

    fn clear(&self) -> Result<(), DeviceStoreError>;
}

/// Blob stored in a single file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileDeviceStore {
    path: PathBuf,
}

impl FileDeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = self
            .path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("device.json");
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        parent.join(format!(".{file_name}.{now_nanos}.tmp"))
    }
}

impl DeviceStore for FileDeviceStore {
    fn load(&self) -> Result<Option<String>, DeviceStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DeviceStoreError::io(&self.path, err)),
        }
    }

    fn save(&self, blob: &str) -> Result<(), DeviceStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| DeviceStoreError::io(parent, err))?;
            }
        }

        let temp_path = self.temp_path();
        fs::write(&temp_path, blob).map_err(|err| DeviceStoreError::io(&temp_path, err))?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(DeviceStoreError::io(
                        &self.path,
                        format!("replace after rename error ({rename_err}): {err}"),
                    ));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                DeviceStoreError::io(&self.path, err)
            })?;
        }

        tracing::debug!(path = %self.path.display(), "persisted device identity");
        Ok(())
    }

    fn clear(&self) -> Result<(), DeviceStoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DeviceStoreError::io(&self.path, err)),
        }
    }
}

/// Blob kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeviceStore {
    data: Arc<RwLock<Option<String>>>,
}

impl DeviceStore for InMemoryDeviceStore {
    fn load(&self) -> Result<Option<String>, DeviceStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| DeviceStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.clone())
    }

    fn save(&self, blob: &str) -> Result<(), DeviceStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| DeviceStoreError::Backend("poisoned lock".to_owned()))?;
        *data = Some(blob.to_owned());
        Ok(())
    }

    fn clear(&self) -> Result<(), DeviceStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| DeviceStoreError::Backend("poisoned lock".to_owned()))?;
        *data = None;
        Ok(())
    }
}

/// Where the device identity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Process memory only: never written, never announced.
    MemoryOnly,
    /// Handed back to the caller through `deviceDataChanged`.
    Inline,
    /// Persisted through a `DeviceStore` and announced.
    Persisted,
}

/// What the caller of `on_change` should do with the new blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    /// Nothing may leave the process.
    Suppressed,
    /// Announce the blob to subscribers.
    Emit(String),
}

/// Device identity policy of one session.
///
/// The working copy of the blob lives in an [`InMemoryDeviceStore`]; the
/// persisted mode additionally writes every change through `store`.
pub struct DeviceIdentity {
    mode: DeviceMode,
    store: Option<Arc<dyn DeviceStore>>,
    seed: Option<String>,
    working: InMemoryDeviceStore,
}

impl DeviceIdentity {
    /// Pick the policy from session options.
    ///
    /// Memory-only wins, then inline `device_data`, then `device_path`, whose
    /// current contents become the initial blob.
    pub fn resolve(
        memory_only: bool,
        device_data: Option<String>,
        device_path: Option<PathBuf>,
    ) -> Result<Self, DeviceStoreError> {
        if memory_only {
            return Ok(Self::new(DeviceMode::MemoryOnly, None, device_data));
        }
        if device_data.is_some() {
            return Ok(Self::new(DeviceMode::Inline, None, device_data));
        }
        match device_path {
            Some(path) => Self::persisted(Arc::new(FileDeviceStore::new(path))),
            None => Ok(Self::new(DeviceMode::Inline, None, None)),
        }
    }

    /// Persisted policy backed by an arbitrary store.
    pub fn persisted(store: Arc<dyn DeviceStore>) -> Result<Self, DeviceStoreError> {
        let seed = store.load()?;
        Ok(Self::new(DeviceMode::Persisted, Some(store), seed))
    }

    fn new(mode: DeviceMode, store: Option<Arc<dyn DeviceStore>>, seed: Option<String>) -> Self {
        Self {
            mode,
            store,
            seed,
            working: InMemoryDeviceStore::default(),
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Blob handed to the engine when the session is created.
    pub fn initial_blob(&self) -> Option<String> {
        self.seed.clone()
    }

    /// Latest known blob; the initial blob until the engine reports a change.
    pub fn current(&self) -> Result<Option<String>, DeviceStoreError> {
        Ok(self.working.load()?.or_else(|| self.seed.clone()))
    }

    /// Apply an engine-reported identity change.
    ///
    /// The working copy is always updated. A failed store write is returned
    /// as an error and nothing is announced.
    pub fn on_change(&self, blob: String) -> Result<DeviceChange, DeviceStoreError> {
        self.working.save(&blob)?;

        match self.mode {
            DeviceMode::MemoryOnly => Ok(DeviceChange::Suppressed),
            DeviceMode::Inline => Ok(DeviceChange::Emit(blob)),
            DeviceMode::Persisted => {
                if let Some(store) = &self.store {
                    store.save(&blob)?;
                }
                Ok(DeviceChange::Emit(blob))
            }
        }
    }

    /// Drop identity state learned since creation. Only memory-only
    /// identities forget; the others are owned by the caller or the store.
    pub fn forget(&self) -> Result<(), DeviceStoreError> {
        if self.mode != DeviceMode::MemoryOnly {
            return Ok(());
        }
        self.working.clear()
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("mode", &self.mode)
            .field("has_seed", &self.seed.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileDeviceStore::new(dir.path().join("nested").join("device.json"));

        assert_eq!(store.load().expect("load missing"), None);
        store.save("{\"v\":1}").expect("save should work");
        store.save("{\"v\":2}").expect("overwrite should work");
        assert_eq!(store.load().expect("load"), Some("{\"v\":2}".to_owned()));

        let leftovers: Vec<_> = fs::read_dir(store.path().parent().expect("parent"))
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        store.clear().expect("clear should work");
        store.clear().expect("clear is idempotent");
        assert_eq!(store.load().expect("load after clear"), None);
    }

    #[test]
    fn memory_only_never_writes_or_emits() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("device.json");
        let identity = DeviceIdentity::resolve(true, Some("seed".into()), Some(path.clone()))
            .expect("resolve");

        assert_eq!(identity.mode(), DeviceMode::MemoryOnly);
        assert_eq!(identity.initial_blob(), Some("seed".to_owned()));
        assert_eq!(
            identity.on_change("next".into()).expect("change"),
            DeviceChange::Suppressed
        );
        assert_eq!(identity.current().expect("current"), Some("next".to_owned()));
        assert!(!path.exists());

        identity.forget().expect("forget");
        assert_eq!(identity.current().expect("current"), Some("seed".to_owned()));
    }

    #[test]
    fn inline_data_wins_over_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("device.json");
        fs::write(&path, "from-file").expect("write fixture");

        let identity = DeviceIdentity::resolve(false, Some("inline".into()), Some(path.clone()))
            .expect("resolve");
        assert_eq!(identity.mode(), DeviceMode::Inline);
        assert_eq!(identity.initial_blob(), Some("inline".to_owned()));
        assert_eq!(
            identity.on_change("rotated".into()).expect("change"),
            DeviceChange::Emit("rotated".into())
        );
        assert_eq!(fs::read_to_string(&path).expect("read"), "from-file");
    }

    #[test]
    fn path_mode_loads_and_persists() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("device.json");
        fs::write(&path, "stored").expect("write fixture");

        let identity = DeviceIdentity::resolve(false, None, Some(path.clone())).expect("resolve");
        assert_eq!(identity.mode(), DeviceMode::Persisted);
        assert_eq!(identity.initial_blob(), Some("stored".to_owned()));

        identity.on_change("rotated".into()).expect("change");
        assert_eq!(fs::read_to_string(&path).expect("read"), "rotated");
    }

    #[derive(Default)]
    struct FailingStore;

    impl DeviceStore for FailingStore {
        fn load(&self) -> Result<Option<String>, DeviceStoreError> {
            Ok(None)
        }

        fn save(&self, _blob: &str) -> Result<(), DeviceStoreError> {
            Err(DeviceStoreError::Backend("disk full".to_owned()))
        }

        fn clear(&self) -> Result<(), DeviceStoreError> {
            Ok(())
        }
    }

    #[test]
    fn store_failure_propagates_and_keeps_memory_copy() {
        let identity = DeviceIdentity::persisted(Arc::new(FailingStore)).expect("persisted");
        let err = identity.on_change("blob".into()).expect_err("save must fail");
        assert_eq!(err, DeviceStoreError::Backend("disk full".to_owned()));
        assert_eq!(identity.current().expect("current"), Some("blob".to_owned()));
    }

    #[test]
    fn forget_only_resets_memory_only_identities() {
        let store = Arc::new(InMemoryDeviceStore::default());
        store.save("stored").expect("seed store");
        let persisted = DeviceIdentity::persisted(store.clone()).expect("persisted");
        persisted.on_change("rotated".into()).expect("change");
        persisted.forget().expect("forget");
        assert_eq!(persisted.current().expect("current"), Some("rotated".to_owned()));
        assert_eq!(store.load().expect("load"), Some("rotated".to_owned()));

        let memory = DeviceIdentity::resolve(true, None, None).expect("resolve");
        memory.on_change("learned".into()).expect("change");
        memory.forget().expect("forget");
        assert_eq!(memory.current().expect("current"), None);
    }

    #[test]
    fn in_memory_store_round_trip() {
        let store = InMemoryDeviceStore::default();
        store.save("a").expect("save");
        assert_eq!(store.load().expect("load"), Some("a".to_owned()));
        store.clear().expect("clear");
        assert_eq!(store.load().expect("load"), None);
    }
}
