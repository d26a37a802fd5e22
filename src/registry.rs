//! Registry of live containers keyed by handle, with snapshot persistence.
//!
//! The registry never looks inside a container. Construction, restore and
//! destruction are delegated to a [`ContainerPool`]; the registry only keeps
//! the handle map consistent and moves snapshots to and from disk.

use crate::errors::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::Builder;
use tracing::{debug, info, warn};

/// Prefix of in-flight snapshot files; never restored.
const SNAPSHOT_TEMP_PREFIX: &str = ".snapshot-";

/// Caller's request for a new container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Unique handle; pools may generate one when empty.
    pub handle: String,
    pub rootfs: Option<PathBuf>,
    pub env: Vec<String>,
    pub privileged: bool,
}

/// One sandboxed execution context, owned by a pool implementation.
pub trait Container: Send + Sync {
    fn id(&self) -> &str;

    fn handle(&self) -> &str;

    fn start(&self) -> anyhow::Result<()>;

    /// Write restorable state; the pool's `restore` must accept it back.
    fn snapshot(&self, out: &mut dyn Write) -> anyhow::Result<()>;

    /// Release resources held by this process (not the container itself).
    fn cleanup(&self);
}

/// Builds and tears down containers.
pub trait ContainerPool: Send + Sync {
    fn setup(&self) -> anyhow::Result<()>;

    fn create(&self, spec: ContainerSpec) -> anyhow::Result<Arc<dyn Container>>;

    fn restore(&self, snapshot: &mut dyn Read) -> anyhow::Result<Arc<dyn Container>>;

    fn destroy(&self, container: &dyn Container) -> anyhow::Result<()>;
}

pub struct ContainerRegistry<P> {
    pool: P,
    snapshots_path: Option<PathBuf>,
    containers: RwLock<HashMap<String, Arc<dyn Container>>>,
}

impl<P: ContainerPool> ContainerRegistry<P> {
    pub fn new(pool: P, snapshots_path: Option<PathBuf>) -> Self {
        ContainerRegistry {
            pool,
            snapshots_path,
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Container>>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Container>>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn setup(&self) -> Result<(), RegistryError> {
        self.pool.setup().map_err(RegistryError::Pool)
    }

    /// Create the snapshot directory if needed and restore every snapshot in it.
    ///
    /// Files are restored in directory listing order. The first failure stops
    /// the restore and is returned.
    pub fn start(&self) -> Result<(), RegistryError> {
        let Some(dir) = &self.snapshots_path else {
            return Ok(());
        };

        fs::create_dir_all(dir).map_err(|source| RegistryError::SnapshotDir {
            path: dir.clone(),
            source,
        })?;

        self.restore_snapshots(dir)
    }

    fn restore_snapshots(&self, dir: &Path) -> Result<(), RegistryError> {
        let dir_error = |source| RegistryError::SnapshotDir {
            path: dir.to_path_buf(),
            source,
        };

        for entry in fs::read_dir(dir).map_err(dir_error)? {
            let entry = entry.map_err(dir_error)?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(SNAPSHOT_TEMP_PREFIX)
            {
                debug!(path = ?entry.path(), "skipping partial snapshot");
                continue;
            }

            let path = entry.path();
            let mut file = File::open(&path).map_err(|source| RegistryError::SnapshotOpen {
                path: path.clone(),
                source,
            })?;

            let container = self.pool.restore(&mut file).map_err(RegistryError::Pool)?;
            info!(handle = container.handle(), id = container.id(), "restored container");
            self.register(container);
        }

        Ok(())
    }

    fn register(&self, container: Arc<dyn Container>) {
        self.write().insert(container.handle().to_string(), container);
    }

    /// Build and start a container. It only becomes visible once started.
    pub fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, RegistryError> {
        let container = self.pool.create(spec).map_err(RegistryError::Pool)?;
        container.start().map_err(RegistryError::Pool)?;

        info!(handle = container.handle(), id = container.id(), "created container");
        self.register(container.clone());

        Ok(container)
    }

    /// Destroy via the pool, unregistering only if the pool succeeded.
    pub fn destroy(&self, handle: &str) -> Result<(), RegistryError> {
        let container = self.lookup(handle)?;

        self.pool
            .destroy(container.as_ref())
            .map_err(RegistryError::Pool)?;

        self.write().remove(handle);
        info!(handle, "destroyed container");

        Ok(())
    }

    pub fn containers(&self) -> Vec<Arc<dyn Container>> {
        self.read().values().cloned().collect()
    }

    pub fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, RegistryError> {
        self.read()
            .get(handle)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHandle(handle.to_string()))
    }

    /// Clean up and snapshot every container.
    ///
    /// A failed snapshot does not stop the others; all failures are returned.
    pub fn stop(&self) -> Vec<RegistryError> {
        let mut failures = Vec::new();

        for container in self.containers() {
            container.cleanup();

            if let Err(err) = self.save_snapshot(container.as_ref()) {
                warn!(handle = container.handle(), %err, "snapshot failed");
                failures.push(err);
            }
        }

        failures
    }

    fn save_snapshot(&self, container: &dyn Container) -> Result<(), RegistryError> {
        let Some(dir) = &self.snapshots_path else {
            return Ok(());
        };

        let tmp = Builder::new()
            .prefix(&format!("{}{}", SNAPSHOT_TEMP_PREFIX, container.id()))
            .tempfile_in(dir)
            .map_err(|err| RegistryError::FailedToSnapshot(err.into()))?;

        let mut out = BufWriter::new(tmp);
        container
            .snapshot(&mut out)
            .map_err(RegistryError::FailedToSnapshot)?;
        let tmp = out
            .into_inner()
            .map_err(|err| RegistryError::FailedToSnapshot(err.into_error().into()))?;

        let path = dir.join(container.id());
        tmp.persist(&path)
            .map_err(|err| RegistryError::FailedToSnapshot(err.error.into()))?;

        debug!(handle = container.handle(), ?path, "saved snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct NullContainer(String);

    impl Container for NullContainer {
        fn id(&self) -> &str {
            &self.0
        }

        fn handle(&self) -> &str {
            &self.0
        }

        fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn snapshot(&self, out: &mut dyn Write) -> anyhow::Result<()> {
            out.write_all(self.0.as_bytes())?;
            Ok(())
        }

        fn cleanup(&self) {}
    }

    #[derive(Default)]
    struct CountingPool {
        created: Mutex<usize>,
    }

    impl ContainerPool for CountingPool {
        fn setup(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn create(&self, spec: ContainerSpec) -> anyhow::Result<Arc<dyn Container>> {
            *self.created.lock().unwrap() += 1;
            Ok(Arc::new(NullContainer(spec.handle)))
        }

        fn restore(&self, snapshot: &mut dyn Read) -> anyhow::Result<Arc<dyn Container>> {
            let mut handle = String::new();
            snapshot.read_to_string(&mut handle)?;
            Ok(Arc::new(NullContainer(handle)))
        }

        fn destroy(&self, _container: &dyn Container) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_snapshots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".snapshot-abc123"), "half-written").unwrap();
        fs::write(dir.path().join("abc"), "abc").unwrap();

        let registry = ContainerRegistry::new(CountingPool::default(), Some(dir.path().into()));
        registry.start().unwrap();

        let handles: Vec<String> = registry
            .containers()
            .iter()
            .map(|c| c.handle().to_string())
            .collect();
        assert_eq!(handles, vec!["abc".to_string()]);
    }

    #[test]
    fn test_snapshot_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ContainerRegistry::new(CountingPool::default(), Some(dir.path().into()));
        registry
            .create(ContainerSpec {
                handle: "web".into(),
                ..Default::default()
            })
            .unwrap();

        assert!(registry.stop().is_empty());

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["web".to_string()]);
        assert_eq!(fs::read_to_string(dir.path().join("web")).unwrap(), "web");
    }

    #[test]
    fn test_stop_without_snapshot_dir_is_noop() {
        let registry = ContainerRegistry::new(CountingPool::default(), None);
        registry.create(ContainerSpec::default()).unwrap();

        assert!(registry.stop().is_empty());
        assert_eq!(*registry.pool().created.lock().unwrap(), 1);
    }
}
