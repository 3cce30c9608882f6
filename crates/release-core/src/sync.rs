use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use shared::utilities::errors::AppError;

/// Installation mechanics live behind this seam. The orchestrator only
/// knows how to hand a rendered values document to some release tooling.
pub trait ReleaseManager: Send + Sync {
    fn install_or_upgrade(
        &self,
        namespace: &str,
        release: &str,
        values_yaml: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn uninstall(
        &self,
        namespace: &str,
        release: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn exists(
        &self,
        namespace: &str,
        release: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Serializes release operations per release name. Two deploys of the
/// same application queue up behind one mutex; unrelated applications
/// proceed concurrently. Lock entries live for the process lifetime.
pub struct ReleaseSynchronizer<M> {
    manager: M,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<M: ReleaseManager> ReleaseSynchronizer<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, release: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(release.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn install_or_upgrade(
        &self,
        namespace: &str,
        release: &str,
        values_yaml: &str,
    ) -> Result<(), AppError> {
        let lock = self.lock_for(release);
        let _guard = lock.lock().await;

        info!("Installing release {} in {}", release, namespace);
        self.manager
            .install_or_upgrade(namespace, release, values_yaml)
            .await
    }

    pub async fn uninstall(&self, namespace: &str, release: &str) -> Result<(), AppError> {
        let lock = self.lock_for(release);
        let _guard = lock.lock().await;

        info!("Uninstalling release {} in {}", release, namespace);
        self.manager.uninstall(namespace, release).await
    }

    /// Uninstalls when the release exists, otherwise does nothing.
    /// Returns whether anything was removed.
    pub async fn uninstall_if_present(
        &self,
        namespace: &str,
        release: &str,
    ) -> Result<bool, AppError> {
        let lock = self.lock_for(release);
        let _guard = lock.lock().await;

        if !self.manager.exists(namespace, release).await? {
            debug!("Release {} not present in {}", release, namespace);
            return Ok(false);
        }

        info!("Uninstalling release {} in {}", release, namespace);
        self.manager.uninstall(namespace, release).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingManager {
        log: Arc<Mutex<Vec<String>>>,
        installed: Arc<Mutex<bool>>,
    }

    impl RecordingManager {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl ReleaseManager for RecordingManager {
        async fn install_or_upgrade(
            &self,
            _namespace: &str,
            release: &str,
            _values_yaml: &str,
        ) -> Result<(), AppError> {
            self.push(format!("start {release}"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.push(format!("end {release}"));
            *self.installed.lock().unwrap() = true;
            Ok(())
        }

        async fn uninstall(&self, _namespace: &str, release: &str) -> Result<(), AppError> {
            self.push(format!("uninstall {release}"));
            Ok(())
        }

        async fn exists(&self, _namespace: &str, _release: &str) -> Result<bool, AppError> {
            Ok(*self.installed.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn test_same_release_operations_serialize() {
        let manager = RecordingManager::default();
        let sync = ReleaseSynchronizer::new(manager.clone());

        let (a, b) = tokio::join!(
            sync.install_or_upgrade("ns", "r1", "values"),
            sync.install_or_upgrade("ns", "r1", "values"),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(
            manager.log(),
            vec!["start r1", "end r1", "start r1", "end r1"]
        );
    }

    #[tokio::test]
    async fn test_different_releases_overlap() {
        let manager = RecordingManager::default();
        let sync = ReleaseSynchronizer::new(manager.clone());

        let (a, b) = tokio::join!(
            sync.install_or_upgrade("ns", "r1", "values"),
            sync.install_or_upgrade("ns", "r2", "values"),
        );
        a.unwrap();
        b.unwrap();

        // both starts land before either end: the sleeps interleave
        let log = manager.log();
        assert!(log[0].starts_with("start"));
        assert!(log[1].starts_with("start"));
        assert_ne!(log[0], log[1]);
    }

    #[tokio::test]
    async fn test_uninstall_if_present() {
        let manager = RecordingManager::default();
        let sync = ReleaseSynchronizer::new(manager.clone());

        assert!(!sync.uninstall_if_present("ns", "r1").await.unwrap());
        assert!(manager.log().is_empty());

        sync.install_or_upgrade("ns", "r1", "values").await.unwrap();
        assert!(sync.uninstall_if_present("ns", "r1").await.unwrap());
        assert_eq!(manager.log().last().unwrap(), "uninstall r1");
    }
}
