use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::{
    DatasetRegistry, MountContext, MountHandle, MountSet, MountState, ReleaseReport,
    ResourceError, ResourceName, SharedResource, UnmountFailure,
};
use crate::metrics::DriverMetrics;

/// Holder id for mounts taken through [`ResourceMountManager::acquire`] directly
const UNLEASED: u64 = 0;

struct MountEntry {
    context: Box<dyn MountContext>,
    handle: MountHandle,
    /// Leases currently using this mount
    holders: BTreeSet<u64>,
}

/// Owns the worker's mount table.
///
/// Datasets are resolved against the registry at most once per manager
/// lifetime. Mounts are started by [`acquire`](Self::acquire) and stopped by
/// [`release`](Self::release); at most one mount exists per dataset. A mount
/// shared by several leases is stopped when the last of them lets go.
pub struct ResourceMountManager {
    registry: Arc<dyn DatasetRegistry>,
    resolved: Mutex<HashMap<ResourceName, SharedResource>>,
    mounts: RwLock<HashMap<ResourceName, MountEntry>>,
    next_lease: AtomicU64,
}

impl ResourceMountManager {
    /// Create a manager backed by a dataset registry
    pub fn new(registry: Arc<dyn DatasetRegistry>) -> Self {
        Self {
            registry,
            resolved: Mutex::new(HashMap::new()),
            mounts: RwLock::new(HashMap::new()),
            next_lease: AtomicU64::new(UNLEASED + 1),
        }
    }

    /// Resolve datasets against the registry, reusing earlier resolutions
    pub async fn resolve(&self, names: &[ResourceName]) -> Result<Vec<SharedResource>, ResourceError> {
        let mut resolved = self.resolved.lock().await;
        let mut resources = Vec::with_capacity(names.len());

        for &name in names {
            if let Some(resource) = resolved.get(&name) {
                resources.push(resource.clone());
                continue;
            }

            let handle = self.registry.resolve(name.dataset_name()).await?;
            debug!(dataset = %name, handle = ?handle, "Resolved dataset");
            let resource = SharedResource { name, handle };
            resolved.insert(name, resource.clone());
            resources.push(resource);
        }

        Ok(resources)
    }

    /// Mount every dataset in `names` that is not mounted yet.
    ///
    /// Already mounted datasets keep their existing mount. If any dataset fails
    /// to resolve or mount, the mounts started by this call are stopped again
    /// before the error is returned.
    pub async fn acquire(&self, names: &[ResourceName]) -> Result<MountSet, ResourceError> {
        self.acquire_as(names, UNLEASED).await
    }

    #[instrument(skip(self, names), fields(count = names.len()))]
    async fn acquire_as(&self, names: &[ResourceName], holder: u64) -> Result<MountSet, ResourceError> {
        let mut mounts = self.mounts.write().await;
        let mut started = Vec::new();
        let mut joined = Vec::new();
        let mut set = MountSet::default();

        for &name in names {
            match mounts.get(&name).map(|entry| entry.handle.state) {
                Some(MountState::Mounted) => {
                    if let Some(entry) = mounts.get_mut(&name) {
                        debug!(dataset = %name, "Dataset already mounted");
                        if entry.holders.insert(holder) {
                            joined.push(name);
                        }
                        set.insert(name, entry.handle.mount_point.clone());
                    }
                    continue;
                }
                Some(state) => {
                    // Left behind by a release that was interrupted
                    if let Some(mut stale) = mounts.remove(&name) {
                        warn!(dataset = %name, state = ?state, "Finishing interrupted unmount before remounting");
                        let stopped = stale.context.stop().await;
                        DriverMetrics::record_mount_operation("unmount", stopped.is_ok());
                        if let Err(e) = stopped {
                            warn!(dataset = %name, error = %e, "Interrupted unmount failed");
                        }
                    }
                }
                None => {}
            }

            match self.mount_one(name, holder).await {
                Ok(entry) => {
                    set.insert(name, entry.handle.mount_point.clone());
                    mounts.insert(name, entry);
                    started.push(name);
                }
                Err(e) => {
                    error!(dataset = %name, error = %e, "Mount failed, rolling back");
                    for name in joined {
                        if let Some(entry) = mounts.get_mut(&name) {
                            entry.holders.remove(&holder);
                        }
                    }
                    for name in started {
                        if let Some(mut entry) = mounts.remove(&name) {
                            if let Err(stop_err) = entry.context.stop().await {
                                warn!(dataset = %name, error = %stop_err, "Rollback unmount failed");
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(mounted = set.len(), "Datasets mounted");
        Ok(set)
    }

    async fn mount_one(&self, name: ResourceName, holder: u64) -> Result<MountEntry, ResourceError> {
        let resource = self
            .resolve(&[name])
            .await?
            .pop()
            .ok_or_else(|| ResourceError::Resolution(name.to_string()))?;

        let mut context = resource.handle.mount().await?;
        let mut handle = MountHandle {
            resource: name,
            mount_point: context.mount_point().to_path_buf(),
            state: MountState::Mounting,
        };

        let started = context.start().await;
        DriverMetrics::record_mount_operation("mount", started.is_ok());
        started?;

        handle.state = MountState::Mounted;
        debug!(dataset = %name, mount_point = %handle.mount_point.display(), "Mount started");
        Ok(MountEntry {
            context,
            handle,
            holders: BTreeSet::from([holder]),
        })
    }

    /// Unmount everything still mounted, whichever lease holds it.
    ///
    /// Every handle is attempted even if an earlier one fails; failures are
    /// collected into the report. Handles leave the table either way.
    #[instrument(skip(self))]
    pub async fn release(&self) -> ReleaseReport {
        let mut mounts = self.mounts.write().await;
        let mut names: Vec<ResourceName> = mounts.keys().copied().collect();
        names.sort();
        Self::stop_entries(&mut mounts, names).await
    }

    /// Drop one lease's hold; stop the mounts no other lease still uses
    #[instrument(skip(self))]
    async fn release_lease(&self, lease: u64) -> ReleaseReport {
        let mut mounts = self.mounts.write().await;
        let mut names = Vec::new();

        for (name, entry) in mounts.iter_mut() {
            if !entry.holders.contains(&lease) {
                continue;
            }
            if entry.holders.len() > 1 {
                entry.holders.remove(&lease);
                debug!(dataset = %name, "Mount still held by another lease");
            } else {
                names.push(*name);
            }
        }
        names.sort();

        Self::stop_entries(&mut mounts, names).await
    }

    /// Stop the named entries. Each stays in the table as `Unmounting` until
    /// its stop returns, so an interrupted pass leaves it for the next one.
    async fn stop_entries(
        mounts: &mut HashMap<ResourceName, MountEntry>,
        names: Vec<ResourceName>,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for name in names {
            let stopped = match mounts.get_mut(&name) {
                Some(entry) => {
                    entry.handle.state = MountState::Unmounting;
                    entry.context.stop().await
                }
                None => continue,
            };
            DriverMetrics::record_mount_operation("unmount", stopped.is_ok());
            let Some(entry) = mounts.remove(&name) else {
                continue;
            };

            match stopped {
                Ok(()) => {
                    debug!(dataset = %name, "Unmounted");
                    report.released.push(name);
                }
                Err(e) => {
                    warn!(dataset = %name, error = %e, "Unmount failed");
                    report.failures.push(UnmountFailure {
                        resource: name,
                        mount_point: entry.handle.mount_point,
                        message: e.to_string(),
                    });
                }
            }
        }

        if report.total() > 0 {
            info!(
                released = report.released.len(),
                failed = report.failures.len(),
                "Datasets released"
            );
        }
        report
    }

    /// Acquire mounts under a lease that guarantees release
    pub async fn lease(self: &Arc<Self>, names: &[ResourceName]) -> Result<MountLease, ResourceError> {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let mounts = self.acquire_as(names, id).await?;
        Ok(MountLease {
            manager: Arc::clone(self),
            id,
            mounts,
            released: false,
        })
    }

    /// Snapshot of the mount table
    pub async fn handles(&self) -> Vec<MountHandle> {
        let mounts = self.mounts.read().await;
        let mut handles: Vec<MountHandle> = mounts.values().map(|e| e.handle.clone()).collect();
        handles.sort_by_key(|h| h.resource);
        handles
    }

    /// Number of live mounts
    pub async fn active_count(&self) -> usize {
        self.mounts.read().await.len()
    }
}

/// Mounts held for the duration of a mini-batch.
///
/// Call [`MountLease::release`] on every exit path. A lease dropped before its
/// release completed (panic, cancelled future) schedules the release on the
/// current tokio runtime instead. Either way only this lease's hold is given
/// up; mounts another lease still uses stay up.
pub struct MountLease {
    manager: Arc<ResourceMountManager>,
    id: u64,
    mounts: MountSet,
    released: bool,
}

impl MountLease {
    /// Mount points held by this lease
    pub fn mounts(&self) -> &MountSet {
        &self.mounts
    }

    /// Give up this lease's hold and unmount what nothing else uses
    pub async fn release(mut self) -> ReleaseReport {
        let report = self.manager.release_lease(self.id).await;
        self.released = true;
        report
    }
}

impl Drop for MountLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(lease = self.id, "Mount lease dropped without release, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = Arc::clone(&self.manager);
                let lease = self.id;
                runtime.spawn(async move {
                    let report = manager.release_lease(lease).await;
                    if !report.is_clean() {
                        error!(failures = ?report.failures, "Background release had failures");
                    }
                });
            }
            Err(_) => error!("No tokio runtime available, mounts left in place"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::MountableDataset;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Counters {
        resolves: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
        /// The next stop blocks until its future is dropped
        stall_next_stop: AtomicBool,
    }

    #[derive(Debug)]
    struct FakeDataset {
        name: String,
        counters: Arc<Counters>,
        fail_start: bool,
    }

    struct FakeMount {
        path: PathBuf,
        counters: Arc<Counters>,
        fail_start: bool,
    }

    #[async_trait]
    impl MountContext for FakeMount {
        async fn start(&mut self) -> Result<(), ResourceError> {
            if self.fail_start {
                return Err(ResourceError::Mount {
                    resource: self.path.display().to_string(),
                    message: "refused".to_string(),
                });
            }
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), ResourceError> {
            if self.counters.stall_next_stop.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn mount_point(&self) -> &Path {
            &self.path
        }
    }

    #[async_trait]
    impl MountableDataset for FakeDataset {
        fn name(&self) -> &str {
            &self.name
        }

        async fn mount(&self) -> Result<Box<dyn MountContext>, ResourceError> {
            Ok(Box::new(FakeMount {
                path: PathBuf::from("/mnt").join(&self.name),
                counters: Arc::clone(&self.counters),
                fail_start: self.fail_start,
            }))
        }
    }

    struct FakeRegistry {
        counters: Arc<Counters>,
        failing: Option<&'static str>,
    }

    #[async_trait]
    impl DatasetRegistry for FakeRegistry {
        async fn resolve(&self, name: &str) -> Result<Arc<dyn MountableDataset>, ResourceError> {
            self.counters.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeDataset {
                name: name.to_string(),
                counters: Arc::clone(&self.counters),
                fail_start: self.failing == Some(name),
            }))
        }
    }

    fn manager(failing: Option<&'static str>) -> (Arc<ResourceMountManager>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let registry = Arc::new(FakeRegistry {
            counters: Arc::clone(&counters),
            failing,
        });
        (Arc::new(ResourceMountManager::new(registry)), counters)
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let (manager, counters) = manager(None);

        let first = manager.acquire(&[ResourceName::Pdb]).await.unwrap();
        let second = manager.acquire(&[ResourceName::Pdb]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.resolves.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolution_is_cached_across_release() {
        let (manager, counters) = manager(None);

        manager.acquire(&ResourceName::REQUIRED).await.unwrap();
        manager.release().await;
        manager.acquire(&ResourceName::REQUIRED).await.unwrap();

        assert_eq!(counters.resolves.load(Ordering::SeqCst), 4);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_failed_mount_rolls_back_partial_set() {
        let (manager, counters) = manager(Some("rosettafold_UniRef"));

        let err = manager.acquire(&ResourceName::REQUIRED).await.unwrap_err();

        assert!(matches!(err, ResourceError::Mount { .. }));
        assert_eq!(manager.active_count().await, 0);
        // Weights and Bfd were started before UniRef failed
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_twice_stops_once() {
        let (manager, counters) = manager(None);
        manager.acquire(&ResourceName::REQUIRED).await.unwrap();

        let first = manager.release().await;
        let second = manager.release().await;

        assert_eq!(first.released.len(), 4);
        assert_eq!(second.total(), 0);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_in_background() {
        let (manager, counters) = manager(None);

        {
            let lease = manager.lease(&ResourceName::REQUIRED).await.unwrap();
            assert_eq!(lease.mounts().len(), 4);
        }

        for _ in 0..100 {
            if manager.active_count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 4);
    }

    async fn settle(manager: &ResourceMountManager, expected: usize) {
        for _ in 0..100 {
            if manager.active_count().await == expected {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_dropped_lease_keeps_mounts_of_next_lease() {
        let (manager, counters) = manager(None);

        let first = manager.lease(&ResourceName::REQUIRED).await.unwrap();
        drop(first);
        let second = manager.lease(&ResourceName::REQUIRED).await.unwrap();

        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.active_count().await, 4);
        assert_eq!(
            counters.stops.load(Ordering::SeqCst),
            counters.starts.load(Ordering::SeqCst) - 4
        );

        let report = second.release().await;
        assert_eq!(report.released.len(), 4);
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(
            counters.stops.load(Ordering::SeqCst),
            counters.starts.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_shared_mount_stops_with_last_lease() {
        let (manager, counters) = manager(None);

        let first = manager.lease(&ResourceName::REQUIRED).await.unwrap();
        let second = manager.lease(&[ResourceName::Pdb]).await.unwrap();
        assert_eq!(counters.starts.load(Ordering::SeqCst), 4);

        let report = first.release().await;
        assert_eq!(report.released.len(), 3);
        assert_eq!(manager.active_count().await, 1);
        assert_eq!(second.mounts().path(ResourceName::Pdb).unwrap(), Path::new("/mnt/rosettafold_pdb"));

        let report = second.release().await;
        assert_eq!(report.released, vec![ResourceName::Pdb]);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_interrupted_release_is_finished_in_background() {
        let (manager, counters) = manager(None);
        let lease = manager.lease(&ResourceName::REQUIRED).await.unwrap();

        counters.stall_next_stop.store(true, Ordering::SeqCst);
        let interrupted = tokio::time::timeout(Duration::from_millis(20), lease.release()).await;
        assert!(interrupted.is_err());

        settle(&manager, 0).await;
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_interrupted_unmount_is_finished_before_remount() {
        let (manager, counters) = manager(None);
        manager.acquire(&ResourceName::REQUIRED).await.unwrap();

        counters.stall_next_stop.store(true, Ordering::SeqCst);
        let interrupted = tokio::time::timeout(Duration::from_millis(20), manager.release()).await;
        assert!(interrupted.is_err());
        assert_eq!(manager.active_count().await, 4);

        let set = manager.acquire(&ResourceName::REQUIRED).await.unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 5);
        assert!(manager
            .handles()
            .await
            .iter()
            .all(|h| h.state == MountState::Mounted));
    }
}
