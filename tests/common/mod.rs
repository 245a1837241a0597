//! Shared fakes for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use minibatch::batch::BatchRunner;
use minibatch::executor::ItemExecutor;
use minibatch::pipeline::{
    PipelineInvocation, PipelineSpec, ProcessExit, ProcessLauncher, ProcessOutcome,
};
use minibatch::resources::{
    DatasetRegistry, MountContext, MountableDataset, ResourceError, ResourceMountManager,
};

pub const ARTIFACT: &str = "t000.e2e.pdb";

/// Per-dataset operation counts
#[derive(Debug, Default)]
pub struct RegistryLog {
    pub resolves: HashMap<String, usize>,
    pub starts: HashMap<String, usize>,
    pub stops: HashMap<String, usize>,
}

/// Registry whose datasets live under a temp directory and count every operation
#[derive(Clone)]
pub struct CountingRegistry {
    root: PathBuf,
    log: Arc<Mutex<RegistryLog>>,
    unknown: HashSet<String>,
    failing_mounts: HashSet<String>,
}

impl CountingRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            log: Arc::new(Mutex::new(RegistryLog::default())),
            unknown: HashSet::new(),
            failing_mounts: HashSet::new(),
        }
    }

    pub fn with_unknown(mut self, name: &str) -> Self {
        self.unknown.insert(name.to_string());
        self
    }

    pub fn with_failing_mount(mut self, name: &str) -> Self {
        self.failing_mounts.insert(name.to_string());
        self
    }

    pub fn resolves(&self, name: &str) -> usize {
        self.log.lock().unwrap().resolves.get(name).copied().unwrap_or(0)
    }

    pub fn starts(&self, name: &str) -> usize {
        self.log.lock().unwrap().starts.get(name).copied().unwrap_or(0)
    }

    pub fn stops(&self, name: &str) -> usize {
        self.log.lock().unwrap().stops.get(name).copied().unwrap_or(0)
    }

    pub fn total_starts(&self) -> usize {
        self.log.lock().unwrap().starts.values().sum()
    }

    pub fn total_stops(&self) -> usize {
        self.log.lock().unwrap().stops.values().sum()
    }

    /// Mounts started and not yet stopped
    pub fn live(&self) -> usize {
        self.total_starts() - self.total_stops()
    }
}

#[async_trait]
impl DatasetRegistry for CountingRegistry {
    async fn resolve(&self, name: &str) -> Result<Arc<dyn MountableDataset>, ResourceError> {
        *self
            .log
            .lock()
            .unwrap()
            .resolves
            .entry(name.to_string())
            .or_default() += 1;

        if self.unknown.contains(name) {
            return Err(ResourceError::Resolution(name.to_string()));
        }

        Ok(Arc::new(CountingDataset {
            name: name.to_string(),
            path: self.root.join(name),
            log: Arc::clone(&self.log),
            fail_start: self.failing_mounts.contains(name),
        }))
    }
}

#[derive(Debug)]
struct CountingDataset {
    name: String,
    path: PathBuf,
    log: Arc<Mutex<RegistryLog>>,
    fail_start: bool,
}

#[async_trait]
impl MountableDataset for CountingDataset {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mount(&self) -> Result<Box<dyn MountContext>, ResourceError> {
        Ok(Box::new(CountingMount {
            name: self.name.clone(),
            path: self.path.clone(),
            log: Arc::clone(&self.log),
            fail_start: self.fail_start,
        }))
    }
}

struct CountingMount {
    name: String,
    path: PathBuf,
    log: Arc<Mutex<RegistryLog>>,
    fail_start: bool,
}

#[async_trait]
impl MountContext for CountingMount {
    async fn start(&mut self) -> Result<(), ResourceError> {
        if self.fail_start {
            return Err(ResourceError::Mount {
                resource: self.name.clone(),
                message: "mount refused".to_string(),
            });
        }
        *self.log.lock().unwrap().starts.entry(self.name.clone()).or_default() += 1;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ResourceError> {
        *self.log.lock().unwrap().stops.entry(self.name.clone()).or_default() += 1;
        Ok(())
    }

    fn mount_point(&self) -> &Path {
        &self.path
    }
}

/// What the fake pipeline does for one input file name
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Exit 0 and write the artifact with the given contents
    Succeed(String),
    /// Exit with the code, no artifact
    Fail(i32),
    /// Exit 0 without writing the artifact
    NoOutput,
    /// Never finish on its own
    Hang,
}

/// Launcher that plays a scripted behaviour per input file name and records invocations
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    behaviours: HashMap<String, Behaviour>,
    invocations: Arc<Mutex<Vec<PipelineInvocation>>>,
    registry: Option<CountingRegistry>,
    live_at_launch: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, file_name: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(file_name.to_string(), behaviour);
        self
    }

    pub fn invocations(&self) -> Vec<PipelineInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Record the registry's live mount count at every launch
    pub fn observing(mut self, registry: &CountingRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn live_at_launch(&self) -> Vec<usize> {
        self.live_at_launch.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        invocation: &PipelineInvocation,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        self.invocations.lock().unwrap().push(invocation.clone());
        if let Some(registry) = &self.registry {
            self.live_at_launch.lock().unwrap().push(registry.live());
        }

        let file_name = invocation
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let behaviour = self
            .behaviours
            .get(&file_name)
            .cloned()
            .unwrap_or(Behaviour::Fail(127));

        let exit = match behaviour {
            Behaviour::Succeed(contents) => {
                tokio::fs::write(invocation.working_area.join(ARTIFACT), contents)
                    .await
                    .unwrap();
                ProcessExit::Code(0)
            }
            Behaviour::Fail(code) => ProcessExit::Code(code),
            Behaviour::NoOutput => ProcessExit::Code(0),
            Behaviour::Hang => {
                let deadline = async {
                    match timeout {
                        Some(limit) => tokio::time::sleep(limit).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = deadline => ProcessExit::TimedOut(timeout.unwrap_or_default()),
                    _ = cancel.cancelled() => ProcessExit::Cancelled,
                }
            }
        };

        ProcessOutcome {
            exit,
            stdout: format!("processed {}\n", file_name),
            stderr: String::new(),
            duration: Duration::from_millis(5),
        }
    }
}

/// Temp layout of one worker: host output root, worker output root, dataset root
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("host_out")).unwrap();
        std::fs::create_dir_all(dir.path().join("outputs")).unwrap();
        std::fs::create_dir_all(dir.path().join("datasets")).unwrap();
        Self { dir }
    }

    pub fn output_root(&self) -> PathBuf {
        self.dir.path().join("host_out")
    }

    pub fn worker_output_root(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }

    pub fn datasets(&self) -> PathBuf {
        self.dir.path().join("datasets")
    }

    pub fn registry(&self) -> CountingRegistry {
        CountingRegistry::new(&self.datasets())
    }

    pub fn spec(&self) -> PipelineSpec {
        PipelineSpec {
            source_dir: self.dir.path().to_path_buf(),
            executable_scripts: Vec::new(),
            ..Default::default()
        }
    }

    pub fn runner(&self, launcher: ScriptedLauncher) -> BatchRunner {
        let executor = ItemExecutor::new(self.spec(), Arc::new(launcher));
        BatchRunner::new(executor, self.output_root(), self.worker_output_root())
    }

    /// Names of the per-item directories under the host output root
    pub fn output_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.output_root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn manager(registry: &CountingRegistry) -> Arc<ResourceMountManager> {
    Arc::new(ResourceMountManager::new(Arc::new(registry.clone())))
}
