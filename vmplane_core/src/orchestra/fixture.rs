use super::{Directory, Orchestrator, StaticDirectory};
use crate::config::VmplaneConfig;
use crate::database::MemoryStore;
use crate::hypervisor::Simulator;
use crate::resources::VmInfo;
use crate::task::TaskInfo;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// Error Handling
use vmplane_error::{LibError, VmplaneError};

/// An orchestrator on a simulator, a memory store and a scratch directory.
pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub simulator: Arc<Simulator>,
    pub store: Arc<MemoryStore>,
    pub dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Result<Self, VmplaneError> {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().into_owned();
        let mut config = VmplaneConfig::default();
        config.storage.default_pool_path = format!("{root}/images");
        config.reports.dir = format!("{root}/debugreports");
        config.ensure_directories().await?;
        tokio::fs::write(format!("{root}/fedora.iso"), b"fake iso").await?;

        let simulator = Arc::new(Simulator::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::builder()
            .config(config)
            .hypervisor(simulator.clone())
            .store(store.clone())
            .directory(Self::static_directory())
            .build();
        orchestrator.ensure_defaults().await?;

        Ok(Self {
            orchestrator,
            simulator,
            store,
            dir,
        })
    }
    fn static_directory() -> Arc<dyn Directory> {
        Arc::new(StaticDirectory::new(&["alice", "bob"], &["wheel", "kvm"]))
    }
    pub fn directory(&self) -> Arc<dyn Directory> {
        Self::static_directory()
    }
    /// Path of a file inside the scratch directory.
    pub fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }
    /// An existing boot image.
    pub fn iso(&self) -> String {
        self.path("fedora.iso")
    }

    /// Poll a task until it leaves the running status.
    pub async fn wait(&self, task: &TaskInfo) -> Result<TaskInfo, VmplaneError> {
        let tasks = self.orchestrator.tasks();
        for _ in 0..500 {
            let info = tasks.lookup(task.id)?;
            if info.status.is_terminal() {
                return Ok(info);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(LibError::builder()
            .msg(&format!("task {} is still running", task.id))
            .help("")
            .build()
            .into())
    }

    /// A template booting from the scratch iso.
    pub async fn template(&self, name: &str) -> Result<(), VmplaneError> {
        self.orchestrator
            .template_create(json!({ "name": name, "cdrom": self.iso() }))
            .await?;
        Ok(())
    }
    pub async fn vm(&self, template: &str, name: &str) -> Result<VmInfo, VmplaneError> {
        let reply = self
            .orchestrator
            .vm_create(json!({ "name": name, "template": format!("/templates/{template}") }))
            .await?;
        reply.into_inner().ok_or_else(|| {
            LibError::builder()
                .msg("vm create replied without a body")
                .help("")
                .build()
                .into()
        })
    }
}
