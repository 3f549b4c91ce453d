use super::validate::{check_name, next_free_name, now, parse_params};
use super::claim::Claim;
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::resources::{
    DebugReport, Network, Repository, Snapshot, StorageDevice, StoragePool, StorageVolume,
    Template, Vm,
};
use crate::task::{Reporter, TaskFilter, TaskInfo};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

// Error Handling
use log::{info, warn};
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportParams {
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportRename {
    name: String,
}

/// A vm as stored, next to the devices the hypervisor sees.
#[derive(Debug, Serialize)]
struct VmDump {
    #[serde(flatten)]
    vm: Vm,
    devices: Vec<StorageDevice>,
}

#[derive(Debug, Serialize)]
struct Dump {
    created: i64,
    templates: Vec<Template>,
    vms: Vec<VmDump>,
    pools: Vec<StoragePool>,
    volumes: Vec<StorageVolume>,
    networks: Vec<Network>,
    snapshots: Vec<Snapshot>,
    repositories: Vec<Repository>,
    tasks: Vec<TaskInfo>,
}

impl Orchestrator {
    fn report_path(&self, name: &str) -> String {
        format!("{}/{}.json", self.inner.config.reports.dir.trim_end_matches('/'), name)
    }

    /*
     * Dump the control plane state to the reports directory in a task.
     * Without a name, "report-<unix timestamp>" is used.
     */
    pub async fn report_create(&self, body: Value) -> Result<Reply<DebugReport>, VmplaneError> {
        let params: ReportParams = parse_params(body)?;
        let (claim, name) = {
            let mut inventory = self.inner.inventory.write().await;
            let name = match params.name {
                Some(name) => {
                    check_name("debug report", &name)?;
                    if inventory.is_taken(Kind::DebugReport, &name) {
                        return Err(VmplaneError::conflict(
                            Reason::ReportNameInUse,
                            &format!("debug report {:#?} already exists", name),
                        ));
                    }
                    name
                }
                None => {
                    let stamp = format!("report-{}", now());
                    if inventory.is_taken(Kind::DebugReport, &stamp) {
                        next_free_name(&format!("{stamp}-"), |e| {
                            inventory.is_taken(Kind::DebugReport, e)
                        })
                    } else {
                        stamp
                    }
                }
            };
            let claim = Claim::new(&self.inner).name(&mut inventory, Kind::DebugReport, &name);
            (claim, name)
        };

        let this = self.clone();
        let uri = format!("/debugreports/{name}");
        let task = self.inner.tasks.submit(&uri, move |reporter| async move {
            let res = this.report_run(&reporter, &name).await;
            if res.is_ok() {
                claim.disarm();
            }
            res
        });
        Ok(Reply::Accepted(task))
    }

    async fn report_run(&self, reporter: &Reporter, name: &str) -> Result<(), VmplaneError> {
        info!("[start] generating debug report {:#?}", name);
        let snapshot = self.inner.inventory.read().await.clone();

        let mut vms = vec![];
        for vm in snapshot.vms.values() {
            reporter.report(&format!("collecting devices of {}", vm.name), false);
            let devices = match self.inner.hypervisor.list_devices(&vm.uuid).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("couldn't list devices of vm {:#?}: {}", vm.name, e);
                    vec![]
                }
            };
            let mut vm = vm.clone();
            vm.graphics.passwd = None;
            vms.push(VmDump { vm, devices });
        }
        let dump = Dump {
            created: now(),
            templates: snapshot.templates.values().cloned().collect(),
            vms,
            pools: snapshot.pools.values().cloned().collect(),
            volumes: snapshot.volumes.values().cloned().collect(),
            networks: snapshot.networks.values().cloned().collect(),
            snapshots: snapshot.snapshots.values().cloned().collect(),
            repositories: snapshot.repositories.values().cloned().collect(),
            tasks: self.inner.tasks.list(&TaskFilter::default())?,
        };
        let path = self.report_path(name);
        tokio::fs::write(&path, serde_json::to_string_pretty(&dump)?).await?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        draft.release(Kind::DebugReport, name);
        let report = DebugReport {
            name: name.to_owned(),
            path: path.clone(),
            created: dump.created,
        };
        draft.put_report(report.clone())?;
        if let Err(e) = self.commit(&mut inventory, draft).await {
            drop(inventory);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("couldn't remove unrecorded report {:#?}: {}", path, err);
            }
            return Err(e);
        }
        info!("[end] wrote debug report to {:#?}", path);
        reporter.report(&format!("created {}", report.uri()), true);
        Ok(())
    }

    pub async fn report_lookup(&self, name: &str) -> Result<Reply<DebugReport>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.report(name)?.clone()))
    }

    pub async fn report_list(&self) -> Result<Reply<Vec<DebugReport>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.reports.values().cloned().collect()))
    }

    /// Renames the report file too.
    pub async fn report_rename(&self, name: &str, body: Value) -> Result<Reply<DebugReport>, VmplaneError> {
        let params: ReportRename = parse_params(body)?;
        check_name("debug report", &params.name)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut report = draft.report(name)?.clone();
        if params.name == report.name {
            return Ok(Reply::SeeOther(report.uri()));
        }
        if draft.is_taken(Kind::DebugReport, &params.name) {
            return Err(VmplaneError::conflict(
                Reason::ReportNameInUse,
                &format!("debug report {:#?} already exists", params.name),
            ));
        }
        let path = self.report_path(&params.name);
        tokio::fs::rename(&report.path, &path).await?;

        draft.remove_report(name)?;
        report.name = params.name;
        report.path = path.clone();
        draft.put_report(report.clone())?;
        if let Err(e) = self.commit(&mut inventory, draft).await {
            if let Err(err) = tokio::fs::rename(&path, &self.report_path(name)).await {
                warn!("couldn't move debug report back to {:#?}: {}", name, err);
            }
            return Err(e);
        }
        info!("renamed debug report {:#?} to {:#?}", name, report.name);
        Ok(Reply::SeeOther(report.uri()))
    }

    pub async fn report_delete(&self, name: &str) -> Result<Reply<DebugReport>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let report = draft.remove_report(name)?;
        self.commit(&mut inventory, draft).await?;
        if Path::new(&report.path).exists() {
            if let Err(e) = tokio::fs::remove_file(&report.path).await {
                warn!("couldn't remove debug report file {:#?}: {}", report.path, e);
            }
        }
        info!("deleted debug report {:#?}", name);
        Ok(Reply::NoContent)
    }
}
