use super::validate::{check_name, parse_params};
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::resources::{HostPackage, Repository};
use crate::task::{Reporter, TaskFilter, TaskStatus};

use serde::Deserialize;
use serde_json::Value;
use url::Url;

// Error Handling
use log::info;
use vmplane_error::{Reason, VmplaneError};

const UPDATE_URI: &str = "/host/swupdate";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryParams {
    repo_id: String,
    repo_name: Option<String>,
    baseurl: String,
    #[serde(default = "enabled")]
    enabled: bool,
    #[serde(default)]
    gpgcheck: bool,
    gpgkey: Option<String>,
}
fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryUpdate {
    repo_name: Option<String>,
    baseurl: Option<String>,
    enabled: Option<bool>,
    gpgcheck: Option<bool>,
    /// An explicit null removes the key.
    #[serde(default, with = "::serde_with::rust::double_option")]
    gpgkey: Option<Option<String>>,
}

fn check_url(what: &str, url: &str) -> Result<(), VmplaneError> {
    let valid = match Url::parse(url) {
        Ok(e) => matches!(e.scheme(), "http" | "https" | "ftp" | "file"),
        Err(_) => false,
    };
    if !valid {
        return Err(VmplaneError::invalid(
            Reason::RepositoryUrlInvalid,
            &format!("{what} {:#?} is not an http, ftp or file url", url),
        ));
    }
    Ok(())
}

impl Orchestrator {
    pub async fn host_packages(&self) -> Result<Reply<Vec<HostPackage>>, VmplaneError> {
        Ok(Reply::Ok(self.inner.hypervisor.host_packages().await?))
    }

    pub async fn host_package_lookup(&self, name: &str) -> Result<Reply<HostPackage>, VmplaneError> {
        let packages = self.inner.hypervisor.host_packages().await?;
        match packages.into_iter().find(|e| e.package_name == name) {
            Some(package) => Ok(Reply::Ok(package)),
            None => Err(VmplaneError::not_found(
                Reason::PackageNotFound,
                &format!("Couldn't find a pending update for package {:#?}", name),
            )),
        }
    }

    /*
     * Apply every pending package update in a task.
     * Only one update runs at a time.
     */
    pub async fn host_update(&self) -> Result<Reply<()>, VmplaneError> {
        // Held while checking and submitting so two calls can't both pass.
        let _inventory = self.inner.inventory.write().await;
        let filter = TaskFilter::builder()
            .status(TaskStatus::Running)
            .target_uri(format!("^{UPDATE_URI}$"))
            .build();
        if let Some(running) = self.inner.tasks.list(&filter)?.first() {
            return Err(VmplaneError::conflict(
                Reason::HostUpdateRunning,
                &format!("host packages are already being updated by task {}", running.id),
            ));
        }
        let this = self.clone();
        let task = self.inner.tasks.submit(UPDATE_URI, move |reporter| async move {
            this.host_update_run(&reporter).await
        });
        Ok(Reply::Accepted(task))
    }

    async fn host_update_run(&self, reporter: &Reporter) -> Result<(), VmplaneError> {
        let packages = self.inner.hypervisor.host_packages().await?;
        info!("[start] updating {} host packages", packages.len());
        let total = packages.len();
        for (n, package) in packages.iter().enumerate() {
            reporter.report(
                &format!("Updating {} to {} ({}/{})", package.package_name, package.version, n + 1, total),
                false,
            );
            self.inner.hypervisor.update_package(&package.package_name).await?;
        }
        info!("[end] updated {} host packages", total);
        reporter.report("All packages updated", true);
        Ok(())
    }

    /// Repositories are created enabled unless told otherwise.
    pub async fn repository_create(&self, body: Value) -> Result<Reply<Repository>, VmplaneError> {
        let params: RepositoryParams = parse_params(body)?;
        check_name("repository", &params.repo_id)?;
        check_url("baseurl", &params.baseurl)?;
        if let Some(gpgkey) = &params.gpgkey {
            check_url("gpgkey", gpgkey)?;
        }

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        if draft.is_taken(Kind::Repository, &params.repo_id) {
            return Err(VmplaneError::conflict(
                Reason::RepositoryIdInUse,
                &format!("repository {:#?} already exists", params.repo_id),
            ));
        }
        let repository = Repository {
            repo_name: params.repo_name.unwrap_or_else(|| params.repo_id.clone()),
            repo_id: params.repo_id,
            baseurl: params.baseurl,
            enabled: params.enabled,
            gpgcheck: params.gpgcheck,
            gpgkey: params.gpgkey,
        };
        draft.put_repository(repository.clone())?;
        self.commit(&mut inventory, draft).await?;
        info!("added repository {:#?}", repository.repo_id);
        Ok(Reply::Created(repository))
    }

    pub async fn repository_lookup(&self, repo_id: &str) -> Result<Reply<Repository>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.repository(repo_id)?.clone()))
    }

    pub async fn repository_list(&self) -> Result<Reply<Vec<Repository>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.repositories.values().cloned().collect()))
    }

    /// Partial update, the repo id can't change.
    pub async fn repository_update(
        &self,
        repo_id: &str,
        body: Value,
    ) -> Result<Reply<Repository>, VmplaneError> {
        let params: RepositoryUpdate = parse_params(body)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut repository = draft.repository(repo_id)?.clone();
        if let Some(repo_name) = params.repo_name {
            check_name("repository", &repo_name)?;
            repository.repo_name = repo_name;
        }
        if let Some(baseurl) = params.baseurl {
            check_url("baseurl", &baseurl)?;
            repository.baseurl = baseurl;
        }
        if let Some(enabled) = params.enabled {
            repository.enabled = enabled;
        }
        if let Some(gpgcheck) = params.gpgcheck {
            repository.gpgcheck = gpgcheck;
        }
        match params.gpgkey {
            Some(Some(gpgkey)) => {
                check_url("gpgkey", &gpgkey)?;
                repository.gpgkey = Some(gpgkey);
            }
            Some(None) => repository.gpgkey = None,
            None => {}
        }
        draft.put_repository(repository.clone())?;
        self.commit(&mut inventory, draft).await?;
        info!("updated repository {:#?}", repo_id);
        Ok(Reply::Ok(repository))
    }

    pub async fn repository_enable(&self, repo_id: &str) -> Result<Reply<Repository>, VmplaneError> {
        self.repository_update(repo_id, serde_json::json!({ "enabled": true }))
            .await
    }
    pub async fn repository_disable(&self, repo_id: &str) -> Result<Reply<Repository>, VmplaneError> {
        self.repository_update(repo_id, serde_json::json!({ "enabled": false }))
            .await
    }

    pub async fn repository_delete(&self, repo_id: &str) -> Result<Reply<Repository>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        draft.remove_repository(repo_id)?;
        self.commit(&mut inventory, draft).await?;
        info!("removed repository {:#?}", repo_id);
        Ok(Reply::NoContent)
    }
}

#[cfg(test)]
mod test {
    use super::super::fixture::Fixture;
    use super::*;
    use crate::hypervisor::Fault;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    // Error Handling
    use miette::Result;

    #[tokio::test]
    async fn pending_updates_are_listed() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let packages = orchestrator.host_packages().await?.into_inner().unwrap();
        assert_eq!(packages.len(), 3);
        for package in &packages {
            let res = orchestrator.host_package_lookup(&package.package_name).await?;
            assert_eq!(res.into_inner().as_ref(), Some(package));
        }
        let err = orchestrator.host_package_lookup("vim").await.unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(err.reason(), Some(Reason::PackageNotFound));
        Ok(())
    }

    #[tokio::test]
    async fn update_runs_as_a_task() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let reply = orchestrator.host_update().await?;
        assert_eq!(reply.status(), 202);
        let task = reply.task().unwrap();
        assert_eq!(task.target_uri, "/host/swupdate");

        let task = fx.wait(task).await?;
        assert_eq!(task.status, TaskStatus::Finished);
        assert!(task.message.contains("All packages updated"));
        assert_eq!(orchestrator.host_packages().await?.into_inner().map(|e| e.len()), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn one_update_at_a_time() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        fx.simulator
            .set_latency(Fault::UpdatePackage, Duration::from_millis(100));
        let first = orchestrator.host_update().await?;

        let err = orchestrator.host_update().await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.reason(), Some(Reason::HostUpdateRunning));

        let task = fx.wait(first.task().unwrap()).await?;
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(orchestrator.host_update().await?.status(), 202);
        Ok(())
    }

    #[tokio::test]
    async fn failed_update_fails_the_task() -> Result<()> {
        let fx = Fixture::new().await?;
        fx.simulator.fail_on(Fault::UpdatePackage);
        let reply = fx.orchestrator.host_update().await?;
        let task = fx.wait(reply.task().unwrap()).await?;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            fx.orchestrator.host_packages().await?.into_inner().map(|e| e.len()),
            Some(3)
        );
        Ok(())
    }

    #[tokio::test]
    async fn repository_lifecycle() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let body = json!({ "repo_id": "fedora-fake", "baseurl": "http://www.fedora.org" });
        let res = orchestrator.repository_create(body.clone()).await?;
        assert_eq!(res.status(), 201);
        let repository = res.into_inner().unwrap();
        assert_eq!(repository.repo_name, "fedora-fake");
        assert!(repository.enabled);
        assert_eq!(repository.uri(), "/host/repositories/fedora-fake");

        let err = orchestrator.repository_create(body).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::RepositoryIdInUse));

        let res = orchestrator
            .repository_update("fedora-fake", json!({ "baseurl": "http://www.fedoraproject.org" }))
            .await?;
        assert_eq!(res.status(), 200);
        let repository = orchestrator.repository_lookup("fedora-fake").await?.into_inner().unwrap();
        assert_eq!(repository.baseurl, "http://www.fedoraproject.org");

        let res = orchestrator.repository_disable("fedora-fake").await?;
        assert_eq!(res.into_inner().map(|e| e.enabled), Some(false));
        let res = orchestrator.repository_enable("fedora-fake").await?;
        assert_eq!(res.into_inner().map(|e| e.enabled), Some(true));
        assert_eq!(orchestrator.repository_list().await?.into_inner().map(|e| e.len()), Some(1));

        let res = orchestrator.repository_delete("fedora-fake").await?;
        assert_eq!(res.status(), 204);
        let err = orchestrator.repository_lookup("fedora-fake").await.unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(err.reason(), Some(Reason::RepositoryNotFound));
        Ok(())
    }

    #[tokio::test]
    async fn repository_rejections() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let err = orchestrator
            .repository_create(json!({ "repo_id": "bad", "baseurl": "www.fedora.org" }))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(Reason::RepositoryUrlInvalid));

        let err = orchestrator
            .repository_create(json!({ "repo_id": "a/b", "baseurl": "http://www.fedora.org" }))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NameInvalid));

        orchestrator
            .repository_create(json!({
                "repo_id": "signed",
                "baseurl": "https://repo.example.org/",
                "gpgcheck": true,
                "gpgkey": "https://repo.example.org/key.asc"
            }))
            .await?;
        let err = orchestrator
            .repository_update("signed", json!({ "repo_id": "other" }))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(Reason::ParamsInvalid));

        let res = orchestrator
            .repository_update("signed", json!({ "gpgkey": null }))
            .await?;
        let repository = res.into_inner().unwrap();
        assert_eq!(repository.gpgkey, None);
        assert!(repository.gpgcheck);
        Ok(())
    }

    #[tokio::test]
    async fn repositories_survive_failed_commits() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        orchestrator
            .repository_create(json!({ "repo_id": "base", "baseurl": "http://www.fedora.org" }))
            .await?;

        fx.store.set_failing(true);
        let res = orchestrator
            .repository_create(json!({ "repo_id": "extra", "baseurl": "http://www.fedora.org" }))
            .await;
        assert!(res.is_err());
        assert!(orchestrator.repository_delete("base").await.is_err());
        fx.store.set_failing(false);

        assert!(orchestrator.repository_lookup("extra").await.is_err());
        assert!(orchestrator.repository_lookup("base").await.is_ok());
        Ok(())
    }
}
