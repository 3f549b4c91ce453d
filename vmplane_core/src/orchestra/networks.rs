use super::inventory::Inventory;
use super::validate::{check_name, parse_params};
use super::{Orchestrator, Reply};
use crate::database::Kind;
use crate::resources::{Connection, Network, NetworkState};

use ipnet::{IpNet, Ipv4Net};
use serde::Deserialize;
use serde_json::Value;
use std::net::Ipv4Addr;

// Error Handling
use log::info;
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkParams {
    name: String,
    connection: Connection,
    #[serde(default, alias = "net")]
    subnet: Option<String>,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    autostart: bool,
}

fn overlapping<'a>(inventory: &'a Inventory, subnet: &IpNet) -> Option<&'a Network> {
    inventory.networks.values().find(|e| e.overlaps(subnet))
}

/// First /24 of 192.168.100.0 - 192.168.254.0 no network uses yet.
fn free_subnet(inventory: &Inventory) -> Option<IpNet> {
    (100..=254)
        .filter_map(|n| Ipv4Net::new(Ipv4Addr::new(192, 168, n, 0), 24).ok())
        .map(IpNet::V4)
        .find(|e| overlapping(inventory, e).is_none())
}

/*
 * Resolve the address range of a network owning one.
 */
fn pick_subnet(inventory: &Inventory, params: &NetworkParams) -> Result<Option<IpNet>, VmplaneError> {
    if params.connection.is_bridged() {
        if params.interface.is_none() {
            return Err(VmplaneError::invalid(
                Reason::NetworkInterfaceRequired,
                &format!("a {} network needs a host interface", params.connection),
            ));
        }
        if params.subnet.is_some() {
            return Err(VmplaneError::invalid(
                Reason::ParamsInvalid,
                &format!("a {} network does not own an address range", params.connection),
            ));
        }
        return Ok(None);
    }
    if params.interface.is_some() {
        return Err(VmplaneError::invalid(
            Reason::ParamsInvalid,
            &format!("a {} network can not attach to a host interface", params.connection),
        ));
    }
    let Some(subnet) = &params.subnet else {
        return match free_subnet(inventory) {
            Some(e) => Ok(Some(e)),
            None => Err(VmplaneError::conflict(
                Reason::NetworkSubnetOverlap,
                "no free address range left, provide a subnet",
            )),
        };
    };
    let subnet: IpNet = subnet.parse().map_err(|_| {
        VmplaneError::invalid(
            Reason::ParamsInvalid,
            &format!("{:#?} is not a subnet, expected an address and a prefix", subnet),
        )
    })?;
    let subnet = subnet.trunc();
    if let Some(other) = overlapping(inventory, &subnet) {
        return Err(VmplaneError::conflict(
            Reason::NetworkSubnetOverlap,
            &format!("subnet {} overlaps network {:#?}", subnet, other.name),
        ));
    }
    Ok(Some(subnet))
}

impl Orchestrator {
    /// Networks are created inactive.
    pub async fn network_create(&self, body: Value) -> Result<Reply<Network>, VmplaneError> {
        let params: NetworkParams = parse_params(body)?;
        check_name("network", &params.name)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        if draft.is_taken(Kind::Network, &params.name) {
            return Err(VmplaneError::conflict(
                Reason::NetworkNameInUse,
                &format!("network {:#?} already exists", params.name),
            ));
        }
        let subnet = pick_subnet(&draft, &params)?;
        let network = Network {
            name: params.name,
            connection: params.connection,
            subnet,
            interface: params.interface,
            state: NetworkState::Inactive,
            autostart: params.autostart,
        };
        draft.put_network(network.clone())?;
        self.commit(&mut inventory, draft).await?;
        info!("created {} network {:#?}", network.connection, network.name);
        Ok(Reply::Created(network))
    }

    pub async fn network_lookup(&self, name: &str) -> Result<Reply<Network>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.network(name)?.clone()))
    }

    pub async fn network_list(&self) -> Result<Reply<Vec<Network>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.networks.values().cloned().collect()))
    }

    pub async fn network_activate(&self, name: &str) -> Result<Reply<Network>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut network = draft.network(name)?.clone();
        if network.is_active() {
            return Err(VmplaneError::invalid(
                Reason::NetworkActive,
                &format!("network {:#?} is already active", name),
            ));
        }
        network.state = NetworkState::Active;
        draft.put_network(network.clone())?;
        let effect = self.inner.hypervisor.network_activate(&network);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("activated network {:#?}", name);
        Ok(Reply::Ok(network))
    }

    /*
     * Running vms keep their network up.
     */
    pub async fn network_deactivate(&self, name: &str) -> Result<Reply<Network>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut network = draft.network(name)?.clone();
        if !network.is_active() {
            return Err(VmplaneError::invalid(
                Reason::NetworkInactive,
                &format!("network {:#?} is not active", name),
            ));
        }
        let running: Vec<String> = draft
            .vms_using_network(name)
            .into_iter()
            .filter(|e| e.state.is_active())
            .map(|e| e.name.clone())
            .collect();
        if !running.is_empty() {
            return Err(VmplaneError::conflict(
                Reason::NetworkInUseByVm,
                &format!("network {:#?} is used by running vms {:?}", name, running),
            ));
        }
        network.state = NetworkState::Inactive;
        draft.put_network(network.clone())?;
        let effect = self.inner.hypervisor.network_deactivate(&network);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("deactivated network {:#?}", name);
        Ok(Reply::Ok(network))
    }

    /*
     * Only inactive networks nothing references can go.
     */
    pub async fn network_delete(&self, name: &str) -> Result<Reply<Network>, VmplaneError> {
        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let network = draft.network(name)?.clone();

        let templates = draft.templates_using_network(name);
        if !templates.is_empty() {
            return Err(VmplaneError::conflict(
                Reason::NetworkInUseByTemplate,
                &format!("network {:#?} is used by templates {:?}", name, templates),
            ));
        }
        let vms: Vec<String> = draft
            .vms_using_network(name)
            .into_iter()
            .map(|e| e.name.clone())
            .collect();
        if !vms.is_empty() {
            return Err(VmplaneError::conflict(
                Reason::NetworkInUseByVm,
                &format!("network {:#?} is used by vms {:?}", name, vms),
            ));
        }
        if network.is_active() {
            return Err(VmplaneError::conflict(
                Reason::NetworkActive,
                &format!("deactivate network {:#?} first", name),
            ));
        }
        draft.remove_network(name)?;
        self.commit(&mut inventory, draft).await?;
        info!("deleted network {:#?}", name);
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

    // Error Handling
    use miette::Result;

    #[tokio::test]
    async fn subnets_never_overlap() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;

        let body = json!({ "name": "a", "connection": "nat", "subnet": "192.168.122.128/25" });
        let err = orchestrator.network_create(body).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NetworkSubnetOverlap));

        let body = json!({ "name": "a", "connection": "nat", "net": "10.0.0.7/16" });
        let network = orchestrator.network_create(body).await?.into_inner().unwrap();
        assert_eq!(network.subnet, Some("10.0.0.0/16".parse().unwrap()));
        assert!(!network.is_active());

        let body = json!({ "name": "b", "connection": "isolated" });
        let network = orchestrator.network_create(body).await?.into_inner().unwrap();
        assert_eq!(network.subnet, Some("192.168.100.0/24".parse().unwrap()));
        let body = json!({ "name": "c", "connection": "isolated" });
        let network = orchestrator.network_create(body).await?.into_inner().unwrap();
        assert_eq!(network.subnet, Some("192.168.101.0/24".parse().unwrap()));
        Ok(())
    }

    #[tokio::test]
    async fn reject_bad_networks() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        let cases = [
            (json!({ "name": "br", "connection": "bridge" }), Reason::NetworkInterfaceRequired),
            (json!({ "name": "mv", "connection": "macvtap" }), Reason::NetworkInterfaceRequired),
            (json!({ "name": "n", "connection": "nat", "interface": "eth0" }), Reason::ParamsInvalid),
            (json!({ "name": "n", "connection": "nat", "subnet": "not-a-net" }), Reason::ParamsInvalid),
            (json!({ "name": "n", "connection": "vpn" }), Reason::ParamsInvalid),
            (json!({ "name": "default", "connection": "nat" }), Reason::NetworkNameInUse),
        ];
        for (body, expected) in cases {
            let err = orchestrator.network_create(body).await.unwrap_err();
            assert_eq!(err.reason(), Some(expected));
        }
        let body = json!({ "name": "br", "connection": "bridge", "interface": "eth0" });
        let network = orchestrator.network_create(body).await?.into_inner().unwrap();
        assert_eq!(network.subnet, None);
        Ok(())
    }

    #[tokio::test]
    async fn referenced_networks_are_kept() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        orchestrator
            .network_create(json!({ "name": "other", "connection": "isolated" }))
            .await?;
        orchestrator
            .template_create(json!({ "name": "test", "cdrom": fx.iso(), "networks": ["other"] }))
            .await?;

        let err = orchestrator.network_delete("other").await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.reason(), Some(Reason::NetworkInUseByTemplate));

        orchestrator
            .template_update("test", json!({ "networks": ["default"] }))
            .await?;
        assert_eq!(orchestrator.network_delete("other").await?.status(), 204);
        assert_eq!(orchestrator.network_lookup("other").await.unwrap_err().status(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn vm_interfaces_hold_networks() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        fx.template("test").await?;
        fx.vm("test", "vm").await?;
        orchestrator.template_delete("test").await?;

        orchestrator.vm_start("vm").await?;
        let err = orchestrator.network_deactivate("default").await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NetworkInUseByVm));
        orchestrator.vm_poweroff("vm").await?;
        orchestrator.network_deactivate("default").await?;

        let err = orchestrator.network_delete("default").await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NetworkInUseByVm));
        orchestrator.vm_delete("vm").await?;
        assert_eq!(orchestrator.network_delete("default").await?.status(), 204);
        Ok(())
    }

    #[tokio::test]
    async fn activation_cycle() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        orchestrator
            .network_create(json!({ "name": "other", "connection": "nat" }))
            .await?;
        let err = orchestrator.network_deactivate("other").await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NetworkInactive));

        let network = orchestrator.network_activate("other").await?.into_inner().unwrap();
        assert!(network.is_active());
        let err = orchestrator.network_activate("other").await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NetworkActive));
        let err = orchestrator.network_delete("other").await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::NetworkActive));

        orchestrator.network_deactivate("other").await?;
        assert_eq!(orchestrator.network_delete("other").await?.status(), 204);
        let names: Vec<String> = orchestrator
            .network_list()
            .await?
            .into_inner()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["default".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn network_state_follows_the_store() -> Result<()> {
        let fx = Fixture::new().await?;
        let orchestrator = &fx.orchestrator;
        orchestrator
            .network_create(json!({ "name": "other", "connection": "nat" }))
            .await?;

        fx.store.set_failing(true);
        assert!(orchestrator.network_activate("other").await.is_err());
        fx.store.set_failing(false);
        assert!(!fx.simulator.is_network_active("other").await);

        orchestrator.network_activate("other").await?;
        assert!(fx.simulator.is_network_active("other").await);
        fx.store.set_failing(true);
        assert!(orchestrator.network_deactivate("other").await.is_err());
        fx.store.set_failing(false);
        assert!(fx.simulator.is_network_active("other").await);

        fx.simulator.fail_on(Fault::NetworkDeactivate);
        assert!(orchestrator.network_deactivate("other").await.is_err());
        fx.simulator.heal(Fault::NetworkDeactivate);
        let network = orchestrator.network_lookup("other").await?.into_inner().unwrap();
        assert!(network.is_active());

        orchestrator.network_deactivate("other").await?;
        assert!(!fx.simulator.is_network_active("other").await);
        Ok(())
    }
}
