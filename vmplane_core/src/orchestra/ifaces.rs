use super::inventory::Inventory;
use super::validate::parse_params;
use super::{Orchestrator, Reply};
use crate::rand::unique_mac;
use crate::resources::{Iface, IfaceType};

use macaddr::MacAddr6;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

// Error Handling
use log::info;
use vmplane_error::{Reason, VmplaneError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct IfaceParams {
    #[serde(rename = "type")]
    kind: String,
    network: String,
    model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IfaceUpdate {
    network: Option<String>,
    model: Option<String>,
}

fn parse_mac(vm: &str, mac: &str) -> Result<MacAddr6, VmplaneError> {
    MacAddr6::from_str(mac).map_err(|_| {
        VmplaneError::not_found(
            Reason::IfaceNotFound,
            &format!("vm {:#?} has no interface {:#?}", vm, mac),
        )
    })
}

impl Orchestrator {
    fn check_network(&self, inventory: &Inventory, name: &str) -> Result<(), VmplaneError> {
        match inventory.network(name) {
            Ok(_) => Ok(()),
            Err(_) => Err(VmplaneError::invalid(
                Reason::NetworkNotFound,
                &format!("network {:#?} does not exist", name),
            )),
        }
    }

    /// The mac is generated, unique within the vm.
    pub async fn iface_attach(&self, vm: &str, body: Value) -> Result<Reply<Iface>, VmplaneError> {
        let params: IfaceParams = parse_params(body)?;
        let kind = IfaceType::from_str(&params.kind).map_err(|_| {
            VmplaneError::invalid(
                Reason::IfaceTypeInvalid,
                &format!("unsupported interface type {:#?}", params.kind),
            )
        })?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        self.check_network(&draft, &params.network)?;

        let taken: Vec<MacAddr6> = owner.ifaces.iter().map(|e| e.mac).collect();
        let iface = Iface {
            mac: unique_mac(&taken)?,
            kind,
            network: params.network,
            model: params
                .model
                .unwrap_or_else(|| self.inner.config.network.iface_model.clone()),
        };
        let uuid = owner.uuid;
        owner.ifaces.push(iface.clone());
        draft.put_vm(owner)?;
        let effect = self.inner.hypervisor.attach_iface(&uuid, &iface);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("attached interface {} to vm {:#?}", iface.mac, vm);
        Ok(Reply::Created(iface))
    }

    pub async fn iface_lookup(&self, vm: &str, mac: &str) -> Result<Reply<Iface>, VmplaneError> {
        let mac = parse_mac(vm, mac)?;
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.vm(vm)?.iface(&mac)?.clone()))
    }

    pub async fn iface_list(&self, vm: &str) -> Result<Reply<Vec<Iface>>, VmplaneError> {
        let inventory = self.inner.inventory.read().await;
        Ok(Reply::Ok(inventory.vm(vm)?.ifaces.clone()))
    }

    /// Change the network or the model of the interface with that mac.
    pub async fn iface_update(&self, vm: &str, mac: &str, body: Value) -> Result<Reply<Iface>, VmplaneError> {
        let params: IfaceUpdate = parse_params(body)?;
        let mac = parse_mac(vm, mac)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        let mut iface = owner.iface(&mac)?.clone();
        if let Some(network) = params.network {
            self.check_network(&draft, &network)?;
            iface.network = network;
        }
        if let Some(model) = params.model {
            iface.model = model;
        }

        let uuid = owner.uuid;
        for e in owner.ifaces.iter_mut().filter(|e| e.mac == mac) {
            *e = iface.clone();
        }
        draft.put_vm(owner)?;
        let effect = self.inner.hypervisor.update_iface(&uuid, &iface);
        self.commit_then(&mut inventory, draft, effect).await?;
        Ok(Reply::Ok(iface))
    }

    pub async fn iface_detach(&self, vm: &str, mac: &str) -> Result<Reply<Iface>, VmplaneError> {
        let mac = parse_mac(vm, mac)?;

        let mut inventory = self.inner.inventory.write().await;
        let mut draft = inventory.clone();
        let mut owner = draft.vm(vm)?.clone();
        draft.check_idle(&owner)?;
        owner.iface(&mac)?;

        let uuid = owner.uuid;
        owner.ifaces.retain(|e| e.mac != mac);
        draft.put_vm(owner)?;
        let effect = self.inner.hypervisor.detach_iface(&uuid, &mac);
        self.commit_then(&mut inventory, draft, effect).await?;
        info!("detached interface {} from vm {:#?}", mac, vm);
        Ok(Reply::NoContent)
    }
}
