use super::{Inventory, Shared};
use crate::database::Kind;

use std::sync::Arc;
use uuid::Uuid;

// Error Handling
use log::{trace, warn};

/**
Names and busy flags a task holds while it runs.

Dropping an armed claim gives everything back, whether the task
returned an error, panicked or was aborted.
A task that committed its result disarms the claim.
*/
#[derive(Debug)]
pub(super) struct Claim {
    shared: Arc<Shared>,
    names: Vec<(Kind, String)>,
    busy: Vec<Uuid>,
    armed: bool,
}

impl Claim {
    pub(super) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: shared.clone(),
            names: vec![],
            busy: vec![],
            armed: true,
        }
    }
    /// Reserve a name in the locked inventory.
    pub(super) fn name(mut self, inventory: &mut Inventory, kind: Kind, name: &str) -> Self {
        inventory.reserve(kind, name);
        self.names.push((kind, name.to_owned()));
        self
    }
    /// Mark a vm busy in the locked inventory.
    pub(super) fn busy(mut self, inventory: &mut Inventory, vm: &Uuid) -> Self {
        inventory.set_busy(vm);
        self.busy.push(*vm);
        self
    }
    /// Forget the claim, its release is part of a committed draft.
    pub(super) fn disarm(mut self) {
        self.armed = false;
    }
    fn release(inventory: &mut Inventory, names: &[(Kind, String)], busy: &[Uuid]) {
        for (kind, name) in names {
            trace!("releasing {kind} {:#?}", name);
            inventory.release(*kind, name);
        }
        for vm in busy {
            inventory.clear_busy(vm);
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let names = std::mem::take(&mut self.names);
        let busy = std::mem::take(&mut self.busy);
        if let Ok(mut inventory) = self.shared.inventory.try_write() {
            Claim::release(&mut inventory, &names, &busy);
            return;
        }
        // The lock is held elsewhere, release once it is free.
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut inventory = shared.inventory.write().await;
                    Claim::release(&mut inventory, &names, &busy);
                });
            }
            Err(_) => warn!("couldn't release {} reserved names outside of a runtime", names.len()),
        }
    }
}
