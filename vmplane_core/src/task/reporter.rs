use super::manager::Registry;

use std::sync::Arc;

/// Progress callback handed to every work unit.
#[derive(Debug, Clone)]
pub struct Reporter {
    id: u64,
    registry: Arc<Registry>,
}

impl Reporter {
    pub(super) fn new(id: u64, registry: Arc<Registry>) -> Self {
        Self { id, registry }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    /*
     * Update the task message.
     * With `finished` the task turns finished and the message is frozen.
     * Reports after a terminal status are ignored.
     */
    pub fn report(&self, message: &str, finished: bool) {
        self.registry.report(self.id, message, finished);
    }
}
