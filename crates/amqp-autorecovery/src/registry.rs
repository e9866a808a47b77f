//! The connection's bookkeeping of live consumers and producers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

#[cfg(feature = "metrics")]
use metrics::gauge;

use crate::resource::{Recoverable, ResourceId};

/// Live resources of one connection, keyed by id.
///
/// Entries are weak: the application's handles own the resources, and a
/// resource whose last handle is gone drops out of the registry.
///
/// Sweeps work on a [`snapshot`](Self::snapshot), so concurrent inserts and
/// removals never disturb an iteration in progress.
pub(crate) struct ResourceRegistry {
    name: String,
    resources: Mutex<HashMap<ResourceId, Weak<dyn Recoverable>>>,
}

impl ResourceRegistry {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, resource: Arc<dyn Recoverable>) {
        let len = {
            let mut resources = self.resources.lock();
            resources.insert(resource.id(), Arc::downgrade(&resource));
            resources.len()
        };
        self.report(len);
    }

    /// Returns whether `id` was registered.
    ///
    /// Called from resource drop glue, so it never hands back a strong
    /// reference.
    pub(crate) fn remove(&self, id: ResourceId) -> bool {
        let (removed, len) = {
            let mut resources = self.resources.lock();
            (resources.remove(&id).is_some(), resources.len())
        };
        self.report(len);
        removed
    }

    pub(crate) fn get(&self, id: ResourceId) -> Option<Arc<dyn Recoverable>> {
        self.resources.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Every resource still held by the application. Dead entries are pruned.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Recoverable>> {
        let (live, len) = {
            let mut resources = self.resources.lock();
            resources.retain(|_, resource| resource.strong_count() > 0);
            let live: Vec<_> = resources.values().filter_map(Weak::upgrade).collect();
            (live, resources.len())
        };
        self.report(len);
        live
    }

    pub(crate) fn len(&self) -> usize {
        self.resources
            .lock()
            .values()
            .filter(|resource| resource.strong_count() > 0)
            .count()
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    fn report(&self, len: usize) {
        #[cfg(feature = "metrics")]
        gauge!("amqp_recovery_registered_resources", "connection" => self.name.clone())
            .set(len as f64);
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
