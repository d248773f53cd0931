use crate::endpoint::EndpointEntry;
use crate::events::RemovalReason;
use crate::registry::RouterInner;
use nlb_core::Protocol;
use std::sync::{Arc, Weak};

/// A connection slot on a routed instance.
///
/// Holding this keeps the instance's connection count raised by one. The
/// slot is released exactly once, either by [`release`](Self::release) or
/// when the value is dropped. Releasing the last connection of a draining
/// instance removes it from the registry.
#[derive(Debug)]
pub struct RoutedConnection {
    entry: Arc<EndpointEntry>,
    router: Weak<RouterInner>,
    released: bool,
}

impl RoutedConnection {
    pub(crate) fn new(entry: Arc<EndpointEntry>, router: Weak<RouterInner>) -> Self {
        Self {
            entry,
            router,
            released: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.entry.instance_id
    }

    pub fn protocol(&self) -> Protocol {
        self.entry.protocol
    }

    /// Forwarding address of the instance.
    pub fn address(&self) -> String {
        self.entry.address()
    }

    pub fn version(&self) -> String {
        self.entry.version()
    }

    /// Current connection count of the instance, this one included.
    pub fn connections(&self) -> u64 {
        self.entry.connections()
    }

    /// Release the slot now rather than at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let remaining = self.entry.release();
        if remaining == 0
            && self.entry.is_draining()
            && !self.entry.is_removed()
            && let Some(router) = self.router.upgrade()
        {
            router.remove(
                &self.entry.instance_id,
                Some(&self.entry),
                RemovalReason::Drained,
            );
        }
    }
}

impl Drop for RoutedConnection {
    fn drop(&mut self) {
        self.release_once();
    }
}
