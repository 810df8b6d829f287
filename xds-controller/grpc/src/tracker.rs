//! Per-type delivery state for a single stream.
//!
//! A tracker records what the proxy has confirmed, what it has asked for,
//! and what is awaiting acknowledgement, and computes the minimal update
//! that brings the proxy in line with the current resource versions.

use crate::{
    index::IndexedResources,
    resource::ResourceType,
    session::{ResponseTx, StreamClosed},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, Resource as DiscoveryResource,
};
use tracing::{debug, trace};

#[derive(Debug)]
pub(crate) struct Tracker {
    resource_type: ResourceType,
    registered: bool,
    wildcard: bool,
    sent_once: bool,
    subscriptions: HashSet<String>,

    /// Versions the proxy is known to hold. An empty version marks a name
    /// that must be (re)sent regardless of content.
    confirmed: HashMap<String, String>,

    /// Unacknowledged updates, by nonce. An empty version marks a removal.
    pending: HashMap<String, HashMap<String, String>>,
}

/// The kinds of change a push may carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Ops {
    pub upsert: bool,
    pub remove: bool,
}

/// Classifies an inbound request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Recv {
    /// The first request for this type.
    Subscribe,
    Ack,
    Nack,
    /// A subscription change or a stale acknowledgement.
    Update,
}

/// Changes that would bring the proxy up to date, restricted to the
/// operations the caller allowed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Diff {
    upserts: Vec<(String, String)>,
    removals: Vec<String>,
}

/// Describes a response that was written to the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Sent {
    pub nonce: String,
    pub upserted: Vec<String>,
    pub removed: Vec<String>,
}

/// Produces stream-scoped nonces: `00000001`, `00000002`, ...
#[derive(Debug, Default)]
pub(crate) struct Nonce(u64);

#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
    #[error("{resource_type} {name:?} has a version but no resource")]
    Inconsistent {
        resource_type: ResourceType,
        name: String,
    },

    #[error(transparent)]
    Closed(#[from] StreamClosed),
}

// === impl Ops ===

impl Ops {
    pub const UPSERT: Self = Self {
        upsert: true,
        remove: false,
    };

    pub const REMOVE: Self = Self {
        upsert: false,
        remove: true,
    };
}

// === impl Nonce ===

impl Nonce {
    pub(crate) fn next(&mut self) -> String {
        self.0 += 1;
        format!("{:08x}", self.0)
    }
}

// === impl Tracker ===

impl Tracker {
    pub(crate) fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            registered: false,
            wildcard: false,
            sent_once: false,
            subscriptions: HashSet::default(),
            confirmed: HashMap::default(),
            pending: HashMap::default(),
        }
    }

    pub(crate) fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn is_subscribed(&self, name: &str) -> bool {
        self.wildcard || self.subscriptions.contains(name)
    }

    /// Applies a request's acknowledgement and subscription changes.
    pub(crate) fn handle_request(&mut self, req: &DeltaDiscoveryRequest) -> Recv {
        let first = !self.registered;
        if first {
            self.registered = true;
            self.wildcard = req.resource_names_subscribe.is_empty();
            debug!(
                resource_type = %self.resource_type,
                wildcard = self.wildcard,
                "Subscribed"
            );
        }

        let mut recv = if first { Recv::Subscribe } else { Recv::Update };
        if !req.response_nonce.is_empty() {
            if req.error_detail.is_some() {
                self.nack(&req.response_nonce);
                if !first {
                    return Recv::Nack;
                }
            } else if self.ack(&req.response_nonce) && !first {
                recv = Recv::Ack;
            }
        }

        if first {
            for (name, version) in &req.initial_resource_versions {
                self.confirmed.insert(name.clone(), version.clone());
                if !self.wildcard {
                    self.subscriptions.insert(name.clone());
                }
            }
        }

        if !self.wildcard {
            for name in &req.resource_names_subscribe {
                self.subscriptions.insert(name.clone());
                self.confirmed.insert(name.clone(), String::new());
            }
            for name in &req.resource_names_unsubscribe {
                self.subscriptions.remove(name);
                self.confirmed.remove(name);
            }
        }

        recv
    }

    fn ack(&mut self, nonce: &str) -> bool {
        let Some(versions) = self.pending.remove(nonce) else {
            trace!(resource_type = %self.resource_type, %nonce, "Ignoring unknown nonce");
            return false;
        };
        for (name, version) in versions {
            if version.is_empty() {
                self.confirmed.remove(&name);
            } else if self.is_subscribed(&name) {
                self.confirmed.insert(name, version);
            }
        }
        self.sent_once = true;
        true
    }

    fn nack(&mut self, nonce: &str) {
        self.pending.remove(nonce);
    }

    /// Forces the named resource to be resent if the proxy holds or awaits
    /// it.
    pub(crate) fn force_resend(&mut self, name: &str) -> bool {
        if !self.is_subscribed(name) {
            return false;
        }
        match self.confirmed.get_mut(name) {
            Some(version) => {
                version.clear();
                true
            }
            None => false,
        }
    }

    /// Compares the current versions against what the proxy holds.
    ///
    /// Returns `None` when nothing should be sent. A `Some` with an empty diff
    /// is still sent: the proxy expects an initial response for every type it
    /// subscribes to.
    pub(crate) fn compute_diff(
        &self,
        current: &HashMap<String, String>,
        allow_empty: bool,
        ops: Ops,
    ) -> Option<Diff> {
        if current.is_empty() && !allow_empty {
            return None;
        }

        let mut diff = Diff::default();
        let held = self
            .confirmed
            .iter()
            .filter(|(name, _)| self.is_subscribed(name));
        for (name, confirmed) in held {
            match current.get(name) {
                None if ops.remove => diff.removals.push(name.clone()),
                Some(version) if ops.upsert && version != confirmed => {
                    diff.upserts.push((name.clone(), version.clone()))
                }
                _ => {}
            }
        }
        if ops.upsert {
            let unconfirmed = current
                .iter()
                .filter(|(name, _)| !self.confirmed.contains_key(*name))
                .filter(|(name, _)| self.is_subscribed(name));
            for (name, version) in unconfirmed {
                diff.upserts.push((name.clone(), version.clone()));
            }
        }

        let relevant = !diff.upserts.is_empty() || !diff.removals.is_empty();
        if !relevant && self.sent_once {
            return None;
        }
        diff.upserts.sort();
        diff.removals.sort();
        Some(diff)
    }

    /// Sends any outstanding changes allowed by `ops`.
    ///
    /// Nothing is sent while a previous response for this type is
    /// unacknowledged.
    pub(crate) fn send(
        &mut self,
        current: &HashMap<String, String>,
        resources: &IndexedResources,
        allow_empty: bool,
        ops: Ops,
        nonce: &mut Nonce,
        tx: &ResponseTx,
    ) -> Result<Option<Sent>, SendError> {
        if !self.registered || self.has_pending() {
            return Ok(None);
        }
        let Some(diff) = self.compute_diff(current, allow_empty, ops) else {
            return Ok(None);
        };

        let mut rsp = DeltaDiscoveryResponse {
            type_url: self.resource_type.type_url().to_string(),
            ..Default::default()
        };
        let mut pending = HashMap::with_capacity(diff.upserts.len() + diff.removals.len());
        for (name, version) in &diff.upserts {
            let resource = resources.get(self.resource_type, name).ok_or_else(|| {
                SendError::Inconsistent {
                    resource_type: self.resource_type,
                    name: name.clone(),
                }
            })?;
            rsp.resources.push(DiscoveryResource {
                name: name.clone(),
                version: version.clone(),
                resource: Some(resource.to_any()),
                ..Default::default()
            });
            pending.insert(name.clone(), version.clone());
        }
        for name in &diff.removals {
            rsp.removed_resources.push(name.clone());
            pending.insert(name.clone(), String::new());
        }

        rsp.nonce = nonce.next();
        let nonce = rsp.nonce.clone();
        tx.send(rsp)?;
        self.pending.insert(nonce.clone(), pending);

        Ok(Some(Sent {
            nonce,
            upserted: diff.upserts.into_iter().map(|(name, _)| name).collect(),
            removed: diff.removals,
        }))
    }

    #[cfg(test)]
    pub(crate) fn confirmed(&self, name: &str) -> Option<&str> {
        self.confirmed.get(name).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn confirmed_versions(&self) -> &HashMap<String, String> {
        &self.confirmed
    }
}
