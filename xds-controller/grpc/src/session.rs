//! Drives a single delta ADS stream.
//!
//! A session starts in [`State::Init`] until a request identifies the proxy,
//! opens a config watch and waits in [`State::PendingInitialConfig`] for the
//! first snapshot, and then pushes updates in [`State::Running`]. Requests,
//! snapshots, timers, and shutdown are all handled on a single task, so the
//! session owns its state without locks.

use crate::{
    generate::GenerateResources,
    index::{IndexedResources, Versions},
    metrics::StreamObserver,
    order::{self, Push, Step},
    resource::{PerType, ResourceType},
    tracker::{Nonce, Recv, SendError, Tracker},
};
use ahash::AHashMap as HashMap;
use envoy_types::pb::envoy::service::discovery::v3::{DeltaDiscoveryRequest, DeltaDiscoveryResponse};
use futures::prelude::*;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tonic::Status;
use tracing::{debug, info, trace, warn};
use xds_controller_core::{
    AuthzError, ConfigSnapshot, ConfigSnapshotStream, ConfigWatch, ProxyId, ProxyKind,
    ResolveAuthorizer, WatchCancel, WatchConfig, WatchError,
};


/// Delay before retrying a pass that deferred steps or failed to send.
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Init,
    PendingInitialConfig,
    Running,
}

pub(crate) struct Session<W, G, R> {
    config: W,
    generator: G,
    authorizers: R,
    credential: Option<String>,
    auth_check_frequency: Duration,

    state: State,
    proxy: Option<ProxyId>,
    snapshots: Option<ConfigSnapshotStream>,
    cancel: Option<WatchCancel>,
    snapshot: Option<Arc<ConfigSnapshot>>,

    resources: IndexedResources,
    versions: Versions,
    trackers: PerType<Option<Tracker>>,

    /// Children of each parent as of the parent's last send.
    sent_children: PerType<HashMap<String, Vec<String>>>,

    nonce: Nonce,
    auth_timer: Timer,
    retry_timer: Timer,
    tx: ResponseTx,
    metrics: StreamObserver,
}

/// Writes responses to the stream without waiting.
///
/// The buffer holds one response per type plus a terminal status, and at most
/// one response per type is ever unacknowledged.
#[derive(Clone, Debug)]
pub(crate) struct ResponseTx(mpsc::Sender<Result<DeltaDiscoveryResponse, Status>>);

#[derive(Debug, thiserror::Error)]
#[error("response stream closed")]
pub(crate) struct StreamClosed(());

/// A resettable deadline. A disarmed timer never fires.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    deadline: Option<Instant>,
}

// === impl ResponseTx ===

impl ResponseTx {
    pub(crate) const CAPACITY: usize = ResourceType::ALL.len() + 1;

    pub(crate) fn new(tx: mpsc::Sender<Result<DeltaDiscoveryResponse, Status>>) -> Self {
        Self(tx)
    }

    pub(crate) fn send(&self, rsp: DeltaDiscoveryResponse) -> Result<(), StreamClosed> {
        self.0.try_send(Ok(rsp)).map_err(|_| StreamClosed(()))
    }
}

// === impl Timer ===

impl Timer {
    fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    fn disarm(&mut self) {
        self.deadline = None;
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }
}

// === impl Session ===

impl<W, G, R> Session<W, G, R>
where
    W: WatchConfig,
    G: GenerateResources,
    R: ResolveAuthorizer,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: W,
        generator: G,
        authorizers: R,
        credential: Option<String>,
        auth_check_frequency: Duration,
        tx: ResponseTx,
        metrics: StreamObserver,
    ) -> Self {
        Self {
            config,
            generator,
            authorizers,
            credential,
            auth_check_frequency,
            state: State::Init,
            proxy: None,
            snapshots: None,
            cancel: None,
            snapshot: None,
            resources: IndexedResources::default(),
            versions: Versions::default(),
            trackers: PerType::default(),
            sent_children: PerType::default(),
            nonce: Nonce::default(),
            auth_timer: Timer::default(),
            retry_timer: Timer::default(),
            tx,
            metrics,
        }
    }

    /// Runs until the proxy disconnects or the stream must be terminated
    /// with a status. The config watch is released when the session ends.
    pub(crate) async fn run(
        mut self,
        requests: mpsc::Receiver<DeltaDiscoveryRequest>,
        drain: drain::Watch,
    ) -> Result<(), Status> {
        let res = self.serve(requests, drain).await;
        self.metrics
            .end(res.as_ref().err().map_or(tonic::Code::Ok, Status::code));
        res
    }

    async fn serve(
        &mut self,
        mut requests: mpsc::Receiver<DeltaDiscoveryRequest>,
        drain: drain::Watch,
    ) -> Result<(), Status> {
        // Reject unknown credentials before reading anything.
        self.authorizers
            .resolve_authorizer(self.credential.as_deref())
            .map_err(authz_status)?;

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            let mut nacked = false;
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => nacked = self.recv(req)?,
                    None => {
                        debug!("Proxy disconnected");
                        return Ok(());
                    }
                },

                snapshot = next_snapshot(&mut self.snapshots) => match snapshot {
                    Some(snapshot) => self.update(snapshot)?,
                    None => {
                        return Err(Status::aborted(
                            "xDS stream terminated due to an irrecoverable error, please try again",
                        ));
                    }
                },

                () = self.auth_timer.expired() => {
                    trace!("Rechecking authorization");
                    self.authorize()?;
                    self.auth_timer.arm(self.auth_check_frequency);
                }

                () = self.retry_timer.expired() => {
                    trace!("Retrying deferred updates");
                    self.retry_timer.disarm();
                }

                _ = &mut shutdown => {
                    debug!("Server shutting down");
                    return Err(Status::unavailable("xDS server is shutting down"));
                }
            }

            while let Some(next) = self.transition(nacked)? {
                debug!(from = ?self.state, to = ?next, "Session state changed");
                self.state = next;
            }
        }
    }

    /// Performs the work of the current state and returns the next state,
    /// if the session can advance.
    fn transition(&mut self, nacked: bool) -> Result<Option<State>, Status> {
        match self.state {
            State::Init => {
                let Some(proxy) = self.proxy.clone() else {
                    return Ok(None);
                };
                self.watch(&proxy)?;
                Ok(Some(State::PendingInitialConfig))
            }

            State::PendingInitialConfig => {
                let Some(snapshot) = self.snapshot.clone() else {
                    return Ok(None);
                };
                tracing::Span::current().record("kind", tracing::field::display(snapshot.kind));
                self.authorize()?;
                self.auth_timer.arm(self.auth_check_frequency);
                Ok(Some(State::Running))
            }

            State::Running => {
                if nacked {
                    trace!("Skipping push after a rejected update");
                } else {
                    self.push()?;
                }
                Ok(None)
            }
        }
    }

    fn recv(&mut self, req: DeltaDiscoveryRequest) -> Result<bool, Status> {
        if req.type_url.is_empty() {
            return Err(Status::invalid_argument("type URL is required for ADS"));
        }
        let resource_type = ResourceType::from_type_url(&req.type_url).ok_or_else(|| {
            Status::invalid_argument(format!("unsupported resource type: {}", req.type_url))
        })?;

        if self.proxy.is_none() {
            if let Some(node) = req.node.as_ref() {
                if node.id.is_empty() {
                    return Err(Status::invalid_argument("node ID is required"));
                }
                let proxy = ProxyId::new(node.id.clone());
                tracing::Span::current().record("proxy", tracing::field::display(&proxy));
                self.proxy = Some(proxy);
            }
        }

        let tracker =
            self.trackers[resource_type].get_or_insert_with(|| Tracker::new(resource_type));
        match tracker.handle_request(&req) {
            Recv::Subscribe => {
                debug!(%resource_type, "Proxy subscribed");
            }
            Recv::Ack => {
                trace!(%resource_type, nonce = %req.response_nonce, "ACK");
                self.metrics.ack(resource_type);
            }
            Recv::Nack => {
                let (code, message) = req
                    .error_detail
                    .as_ref()
                    .map(|s| (s.code, s.message.as_str()))
                    .unwrap_or_default();
                warn!(
                    %resource_type,
                    nonce = %req.response_nonce,
                    code,
                    reason = message,
                    "Proxy rejected update"
                );
                self.metrics.nack(resource_type);
                return Ok(true);
            }
            Recv::Update => {}
        }

        // The proxy discards children when it drops a parent, so a parent
        // that is subscribed again needs its children resent too.
        if let Some(child) = resource_type.child() {
            if !tracker.is_wildcard() {
                for name in &req.resource_names_subscribe {
                    if let Some(children) = self.sent_children[resource_type].get(name) {
                        resend(&mut self.trackers[child], children);
                    }
                }
            }
        }

        Ok(false)
    }

    fn update(&mut self, snapshot: Arc<ConfigSnapshot>) -> Result<(), Status> {
        let generated = self.generator.generate(&snapshot).map_err(|error| {
            Status::internal(format!("failed to generate xDS resources: {error}"))
        })?;
        let resources = IndexedResources::index(generated).map_err(|error| {
            Status::internal(format!("failed to index xDS resources: {error}"))
        })?;
        self.versions = resources.versions();
        self.resources = resources;
        debug!(
            listeners = self.resources.len(ResourceType::Listener),
            routes = self.resources.len(ResourceType::Route),
            clusters = self.resources.len(ResourceType::Cluster),
            endpoints = self.resources.len(ResourceType::Endpoint),
            "Received config snapshot"
        );
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn watch(&mut self, proxy: &ProxyId) -> Result<(), Status> {
        let ConfigWatch { snapshots, cancel } = self
            .config
            .watch_config(proxy, self.credential.as_deref())
            .map_err(|error: WatchError| Status::internal(error.to_string()))?;
        info!("Watching proxy config");
        self.snapshots = Some(snapshots);
        self.cancel = Some(cancel);
        Ok(())
    }

    fn authorize(&self) -> Result<(), Status> {
        let authz = self
            .authorizers
            .resolve_authorizer(self.credential.as_deref())
            .map_err(authz_status)?;
        if let Some(snapshot) = self.snapshot.as_ref() {
            snapshot.authorize(&*authz).map_err(authz_status)?;
        }
        Ok(())
    }

    fn push(&mut self) -> Result<(), Status> {
        let Some(kind) = self.snapshot.as_ref().map(|s| s.kind) else {
            return Ok(());
        };
        if let Some((resource_type, _)) = self
            .trackers
            .iter()
            .find(|(_, t)| t.as_ref().is_some_and(Tracker::has_pending))
        {
            trace!(%resource_type, "Waiting for the proxy to acknowledge an update");
            return Ok(());
        }

        let mut pusher = Pusher {
            kind,
            resources: &self.resources,
            versions: &self.versions,
            trackers: &mut self.trackers,
            sent_children: &mut self.sent_children,
            nonce: &mut self.nonce,
            tx: &self.tx,
            metrics: &mut self.metrics,
        };
        match order::run(&mut pusher) {
            Ok(pass) => {
                if pass.deferred {
                    self.retry_timer.arm(RETRY_DELAY);
                } else {
                    self.retry_timer.disarm();
                }
                Ok(())
            }
            Err(status) => {
                self.retry_timer.arm(RETRY_DELAY);
                Err(status)
            }
        }
    }
}

/// Sends the changes of one step.
struct Pusher<'s> {
    kind: ProxyKind,
    resources: &'s IndexedResources,
    versions: &'s Versions,
    trackers: &'s mut PerType<Option<Tracker>>,
    sent_children: &'s mut PerType<HashMap<String, Vec<String>>>,
    nonce: &'s mut Nonce,
    tx: &'s ResponseTx,
    metrics: &'s mut StreamObserver,
}

impl Push for Pusher<'_> {
    type Error = Status;

    fn subscribed(&self, resource_type: ResourceType) -> bool {
        self.trackers[resource_type].is_some()
    }

    fn in_flight(&self, resource_type: ResourceType) -> bool {
        self.trackers[resource_type]
            .as_ref()
            .is_some_and(Tracker::has_pending)
    }

    fn push(&mut self, step: &Step) -> Result<bool, Status> {
        let resource_type = step.resource_type;
        let Some(tracker) = self.trackers[resource_type].as_mut() else {
            return Ok(false);
        };
        let sent = tracker
            .send(
                &self.versions[resource_type],
                self.resources,
                resource_type.allows_empty(self.kind),
                step.ops,
                self.nonce,
                self.tx,
            )
            .map_err(|error| {
                let op = match (step.ops.upsert, step.ops.remove) {
                    (true, false) => "upsert ",
                    (false, true) => "remove ",
                    _ => "",
                };
                let msg = format!(
                    "failed to send {op}reply for type {}: {error}",
                    resource_type.type_url()
                );
                match error {
                    SendError::Inconsistent { .. } => Status::internal(msg),
                    SendError::Closed(_) => Status::unavailable(msg),
                }
            })?;
        let Some(sent) = sent else {
            return Ok(false);
        };
        debug!(
            %resource_type,
            nonce = %sent.nonce,
            upserts = sent.upserted.len(),
            removals = sent.removed.len(),
            "Sent update"
        );
        self.metrics.response_sent(resource_type);

        if let Some(child) = resource_type.child() {
            for name in &sent.upserted {
                let children = self.resources.children(resource_type, name);
                resend(&mut self.trackers[child], children);
                self.sent_children[resource_type].insert(name.clone(), children.to_vec());
            }
            for name in &sent.removed {
                self.sent_children[resource_type].remove(name);
            }
        }
        Ok(true)
    }
}

fn resend(tracker: &mut Option<Tracker>, names: &[String]) {
    if let Some(tracker) = tracker.as_mut() {
        for name in names {
            if tracker.force_resend(name) {
                trace!(%name, "Resending child resource");
            }
        }
    }
}

async fn next_snapshot(
    snapshots: &mut Option<ConfigSnapshotStream>,
) -> Option<Arc<ConfigSnapshot>> {
    match snapshots {
        Some(snapshots) => snapshots.next().await,
        None => future::pending().await,
    }
}

fn authz_status(error: AuthzError) -> Status {
    match error {
        AuthzError::NotFound => Status::unauthenticated(format!("unauthenticated: {error}")),
        AuthzError::PermissionDenied(_) => Status::permission_denied(error.to_string()),
    }
}
