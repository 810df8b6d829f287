use crate::{resource::ResourceType, tracker::Ops};
use tracing::trace;

/// One step of a push pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Step {
    pub resource_type: ResourceType,
    pub ops: Ops,

    /// Types that must not have unacknowledged updates when this step runs.
    pub after: &'static [ResourceType],
}

/// The order in which changes are pushed so that the proxy never refers to
/// a resource it has not received, and never loses a resource that is still
/// referenced.
pub(crate) const PUSH_ORDER: [Step; 6] = [
    Step {
        resource_type: ResourceType::Cluster,
        ops: Ops::UPSERT,
        after: &[],
    },
    Step {
        resource_type: ResourceType::Endpoint,
        ops: Ops::UPSERT,
        after: &[],
    },
    Step {
        resource_type: ResourceType::Listener,
        ops: Ops {
            upsert: true,
            remove: true,
        },
        after: &[ResourceType::Cluster, ResourceType::Endpoint],
    },
    Step {
        resource_type: ResourceType::Route,
        ops: Ops {
            upsert: true,
            remove: true,
        },
        after: &[ResourceType::Cluster, ResourceType::Endpoint],
    },
    Step {
        resource_type: ResourceType::Cluster,
        ops: Ops::REMOVE,
        after: &[ResourceType::Listener, ResourceType::Route],
    },
    Step {
        resource_type: ResourceType::Endpoint,
        ops: Ops::REMOVE,
        after: &[ResourceType::Listener, ResourceType::Route],
    },
];

/// Sends the changes described by a step.
pub(crate) trait Push {
    type Error;

    /// Indicates whether the proxy has subscribed to the type.
    fn subscribed(&self, resource_type: ResourceType) -> bool;

    /// Indicates whether the type has an unacknowledged update.
    fn in_flight(&self, resource_type: ResourceType) -> bool;

    /// Returns true if a response was sent.
    fn push(&mut self, step: &Step) -> Result<bool, Self::Error>;
}

/// The outcome of a push pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Pass {
    pub pushed: Vec<ResourceType>,

    /// True when a step was skipped to wait for an acknowledgement.
    pub deferred: bool,
}

/// Runs each step of [`PUSH_ORDER`] once. A type is sent at most one
/// response per pass; later steps for the same type wait for the next pass.
pub(crate) fn run<P: Push>(push: &mut P) -> Result<Pass, P::Error> {
    let mut pass = Pass::default();
    for step in &PUSH_ORDER {
        if !push.subscribed(step.resource_type) {
            continue;
        }
        if pass.pushed.contains(&step.resource_type) {
            trace!(resource_type = %step.resource_type, "Already pushed in this pass");
            continue;
        }
        if let Some(blocking) = step.after.iter().find(|t| push.in_flight(**t)) {
            trace!(
                resource_type = %step.resource_type,
                %blocking,
                "Deferring until the proxy acknowledges"
            );
            pass.deferred = true;
            continue;
        }
        if push.push(step)? {
            pass.pushed.push(step.resource_type);
        }
    }
    Ok(pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[derive(Default)]
    struct Recorder {
        /// Types with changes to send.
        dirty: Vec<ResourceType>,
        in_flight: Vec<ResourceType>,
        steps: Vec<(ResourceType, Ops)>,
    }

    impl Push for Recorder {
        type Error = Infallible;

        fn subscribed(&self, _: ResourceType) -> bool {
            true
        }

        fn in_flight(&self, resource_type: ResourceType) -> bool {
            self.in_flight.contains(&resource_type)
        }

        fn push(&mut self, step: &Step) -> Result<bool, Infallible> {
            self.steps.push((step.resource_type, step.ops));
            if self.dirty.contains(&step.resource_type) {
                self.in_flight.push(step.resource_type);
                return Ok(true);
            }
            Ok(false)
        }
    }

    #[test]
    fn removals_run_last() {
        let mut r = Recorder::default();
        let pass = run(&mut r).expect("infallible");
        assert_eq!(
            r.steps,
            [
                (ResourceType::Cluster, Ops::UPSERT),
                (ResourceType::Endpoint, Ops::UPSERT),
                (ResourceType::Listener, PUSH_ORDER[2].ops),
                (ResourceType::Route, PUSH_ORDER[3].ops),
                (ResourceType::Cluster, Ops::REMOVE),
                (ResourceType::Endpoint, Ops::REMOVE),
            ]
        );
        assert_eq!(pass, Pass::default());
    }

    #[test]
    fn listeners_wait_for_clusters() {
        let mut r = Recorder {
            dirty: vec![ResourceType::Cluster, ResourceType::Listener],
            ..Default::default()
        };
        let pass = run(&mut r).expect("infallible");
        assert_eq!(pass.pushed, [ResourceType::Cluster]);
        assert!(pass.deferred);
        assert_eq!(
            r.steps,
            [
                (ResourceType::Cluster, Ops::UPSERT),
                (ResourceType::Endpoint, Ops::UPSERT),
                (ResourceType::Endpoint, Ops::REMOVE),
            ]
        );

        // Once clusters are acknowledged, listeners go out and the cluster
        // removal step waits on them.
        r.in_flight.clear();
        r.dirty = vec![ResourceType::Listener];
        r.steps.clear();
        let pass = run(&mut r).expect("infallible");
        assert_eq!(pass.pushed, [ResourceType::Listener]);
        assert!(pass.deferred);
        assert_eq!(r.steps.len(), 4);
    }

    #[test]
    fn one_response_per_type_per_pass() {
        let mut r = Recorder {
            dirty: vec![ResourceType::Endpoint],
            ..Default::default()
        };
        let pass = run(&mut r).expect("infallible");
        assert_eq!(pass.pushed, [ResourceType::Endpoint]);
        assert!(!r.steps.contains(&(ResourceType::Endpoint, Ops::REMOVE)));
    }
}
