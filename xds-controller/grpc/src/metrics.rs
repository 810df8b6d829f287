use crate::resource::ResourceType;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{gauge::Gauge, histogram::Histogram};
use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct StreamMetricsFamily {
    started: Counter,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    unauthenticated: Gauge,
    responses: Family<TypeLabels, Counter>,
    acks: Family<AckLabels, Counter>,
    first_push: Histogram,
}

/// Observes a single delta stream. The stream is recorded as handled when
/// the observer is ended or dropped.
#[derive(Debug)]
pub(crate) struct StreamObserver {
    family: StreamMetricsFamily,
    start: time::Instant,
    pushed: bool,
    unauthenticated: bool,
    ended: bool,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_code: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    resource_type: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct AckLabels {
    resource_type: &'static str,
    result: &'static str,
}

// === StreamMetricsFamily ===

impl StreamMetricsFamily {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Counter::default();
        reg.register(
            "streams_started",
            "Total number of delta ADS streams started on the server",
            started.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "streams_handled",
            "Total number of delta ADS streams completed on the server, by gRPC status",
            handled.clone(),
        );

        // Proxies hold streams open for as long as they run.
        let handling = Histogram::new([1.0, 60.0, 3600.0, 86400.0]);
        reg.register_with_unit(
            "stream_duration",
            "Histogram of delta ADS stream lifetimes",
            Unit::Seconds,
            handling.clone(),
        );

        let unauthenticated = Gauge::default();
        reg.register(
            "unauthenticated_streams",
            "Number of open delta ADS streams that did not present a token",
            unauthenticated.clone(),
        );

        let responses = Family::<TypeLabels, Counter>::default();
        reg.register(
            "responses",
            "Total number of delta discovery responses sent, by resource type",
            responses.clone(),
        );

        let acks = Family::<AckLabels, Counter>::default();
        reg.register(
            "acks",
            "Total number of acknowledgements received from proxies, by resource type and result",
            acks.clone(),
        );

        let first_push = Histogram::new([0.01, 0.1, 1.0, 10.0]);
        reg.register_with_unit(
            "time_to_first_push",
            "Histogram of the time between a stream starting and its first response",
            Unit::Seconds,
            first_push.clone(),
        );

        Self {
            started,
            handling,
            handled,
            unauthenticated,
            responses,
            acks,
            first_push,
        }
    }

    pub(crate) fn stream(&self, authenticated: bool) -> StreamObserver {
        self.started.inc();
        // Pre-register OK
        let _ = self.handled.get_or_create(&CodeLabels {
            grpc_code: code_str(tonic::Code::Ok),
        });
        if !authenticated {
            self.unauthenticated.inc();
        }
        StreamObserver {
            family: self.clone(),
            start: time::Instant::now(),
            pushed: false,
            unauthenticated: !authenticated,
            ended: false,
        }
    }
}

// === StreamObserver ===

impl StreamObserver {
    pub(crate) fn response_sent(&mut self, resource_type: ResourceType) {
        self.family
            .responses
            .get_or_create(&TypeLabels {
                resource_type: resource_type.as_str(),
            })
            .inc();
        if !self.pushed {
            self.pushed = true;
            self.family
                .first_push
                .observe(self.start.elapsed().as_secs_f64());
        }
    }

    pub(crate) fn ack(&self, resource_type: ResourceType) {
        self.ack_result(resource_type, "ack");
    }

    pub(crate) fn nack(&self, resource_type: ResourceType) {
        self.ack_result(resource_type, "nack");
    }

    fn ack_result(&self, resource_type: ResourceType, result: &'static str) {
        self.family
            .acks
            .get_or_create(&AckLabels {
                resource_type: resource_type.as_str(),
                result,
            })
            .inc();
    }

    /// Records the stream's outcome. Later calls have no effect.
    pub(crate) fn end(&mut self, code: tonic::Code) {
        if std::mem::replace(&mut self.ended, true) {
            return;
        }
        self.family
            .handling
            .observe(self.start.elapsed().as_secs_f64());
        self.family
            .handled
            .get_or_create(&CodeLabels {
                grpc_code: code_str(code),
            })
            .inc();
        if self.unauthenticated {
            self.family.unauthenticated.dec();
        }
    }
}

impl Drop for StreamObserver {
    fn drop(&mut self) {
        self.end(tonic::Code::Ok);
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    fn render(reg: &Registry) -> String {
        let mut out = String::new();
        encode(&mut out, reg).expect("must encode");
        out
    }

    #[test]
    fn records_stream_outcomes() {
        let mut reg = Registry::default();
        let family = StreamMetricsFamily::register(reg.sub_registry_with_prefix("xds"));

        let mut stream = family.stream(false);
        stream.response_sent(ResourceType::Cluster);
        stream.ack(ResourceType::Cluster);
        stream.nack(ResourceType::Listener);
        let text = render(&reg);
        assert!(text.contains("xds_unauthenticated_streams 1"), "{text}");
        assert!(text.contains("xds_responses_total{resource_type=\"cluster\"} 1"));
        assert!(text.contains("xds_acks_total{resource_type=\"listener\",result=\"nack\"} 1"));
        assert!(text.contains("xds_time_to_first_push_seconds_count 1"));

        stream.end(tonic::Code::PermissionDenied);
        let text = render(&reg);
        assert!(text.contains("xds_unauthenticated_streams 0"), "{text}");
        assert!(text.contains("xds_streams_handled_total{grpc_code=\"PERMISSION_DENIED\"} 1"));

        drop(family.stream(true));
        let text = render(&reg);
        assert!(text.contains("xds_streams_started_total 2"));
        assert!(text.contains("xds_streams_handled_total{grpc_code=\"OK\"} 1"));
    }
}
