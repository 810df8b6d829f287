use crate::{
    generate::GenerateResources,
    metrics::StreamMetricsFamily,
    session::{ResponseTx, Session},
};
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{AggregatedDiscoveryService, AggregatedDiscoveryServiceServer},
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use futures::prelude::*;
use std::{pin::Pin, sync::Arc};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Duration,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info_span, trace, Instrument};
use xds_controller_core::{ResolveAuthorizer, WatchConfig};

/// Request metadata that carries the proxy's credential.
pub const TOKEN_METADATA_KEY: &str = "x-xds-token";

pub const DEFAULT_AUTH_CHECK_FREQUENCY: Duration = Duration::from_secs(5 * 60);

/// Requests are handed to the session through a small buffer so that a slow
/// session applies backpressure to the proxy.
const REQUEST_BUFFER: usize = 8;

#[derive(Clone, Debug)]
pub struct DeltaAdsServer<W, G, R> {
    config: W,
    generator: G,
    authorizers: R,
    auth_check_frequency: Duration,
    streams: Option<Arc<Semaphore>>,
    metrics: StreamMetricsFamily,
    drain: drain::Watch,
}

type BoxResponseStream =
    Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, tonic::Status>> + Send>>;

type BoxSotwStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

// === impl DeltaAdsServer ===

impl<W, G, R> DeltaAdsServer<W, G, R>
where
    W: WatchConfig + Clone + Send + Sync + 'static,
    G: GenerateResources + Clone + Send + Sync + 'static,
    R: ResolveAuthorizer + Clone + Send + Sync + 'static,
{
    pub fn new(
        config: W,
        generator: G,
        authorizers: R,
        metrics: StreamMetricsFamily,
        drain: drain::Watch,
    ) -> Self {
        Self {
            config,
            generator,
            authorizers,
            auth_check_frequency: DEFAULT_AUTH_CHECK_FREQUENCY,
            streams: None,
            metrics,
            drain,
        }
    }

    /// Sets how often a running stream's credential is re-checked.
    pub fn with_auth_check_frequency(mut self, frequency: Duration) -> Self {
        self.auth_check_frequency = frequency;
        self
    }

    /// Limits the number of concurrently open streams.
    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.streams = Some(Arc::new(Semaphore::new(max)));
        self
    }

    pub fn svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    fn serve<S>(&self, credential: Option<String>, requests: S) -> Result<BoxResponseStream, tonic::Status>
    where
        S: Stream<Item = Result<DeltaDiscoveryRequest, tonic::Status>> + Send + Unpin + 'static,
    {
        let permit = match self.streams.as_ref() {
            Some(streams) => Some(streams.clone().try_acquire_owned().map_err(|_| {
                tonic::Status::resource_exhausted(
                    "this server has too many xDS streams open, please try another",
                )
            })?),
            None => None,
        };

        let span = info_span!(
            "delta_ads",
            proxy = tracing::field::Empty,
            kind = tracing::field::Empty,
        );
        let metrics = self.metrics.stream(credential.is_some());
        let (req_tx, req_rx) = mpsc::channel(REQUEST_BUFFER);
        let (rsp_tx, rsp_rx) = mpsc::channel(ResponseTx::CAPACITY);

        let session = Session::new(
            self.config.clone(),
            self.generator.clone(),
            self.authorizers.clone(),
            credential,
            self.auth_check_frequency,
            ResponseTx::new(rsp_tx.clone()),
            metrics,
        );
        let drain = self.drain.clone();
        tokio::spawn(forward_requests(requests, req_tx).instrument(span.clone()));
        tokio::spawn(
            async move {
                let _permit = permit;
                match session.run(req_rx, drain).await {
                    Ok(()) => debug!("Stream completed"),
                    Err(status) => {
                        debug!(%status, "Stream terminated");
                        let _ = rsp_tx.send(Err(status)).await;
                    }
                }
            }
            .instrument(span),
        );

        Ok(Box::pin(ReceiverStream::new(rsp_rx)))
    }
}

#[tonic::async_trait]
impl<W, G, R> AggregatedDiscoveryService for DeltaAdsServer<W, G, R>
where
    W: WatchConfig + Clone + Send + Sync + 'static,
    G: GenerateResources + Clone + Send + Sync + 'static,
    R: ResolveAuthorizer + Clone + Send + Sync + 'static,
{
    type StreamAggregatedResourcesStream = BoxSotwStream;

    async fn stream_aggregated_resources(
        &self,
        _req: tonic::Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxSotwStream>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "only the delta variant of ADS is supported",
        ))
    }

    type DeltaAggregatedResourcesStream = BoxResponseStream;

    async fn delta_aggregated_resources(
        &self,
        req: tonic::Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<tonic::Response<BoxResponseStream>, tonic::Status> {
        let credential = credential(req.metadata());
        let stream = self.serve(credential, req.into_inner())?;
        Ok(tonic::Response::new(stream))
    }
}

fn credential(metadata: &tonic::metadata::MetadataMap) -> Option<String> {
    metadata
        .get(TOKEN_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Reads requests from the proxy until it closes the stream, the stream
/// fails, or the session stops listening.
async fn forward_requests<S>(mut requests: S, tx: mpsc::Sender<DeltaDiscoveryRequest>)
where
    S: Stream<Item = Result<DeltaDiscoveryRequest, tonic::Status>> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = tx.closed() => {
                trace!("Session ended");
                return;
            }

            req = requests.next() => match req {
                Some(Ok(req)) => {
                    if tx.send(req).await.is_err() {
                        return;
                    }
                }
                Some(Err(status)) => {
                    debug!(%status, "Failed to receive request");
                    return;
                }
                None => {
                    trace!("Request stream closed");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
impl<W, G, R> DeltaAdsServer<W, G, R>
where
    W: WatchConfig + Clone + Send + Sync + 'static,
    G: GenerateResources + Clone + Send + Sync + 'static,
    R: ResolveAuthorizer + Clone + Send + Sync + 'static,
{
    /// Opens a stream fed by the given requests, bypassing the transport.
    pub(crate) fn open<S>(
        &self,
        credential: Option<&str>,
        requests: S,
    ) -> Result<BoxResponseStream, tonic::Status>
    where
        S: Stream<Item = Result<DeltaDiscoveryRequest, tonic::Status>> + Send + Unpin + 'static,
    {
        self.serve(credential.map(str::to_string), requests)
    }
}
