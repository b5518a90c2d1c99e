//! Aggregated Discovery Service implementation.
//!
//! Each stream runs on its own task. The task multiplexes client requests
//! and cache watch wake-ups, and writes responses into a bounded channel
//! that backs the response stream.

use std::sync::Arc;

use async_trait::async_trait;
use e2e_proto::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use e2e_proto::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use crate::sotw::SotwHandler;
use crate::stream::StreamContext;
use crate::watch::Watch;
use crate::SnapshotCache;

/// Aggregated Discovery Service over a [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct AdsService {
    cache: Arc<SnapshotCache>,
    handler: SotwHandler,
    response_buffer_size: usize,
}

enum Event {
    Request(DiscoveryRequest),
    SnapshotChanged,
    Closed,
}

impl AdsService {
    /// Create a service over a cache.
    pub fn new(cache: Arc<SnapshotCache>, response_buffer_size: usize) -> Self {
        let handler = SotwHandler::new(Arc::clone(&cache));
        Self {
            cache,
            handler,
            response_buffer_size: response_buffer_size.max(1),
        }
    }

    /// Wrap the service for `tonic::transport::Server::add_service`.
    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    async fn run_stream(
        self,
        mut inbound: Streaming<DiscoveryRequest>,
        tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) {
        let mut ctx = StreamContext::new();
        let mut watch: Option<Watch> = None;

        loop {
            let event = tokio::select! {
                message = inbound.next() => match message {
                    Some(Ok(request)) => Event::Request(request),
                    Some(Err(status)) => {
                        debug!(stream = %ctx.id(), error = %status, "stream error");
                        Event::Closed
                    }
                    None => Event::Closed,
                },
                Some(_) = next_update(&mut watch) => Event::SnapshotChanged,
            };

            let responses = match event {
                Event::Request(request) => {
                    if watch.is_none() {
                        if let Some(node) = request.node.as_ref() {
                            watch = Some(self.cache.create_watch(crate::NodeHash::from_id(&node.id)));
                        }
                    }
                    match self.handler.on_request(&mut ctx, request) {
                        Ok(response) => response.into_iter().collect(),
                        Err(e) => {
                            warn!(stream = %ctx.id(), error = %e, "rejecting stream");
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                    }
                }
                Event::SnapshotChanged => self.handler.on_snapshot(&mut ctx),
                Event::Closed => break,
            };

            for response in responses {
                if tx.send(Ok(response)).await.is_err() {
                    debug!(stream = %ctx.id(), "client disconnected");
                    return;
                }
            }
        }

        info!(
            stream = %ctx.id(),
            node = ctx.node_id().unwrap_or("-"),
            duration = ?ctx.duration(),
            requests = ctx.request_count(),
            responses = ctx.response_count(),
            "ADS stream ended"
        );
    }
}

async fn next_update(watch: &mut Option<Watch>) -> Option<()> {
    match watch {
        Some(watch) => watch.recv().await.map(|_| ()),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    #[instrument(skip(self, request), name = "ads_stream")]
    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let remote = request.remote_addr();
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.response_buffer_size);

        debug!(remote = ?remote, "ADS stream started");
        tokio::spawn(self.clone().run_stream(inbound, tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
