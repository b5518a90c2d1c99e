//! Fake Cloud Monitoring v3 metric service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use e2e_proto::google::api::{MetricDescriptor, MonitoredResourceDescriptor};
use e2e_proto::google::monitoring::v3::metric_service_server::{MetricService, MetricServiceServer};
use e2e_proto::google::monitoring::v3::{
    CreateMetricDescriptorRequest, CreateTimeSeriesRequest, DeleteMetricDescriptorRequest,
    GetMetricDescriptorRequest, GetMonitoredResourceDescriptorRequest,
    ListMetricDescriptorsRequest, ListMetricDescriptorsResponse,
    ListMonitoredResourceDescriptorsRequest, ListMonitoredResourceDescriptorsResponse,
    ListTimeSeriesRequest, ListTimeSeriesResponse, TimeSeries,
};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::aggregate::{Ingest, IngestSender};

/// Metric service that records every `CreateTimeSeries` call.
///
/// Requests go to the aggregator and to a replay buffer that
/// `ListTimeSeries` serves back unfiltered. Descriptor RPCs are accepted
/// and do nothing.
#[derive(Debug, Clone)]
pub struct MetricServer {
    ingest: IngestSender,
    replay: Arc<Mutex<Vec<CreateTimeSeriesRequest>>>,
    delay: Duration,
}

impl MetricServer {
    /// Create a server feeding `ingest`.
    pub fn new(ingest: IngestSender) -> Self {
        Self {
            ingest,
            replay: Arc::default(),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long before answering `CreateTimeSeries`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every series received so far, in arrival order.
    pub fn received(&self) -> Vec<TimeSeries> {
        self.replay
            .lock()
            .expect("replay lock poisoned")
            .iter()
            .flat_map(|req| req.time_series.iter().cloned())
            .collect()
    }

    /// Drop the replay buffer.
    pub fn reset(&self) {
        self.replay.lock().expect("replay lock poisoned").clear();
    }

    /// Wrap the service for `tonic::transport::Server::add_service`.
    pub fn into_service(self) -> MetricServiceServer<Self> {
        MetricServiceServer::new(self)
    }
}

#[async_trait]
impl MetricService for MetricServer {
    async fn list_monitored_resource_descriptors(
        &self,
        _request: Request<ListMonitoredResourceDescriptorsRequest>,
    ) -> Result<Response<ListMonitoredResourceDescriptorsResponse>, Status> {
        Ok(Response::new(ListMonitoredResourceDescriptorsResponse::default()))
    }

    async fn get_monitored_resource_descriptor(
        &self,
        _request: Request<GetMonitoredResourceDescriptorRequest>,
    ) -> Result<Response<MonitoredResourceDescriptor>, Status> {
        Ok(Response::new(MonitoredResourceDescriptor::default()))
    }

    async fn list_metric_descriptors(
        &self,
        _request: Request<ListMetricDescriptorsRequest>,
    ) -> Result<Response<ListMetricDescriptorsResponse>, Status> {
        Ok(Response::new(ListMetricDescriptorsResponse::default()))
    }

    async fn get_metric_descriptor(
        &self,
        _request: Request<GetMetricDescriptorRequest>,
    ) -> Result<Response<MetricDescriptor>, Status> {
        Ok(Response::new(MetricDescriptor::default()))
    }

    async fn create_metric_descriptor(
        &self,
        request: Request<CreateMetricDescriptorRequest>,
    ) -> Result<Response<MetricDescriptor>, Status> {
        let descriptor = request.into_inner().metric_descriptor.unwrap_or_default();
        Ok(Response::new(descriptor))
    }

    async fn delete_metric_descriptor(
        &self,
        _request: Request<DeleteMetricDescriptorRequest>,
    ) -> Result<Response<()>, Status> {
        Ok(Response::new(()))
    }

    async fn list_time_series(
        &self,
        _request: Request<ListTimeSeriesRequest>,
    ) -> Result<Response<ListTimeSeriesResponse>, Status> {
        Ok(Response::new(ListTimeSeriesResponse {
            time_series: self.received(),
            next_page_token: String::new(),
        }))
    }

    async fn create_time_series(
        &self,
        request: Request<CreateTimeSeriesRequest>,
    ) -> Result<Response<()>, Status> {
        let request = request.into_inner();
        debug!(project = %request.name, series = request.time_series.len(), "received time series");

        self.replay
            .lock()
            .expect("replay lock poisoned")
            .push(request.clone());
        self.ingest
            .send(Ingest::Metrics(request))
            .map_err(|_| Status::unavailable("metric aggregator stopped"))?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Response::new(()))
    }
}
