//! Fake Cloud Logging v2 service.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use e2e_proto::google::logging::v2::logging_service_v2_server::{
    LoggingServiceV2, LoggingServiceV2Server,
};
use e2e_proto::google::logging::v2::{
    ListLogEntriesRequest, ListLogEntriesResponse, ListLogsRequest, ListLogsResponse, LogEntry,
    WriteLogEntriesRequest, WriteLogEntriesResponse,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::aggregate::{Ingest, IngestSender};

static LOG_NAME_FILTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"logName\s*=\s*"?([^"\s]+)"?"#).expect("valid logName regex"));

/// Logging service that records every written entry.
#[derive(Debug, Clone)]
pub struct LoggingServer {
    ingest: IngestSender,
    entries: Arc<Mutex<Vec<LogEntry>>>,
    delay: Duration,
}

impl LoggingServer {
    /// Create a server feeding `ingest`.
    pub fn new(ingest: IngestSender) -> Self {
        Self {
            ingest,
            entries: Arc::default(),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long before answering `WriteLogEntries`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every entry received so far, with request-level fields merged in.
    pub fn received(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("entries lock poisoned").clone()
    }

    /// Drop received entries.
    pub fn reset(&self) {
        self.entries.lock().expect("entries lock poisoned").clear();
    }

    /// Wrap the service for `tonic::transport::Server::add_service`.
    pub fn into_service(self) -> LoggingServiceV2Server<Self> {
        LoggingServiceV2Server::new(self)
    }
}

/// Push request-level log name, resource and labels down onto each entry.
///
/// Entry-level values win over request-level ones.
pub fn merge_request_fields(request: WriteLogEntriesRequest) -> Vec<LogEntry> {
    let WriteLogEntriesRequest {
        log_name,
        resource,
        labels,
        entries,
        ..
    } = request;

    entries
        .into_iter()
        .map(|mut entry| {
            if entry.log_name.is_empty() {
                entry.log_name = log_name.clone();
            }
            if entry.resource.is_none() {
                entry.resource = resource.clone();
            }
            for (key, value) in &labels {
                entry.labels.entry(key.clone()).or_insert_with(|| value.clone());
            }
            entry
        })
        .collect()
}

fn log_name_filter(filter: &str) -> Option<&str> {
    LOG_NAME_FILTER
        .captures(filter)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[async_trait]
impl LoggingServiceV2 for LoggingServer {
    async fn write_log_entries(
        &self,
        request: Request<WriteLogEntriesRequest>,
    ) -> Result<Response<WriteLogEntriesResponse>, Status> {
        let entries = merge_request_fields(request.into_inner());
        debug!(entries = entries.len(), "received log entries");

        self.entries
            .lock()
            .expect("entries lock poisoned")
            .extend(entries.iter().cloned());
        self.ingest
            .send(Ingest::Logs(entries))
            .map_err(|_| Status::unavailable("log aggregator stopped"))?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Response::new(WriteLogEntriesResponse {}))
    }

    async fn list_log_entries(
        &self,
        request: Request<ListLogEntriesRequest>,
    ) -> Result<Response<ListLogEntriesResponse>, Status> {
        let request = request.into_inner();
        let wanted = log_name_filter(&request.filter);
        let entries = self
            .received()
            .into_iter()
            .filter(|e| wanted.map_or(true, |name| e.log_name == name))
            .collect();

        Ok(Response::new(ListLogEntriesResponse {
            entries,
            next_page_token: String::new(),
        }))
    }

    async fn list_logs(
        &self,
        _request: Request<ListLogsRequest>,
    ) -> Result<Response<ListLogsResponse>, Status> {
        let names: BTreeSet<String> = self.received().into_iter().map(|e| e.log_name).collect();
        Ok(Response::new(ListLogsResponse {
            log_names: names.into_iter().collect(),
            next_page_token: String::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2e_proto::google::api::MonitoredResource;

    #[test]
    fn request_fields_flow_into_entries() {
        let request = WriteLogEntriesRequest {
            log_name: "projects/test-project/logs/server-accesslog-stackdriver".to_string(),
            resource: Some(MonitoredResource {
                r#type: "k8s_container".to_string(),
                ..Default::default()
            }),
            labels: [
                ("mesh_uid".to_string(), "mesh".to_string()),
                ("destination_name".to_string(), "from-request".to_string()),
            ]
            .into(),
            entries: vec![
                LogEntry::default(),
                LogEntry {
                    log_name: "projects/test-project/logs/custom".to_string(),
                    labels: [("destination_name".to_string(), "from-entry".to_string())].into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let entries = merge_request_fields(request);
        assert_eq!(
            entries[0].log_name,
            "projects/test-project/logs/server-accesslog-stackdriver"
        );
        assert_eq!(entries[0].resource.as_ref().unwrap().r#type, "k8s_container");
        assert_eq!(entries[0].labels["destination_name"], "from-request");
        assert_eq!(entries[1].log_name, "projects/test-project/logs/custom");
        assert_eq!(entries[1].labels["destination_name"], "from-entry");
        assert_eq!(entries[1].labels["mesh_uid"], "mesh");
    }

    #[test]
    fn parses_log_name_filter() {
        assert_eq!(
            log_name_filter(r#"logName="projects/p/logs/access""#),
            Some("projects/p/logs/access")
        );
        assert_eq!(log_name_filter("logName = projects/p/logs/x"), Some("projects/p/logs/x"));
        assert_eq!(log_name_filter("severity>=ERROR"), None);
    }
}
