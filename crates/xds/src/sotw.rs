//! State-of-the-World discovery handling.
//!
//! Every response carries the full set of subscribed resources of one type.
//! A response is only sent while the client has an open request for the
//! type, and only when the snapshot version differs from what was last sent.

use std::sync::Arc;

use e2e_proto::envoy::config::core::v3::ControlPlane;
use e2e_proto::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tracing::{debug, info, trace, warn};

use crate::stream::{generate_nonce, StreamContext, Subscription};
use crate::{Cache, NodeHash, SnapshotCache, TypeUrl, XdsError, XdsResult};

/// Identifier reported in `control_plane` of every response.
pub const CONTROL_PLANE_ID: &str = "envoye2e";

/// Handler for State-of-the-World discovery requests.
#[derive(Debug, Clone)]
pub struct SotwHandler {
    cache: Arc<SnapshotCache>,
}

impl SotwHandler {
    /// Create a handler over a cache.
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    /// Process a request from the client.
    ///
    /// Returns the response to send, if any.
    pub fn on_request(
        &self,
        ctx: &mut StreamContext,
        request: DiscoveryRequest,
    ) -> XdsResult<Option<DiscoveryResponse>> {
        ctx.record_request();

        let node = match ctx.node_hash() {
            Some(hash) => hash,
            None => {
                let node = request.node.as_ref().ok_or_else(|| XdsError::StreamError {
                    reason: "first request carried no node".to_string(),
                })?;
                info!(stream = %ctx.id(), node_id = %node.id, "node identified");
                ctx.set_node(node.id.clone())
            }
        };

        if request.type_url.is_empty() {
            return Err(XdsError::StreamError {
                reason: "request carried no type URL".to_string(),
            });
        }
        let type_url = TypeUrl::new(request.type_url);
        let stream = ctx.id();
        let sub = ctx.subscription(&type_url);

        if !sub.is_current(&request.response_nonce) {
            trace!(
                stream = %stream,
                type_url = %type_url,
                nonce = %request.response_nonce,
                "ignoring stale request"
            );
            return Ok(None);
        }

        if let Some(error) = request.error_detail {
            warn!(
                stream = %stream,
                type_url = %type_url,
                version = %request.version_info,
                nonce = %request.response_nonce,
                error = %error.message,
                "received NACK"
            );
        } else if !request.response_nonce.is_empty() {
            debug!(
                stream = %stream,
                type_url = %type_url,
                version = %request.version_info,
                "received ACK"
            );
        }

        // A reconnecting client already holds this version.
        if sub.sent_version.is_none() && !request.version_info.is_empty() {
            sub.sent_version = Some(request.version_info);
        }
        sub.names = request.resource_names;
        sub.open = true;

        let response = self.respond(node, &type_url, sub);
        if response.is_some() {
            ctx.record_response();
        }
        Ok(response)
    }

    /// Produce responses for every open subscription after a snapshot change.
    pub fn on_snapshot(&self, ctx: &mut StreamContext) -> Vec<DiscoveryResponse> {
        let Some(node) = ctx.node_hash() else {
            return Vec::new();
        };

        let mut responses = Vec::new();
        for type_url in ctx.open_types() {
            if let Some(response) = self.respond(node, &type_url, ctx.subscription(&type_url)) {
                responses.push(response);
            }
        }
        for _ in &responses {
            ctx.record_response();
        }
        responses
    }

    fn respond(
        &self,
        node: NodeHash,
        type_url: &TypeUrl,
        sub: &mut Subscription,
    ) -> Option<DiscoveryResponse> {
        let snapshot = self.cache.get_snapshot(node)?;
        let resources = snapshot.get_resources(type_url)?;

        if sub.sent_version.as_deref() == Some(resources.version()) {
            return None;
        }

        let selected: Vec<_> = if sub.names.is_empty() {
            resources.iter().map(|r| r.body().clone()).collect()
        } else {
            sub.names
                .iter()
                .filter_map(|name| resources.get(name))
                .map(|r| r.body().clone())
                .collect()
        };

        let nonce = generate_nonce();
        info!(
            node = %node,
            type_url = %type_url,
            version = %resources.version(),
            count = selected.len(),
            "sending discovery response"
        );

        sub.sent_version = Some(resources.version().to_string());
        sub.nonce = Some(nonce.clone());
        sub.open = false;

        Some(DiscoveryResponse {
            version_info: resources.version().to_string(),
            resources: selected,
            canary: false,
            type_url: type_url.to_string(),
            nonce,
            control_plane: Some(ControlPlane {
                identifier: CONTROL_PLANE_ID.to_string(),
            }),
        })
    }
}
