//! Shared resources for the end-to-end scenarios.
//!
//! Provides:
//! - listener and cluster templates wiring client proxy to server proxy to
//!   backend
//! - a TCP proxy listener for the echo backend
//! - the basic HTTP flow every scenario starts from

use envoye2e::{Backend, Envoy, Params, Scenario, Update, Xds};
use tracing::info;

/// Client-side listener on `ports.client`, routing everything to the
/// `server` cluster.
pub const CLIENT_LISTENER: &str = r#"
name: client
address:
  socket_address:
    address: 127.0.0.1
    port_value: {{ ports.client }}
filter_chains:
- filters:
  - name: http
    typed_config:
      "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
      codec_type: AUTO
      stat_prefix: client
      route_config:
        name: client
        virtual_hosts:
        - name: client
          domains: ["*"]
          routes:
          - match: { prefix: / }
            route:
              cluster: server
              timeout: 0s
      http_filters:
      - name: envoy.filters.http.router
        typed_config:
          "@type": type.googleapis.com/envoy.extensions.filters.http.router.v3.Router
"#;

/// Cluster on the client node pointing at the server proxy.
pub const SERVER_CLUSTER: &str = r#"
name: server
connect_timeout: 1s
type: STATIC
load_assignment:
  cluster_name: server
  endpoints:
  - lb_endpoints:
    - endpoint:
        address:
          socket_address:
            address: 127.0.0.1
            port_value: {{ ports.server }}
"#;

/// Server-side listener on `ports.server`, routing to the `inbound`
/// cluster.
pub const SERVER_LISTENER: &str = r#"
name: server
address:
  socket_address:
    address: 127.0.0.1
    port_value: {{ ports.server }}
filter_chains:
- filters:
  - name: http
    typed_config:
      "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
      codec_type: AUTO
      stat_prefix: server
      route_config:
        name: server
        virtual_hosts:
        - name: server
          domains: ["*"]
          routes:
          - match: { prefix: / }
            route:
              cluster: inbound
              timeout: 0s
      http_filters:
      - name: envoy.filters.http.router
        typed_config:
          "@type": type.googleapis.com/envoy.extensions.filters.http.router.v3.Router
"#;

/// Cluster on the server node pointing at the HTTP backend.
pub const INBOUND_CLUSTER: &str = r#"
name: inbound
connect_timeout: 1s
type: STATIC
load_assignment:
  cluster_name: inbound
  endpoints:
  - lb_endpoints:
    - endpoint:
        address:
          socket_address:
            address: 127.0.0.1
            port_value: {{ ports.backend }}
"#;

/// TCP proxy on `ports.client` in front of the echo backend.
pub const TCP_LISTENER: &str = r#"
name: tcp
address:
  socket_address:
    address: 127.0.0.1
    port_value: {{ ports.client }}
filter_chains:
- filters:
  - name: tcp
    typed_config:
      "@type": type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy
      stat_prefix: tcp
      cluster: echo
"#;

/// Cluster pointing at the TCP echo backend.
pub const ECHO_CLUSTER: &str = r#"
name: echo
connect_timeout: 1s
type: STATIC
load_assignment:
  cluster_name: echo
  endpoints:
  - lb_endpoints:
    - endpoint:
        address:
          socket_address:
            address: 127.0.0.1
            port_value: {{ ports.tcp_backend }}
"#;

/// Params for scenario `index`, logging the allocated ports.
pub fn params(index: u16) -> Params {
    let params = Params::new(index);
    info!(index, xds = params.ports.xds, client = params.ports.client, "allocated ports");
    params
}

/// Control plane, backend and both proxies wired together.
///
/// Further steps appended to the returned scenario run with traffic able
/// to flow from `ports.client` to the backend.
pub fn basic_flow() -> Scenario {
    Scenario::new()
        .step(Xds::new())
        .step(Backend::new())
        .step(
            Update::new("client", "0")
                .listener(CLIENT_LISTENER)
                .cluster(SERVER_CLUSTER),
        )
        .step(
            Update::new("server", "0")
                .listener(SERVER_LISTENER)
                .cluster(INBOUND_CLUSTER),
        )
        .step(Envoy::client())
        .step(Envoy::server())
}
