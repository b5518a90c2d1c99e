//! Scenarios against a real Envoy proxy.
//!
//! These tests launch Envoy processes and are ignored by default.

use std::time::Duration;

use envoye2e::stats::StatsFormat;
use envoye2e::{
    init_tracing, DriverConfig, Error, ExactStat, Fork, Get, JsonStat, MissingStat, Repeat,
    Scenario, Sleep, Stats, TcpConnection, TcpServer, Update, Xds, BACKEND_BODY,
};

use crate::harness::{self, CLIENT_LISTENER, ECHO_CLUSTER, SERVER_CLUSTER, TCP_LISTENER};

/// Traffic flows client proxy -> server proxy -> backend.
#[tokio::test]
#[ignore = "requires Envoy binary"]
async fn test_basic_flow() {
    init_tracing();
    let mut params = harness::params(0);

    harness::basic_flow()
        .step(Repeat::times(10, Get::get("/").expect_body(BACKEND_BODY)))
        .execute(&mut params)
        .await
        .expect("basic flow failed");
}

/// Request counters show up in the JSON admin stats.
#[tokio::test]
#[ignore = "requires Envoy binary"]
async fn test_request_counter() {
    init_tracing();
    let mut params = harness::params(1);

    harness::basic_flow()
        .step(Repeat::times(5, Get::get("/")))
        .step(
            Stats::new()
                .format(StatsFormat::Json)
                .matcher("cluster.server.upstream_rq_total", JsonStat::new(5))
                .matcher("cluster.server.upstream_rq_5xx", MissingStat),
        )
        .execute(&mut params)
        .await
        .expect("stats did not match");
}

/// An absent metric satisfies `MissingStat` and never satisfies `ExactStat`.
#[tokio::test]
#[ignore = "requires Envoy binary"]
async fn test_missing_versus_exact() {
    init_tracing();
    let mut params = harness::params(2).with_vars([("Requests", "1")]);

    harness::basic_flow()
        .step(Get::get("/"))
        .step(Stats::new().matcher("envoy_never_reported", MissingStat))
        .execute(&mut params)
        .await
        .expect("missing stat should pass");

    let err = harness::basic_flow()
        .step(Get::get("/"))
        .step(Stats::new().matcher("envoy_never_reported", ExactStat::new("stats/upstream_rq.yaml.tmpl")))
        .execute(&mut params)
        .await
        .expect_err("exact stat should time out");
    assert!(matches!(err, Error::Timeout { .. }), "{err}");
}

/// Rolling listener updates in the background do not break traffic.
#[tokio::test]
#[ignore = "requires Envoy binary"]
async fn test_rolling_updates() {
    init_tracing();
    if DriverConfig::global().skip_if_sanitized("update timing is unreliable under sanitizers") {
        return;
    }
    let mut params = harness::params(3);

    let updates = Repeat::lasting(
        Duration::from_secs(3),
        Scenario::new()
            .step(
                Update::new("client", "{{ n }}")
                    .listener(CLIENT_LISTENER)
                    .cluster(SERVER_CLUSTER),
            )
            .step(Sleep(Duration::from_millis(500))),
    );
    let traffic = Repeat::lasting(
        Duration::from_secs(3),
        Scenario::new()
            .step(Get::get("/").expect_body(BACKEND_BODY))
            .step(Sleep(Duration::from_millis(100))),
    );

    harness::basic_flow()
        .step(Fork::new(traffic, updates))
        .execute(&mut params)
        .await
        .expect("traffic failed during updates");
}

/// Lines sent through the TCP proxy come back prefixed by the echo backend.
#[tokio::test]
#[ignore = "requires Envoy binary"]
async fn test_tcp_proxy() {
    init_tracing();
    let mut params = harness::params(4);

    Scenario::new()
        .step(Xds::new())
        .step(TcpServer::new())
        .step(Update::new("client", "0").listener(TCP_LISTENER).cluster(ECHO_CLUSTER))
        .step(envoye2e::Envoy::client())
        .step(Repeat::times(3, TcpConnection::new("ping {{ n }}")))
        .execute(&mut params)
        .await
        .expect("tcp proxy failed");
}
