// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Endpoint discovery crawl tests.
//!
//! ```bash
//! cargo test -p trap-opcua-client --test discovery
//! ```

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{MockDiscovery, MockDiscoveryServer};
use trap_opcua_client::config::DiscoveryConfig;
use trap_opcua_client::discovery::{ApplicationType, EndpointDiscoverer};

fn discoverer(network: &Arc<MockDiscovery>) -> EndpointDiscoverer {
    EndpointDiscoverer::new(network.clone(), DiscoveryConfig::default())
}

fn urls(found: &std::collections::HashSet<trap_opcua_client::DiscoveredEndpoint>) -> Vec<String> {
    let mut urls: Vec<String> = found
        .iter()
        .map(|e| e.description.endpoint_url.clone())
        .collect();
    urls.sort();
    urls
}

#[tokio::test]
async fn test_single_server() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://plc1:4840",
        MockDiscoveryServer::new().with_endpoint("opc.tcp://plc1:4840", ApplicationType::Server),
    );
    let discoverer = discoverer(&network);

    let found = discoverer
        .find_endpoints("opc.tcp://PLC1", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(urls(&found), vec!["opc.tcp://plc1:4840"]);
    assert_eq!(discoverer.stats().hops_attempted(), 1);
    assert_eq!(discoverer.stats().endpoints_found(), 1);
}

#[tokio::test]
async fn test_cycle_terminates() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://lds-a:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://server-a:4840", ApplicationType::Server)
            .with_discovery_url("opc.tcp://LDS-B:4840/"),
    );
    network.add(
        "opc.tcp://lds-b:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://server-b:4840", ApplicationType::Server)
            .with_discovery_url("opc.tcp://lds-a.:4840"),
    );
    let discoverer = discoverer(&network);

    let found = discoverer
        .find_endpoints("opc.tcp://lds-a:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        urls(&found),
        vec!["opc.tcp://server-a:4840", "opc.tcp://server-b:4840"]
    );
    assert_eq!(network.opens("opc.tcp://lds-a:4840"), 1);
    assert_eq!(network.opens("opc.tcp://lds-b:4840"), 1);
    assert_eq!(discoverer.stats().hops_attempted(), 2);
}

#[tokio::test]
async fn test_discovery_servers_skipped() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://lds:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://lds:4840", ApplicationType::DiscoveryServer)
            .with_endpoint("opc.tcp://plc:4840", ApplicationType::ClientAndServer),
    );

    let found = discoverer(&network)
        .find_endpoints("opc.tcp://lds:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(urls(&found), vec!["opc.tcp://plc:4840"]);
}

#[tokio::test]
async fn test_network_servers_carry_capabilities() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://lds-me:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://lds-me:4840", ApplicationType::Server)
            .with_network_server("opc.tcp://10.0.0.7", &["DA", "HD"]),
    );
    network.add(
        "opc.tcp://10.0.0.7:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://plc7.internal:4840/ua", ApplicationType::Server),
    );

    let found = discoverer(&network)
        .find_endpoints("opc.tcp://lds-me:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    let plc7 = found
        .iter()
        .find(|e| e.description.endpoint_url == "opc.tcp://plc7.internal:4840/ua")
        .expect("plc7 endpoint");
    assert_eq!(plc7.accessible_endpoint_url, "opc.tcp://10.0.0.7:4840/ua");
    assert!(plc7.capabilities.contains("DA"));
    assert!(plc7.capabilities.contains("HD"));

    let lds = found
        .iter()
        .find(|e| e.description.endpoint_url == "opc.tcp://lds-me:4840")
        .expect("lds endpoint");
    assert!(lds.capabilities.is_empty());
}

#[tokio::test]
async fn test_find_servers_on_network_failure_swallowed() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://legacy:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://legacy:4840", ApplicationType::Server)
            .with_discovery_url("opc.tcp://next:4840")
            .without_network_support(),
    );
    network.add(
        "opc.tcp://next:4840",
        MockDiscoveryServer::new().with_endpoint("opc.tcp://next:4840", ApplicationType::Server),
    );
    let discoverer = discoverer(&network);

    let found = discoverer
        .find_endpoints("opc.tcp://legacy:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(discoverer.stats().find_servers_on_network_failures(), 1);
}

#[tokio::test]
async fn test_empty_endpoints_end_hop() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://empty:4840",
        MockDiscoveryServer::new().with_discovery_url("opc.tcp://never:4840"),
    );

    let found = discoverer(&network)
        .find_endpoints("opc.tcp://empty:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert!(found.is_empty());
    assert_eq!(network.opens("opc.tcp://never:4840"), 0);
}

#[tokio::test]
async fn test_hop_retried_without_backoff() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://flaky:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://flaky:4840", ApplicationType::Server)
            .failing(2),
    );

    let found = discoverer(&network)
        .find_endpoints("opc.tcp://flaky:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(network.opens("opc.tcp://flaky:4840"), 3);
}

#[tokio::test]
async fn test_failed_branch_abandoned() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://root:4840",
        MockDiscoveryServer::new()
            .with_endpoint("opc.tcp://root:4840", ApplicationType::Server)
            .with_discovery_url("opc.tcp://dead:4840")
            .with_discovery_url("opc.tcp://alive:4840"),
    );
    network.add(
        "opc.tcp://alive:4840",
        MockDiscoveryServer::new().with_endpoint("opc.tcp://alive:4840", ApplicationType::Server),
    );
    let discoverer = discoverer(&network);

    let found = discoverer
        .find_endpoints("opc.tcp://root:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(urls(&found), vec!["opc.tcp://alive:4840", "opc.tcp://root:4840"]);
    assert_eq!(network.opens("opc.tcp://dead:4840"), 3);
    assert_eq!(discoverer.stats().hops_failed(), 1);
}

#[tokio::test]
async fn test_total_failure_yields_empty_set() {
    let network = MockDiscovery::new();

    let found = discoverer(&network)
        .find_endpoints("opc.tcp://nowhere:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert!(found.is_empty());
}

#[tokio::test]
async fn test_invalid_start_url() {
    let network = MockDiscovery::new();

    let result = discoverer(&network)
        .find_endpoints("definitely not a url", &[], &CancellationToken::new())
        .await;

    assert!(result.is_err());
    assert_eq!(network.total_opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hop_timeout() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://slow:4840",
        MockDiscoveryServer::new().with_endpoint("opc.tcp://slow:4840", ApplicationType::Server),
    );
    *network.delay.lock().unwrap() = Some(Duration::from_secs(60));

    let discoverer = EndpointDiscoverer::new(
        network.clone(),
        DiscoveryConfig {
            hop_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let found = discoverer
        .find_endpoints("opc.tcp://slow:4840", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert!(found.is_empty());
    assert_eq!(network.opens("opc.tcp://slow:4840"), 3);
    assert_eq!(discoverer.stats().hops_failed(), 1);
}

#[tokio::test]
async fn test_cancelled_crawl() {
    let network = MockDiscovery::new();
    network.add(
        "opc.tcp://plc1:4840",
        MockDiscoveryServer::new().with_endpoint("opc.tcp://plc1:4840", ApplicationType::Server),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = discoverer(&network)
        .find_endpoints("opc.tcp://plc1:4840", &[], &cancel)
        .await
        .unwrap_err();

    assert!(error.is_cancelled());
    assert_eq!(network.total_opens(), 0);
}
