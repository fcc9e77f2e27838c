mod common;

use common::*;
use portway_control::{ControlError, PortRange};
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_yields_distinct_ports() {
    let plane = plane(FakeEngine::new(), PortRange::new(10000, 10063).unwrap());
    register_node(&plane, NODE).await;

    let mut handles = Vec::new();
    for i in 0..64u16 {
        let routes = plane.routes.clone();
        handles.push(tokio::spawn(async move {
            routes.create(route_request(NODE, 9000 + i)).await
        }));
    }

    let mut ports = HashSet::new();
    for handle in handles {
        let route = handle.await.unwrap().unwrap();
        assert!((10000..=10063).contains(&route.remote_port));
        assert!(ports.insert(route.remote_port), "duplicate port {}", route.remote_port);
    }
    assert_eq!(ports.len(), 64);
}

#[tokio::test]
async fn test_exhausted_range_creates_nothing() {
    let plane = plane(FakeEngine::new(), PortRange::new(10000, 10002).unwrap());
    register_node(&plane, NODE).await;

    for i in 0..3 {
        plane.routes.create(route_request(NODE, 8000 + i)).await.unwrap();
    }

    let err = plane
        .routes
        .create(route_request(NODE, 8003))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControlError::PortRangeExhausted {
            start: 10000,
            end: 10002
        }
    ));
    assert_eq!(plane.routes.list().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_deleting_route_frees_its_port() {
    let plane = plane(FakeEngine::new(), PortRange::new(10000, 10000).unwrap());
    register_node(&plane, NODE).await;

    let route = plane.routes.create(route_request(NODE, 8000)).await.unwrap();
    assert!(plane.routes.create(route_request(NODE, 8001)).await.is_err());

    plane.routes.delete(route.id).await.unwrap();
    let again = plane.routes.create(route_request(NODE, 8001)).await.unwrap();
    assert_eq!(again.remote_port, 10000);
}

#[tokio::test]
async fn test_duplicate_local_endpoint_rejected() {
    let plane = plane(FakeEngine::new(), PortRange::default());
    register_node(&plane, NODE).await;
    register_node(&plane, "node_second_0001").await;

    plane.routes.create(route_request(NODE, 8080)).await.unwrap();
    assert!(matches!(
        plane.routes.create(route_request(NODE, 8080)).await,
        Err(ControlError::DuplicateLocalEndpoint { port: 8080, .. })
    ));
    // Same local endpoint on another node is fine
    assert!(plane
        .routes
        .create(route_request("node_second_0001", 8080))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_requested_remote_port() {
    let plane = plane(FakeEngine::new(), PortRange::default());
    register_node(&plane, NODE).await;

    let mut request = route_request(NODE, 8080);
    request.remote_port = Some(15000);
    let route = plane.routes.create(request).await.unwrap();
    assert_eq!(route.remote_port, 15000);

    let mut clash = route_request(NODE, 8081);
    clash.remote_port = Some(15000);
    assert!(matches!(
        plane.routes.create(clash).await,
        Err(ControlError::PortInUse(15000))
    ));
}

#[tokio::test]
async fn test_route_for_unknown_node() {
    let plane = plane(FakeEngine::new(), PortRange::default());
    assert!(matches!(
        plane.routes.create(route_request("node_nobody_000", 8080)).await,
        Err(ControlError::NodeNotFound(_))
    ));
}
