mod common;

use common::{serve_http, session_map, MockSession, TEST_TIMEOUT};
use portferry_forward::{ForwardError, Forwarder, TunnelState};
use portferry_proto::TunnelSpec;
use portferry_transport::Session;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const HTTP_RESPONSE: &[u8] = b"HTTP/1.0 204 No Content\r\n\r\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_session_skips_only_its_tunnel() {
    let (gw, far_rx) = MockSession::new("gw");
    serve_http(far_rx, HTTP_RESPONSE);
    let forwarder = Forwarder::new(session_map(&[gw]));

    let mut handle = forwarder.spawn(vec![
        TunnelSpec::forward("gw", "127.0.0.1:0", "10.0.0.5:80"),
        TunnelSpec::forward("bastion", "127.0.0.1:0", "10.0.0.6:80"),
        TunnelSpec::forward("gw", "127.0.0.1:0", "10.0.0.7:80"),
        TunnelSpec::reverse("gw", "0.0.0.0:2222", "127.0.0.1:22"),
    ]);

    assert_eq!(handle.skipped().len(), 1);
    let skipped = &handle.skipped()[0];
    assert_eq!(skipped.spec.session_name, "bastion");
    assert!(matches!(
        &skipped.error,
        ForwardError::UnknownSession { session, .. } if session == "bastion"
    ));

    assert_eq!(handle.tunnels().len(), 3);
    let mut addresses = Vec::new();
    for tunnel in handle.tunnels() {
        let address = tokio::time::timeout(TEST_TIMEOUT, tunnel.listening())
            .await
            .unwrap()
            .expect("tunnel should be listening");
        addresses.push(address);
    }

    // The forward tunnels actually carry traffic
    let mut client = TcpStream::connect(&addresses[0]).await.unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, HTTP_RESPONSE);

    handle.shutdown();
    let report = tokio::time::timeout(TEST_TIMEOUT, handle.wait())
        .await
        .expect("wait should return after shutdown");
    assert_eq!(report.dispatched, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.stopped, 3);
    assert_eq!(report.failed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_runner_does_not_affect_others() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap().to_string();

    let (gw, _far_rx) = MockSession::new("gw");
    let forwarder = Forwarder::new(session_map(&[gw]));
    let mut handle = forwarder.spawn(vec![
        TunnelSpec::forward("gw", taken, "10.0.0.5:80"),
        TunnelSpec::forward("gw", "127.0.0.1:0", "10.0.0.5:80"),
    ]);

    let failed = &handle.tunnels()[0];
    let healthy = &handle.tunnels()[1];
    assert!(tokio::time::timeout(TEST_TIMEOUT, failed.listening())
        .await
        .unwrap()
        .is_none());
    assert!(tokio::time::timeout(TEST_TIMEOUT, healthy.listening())
        .await
        .unwrap()
        .is_some());
    assert_eq!(failed.current_state(), TunnelState::Stopped);

    handle.shutdown();
    let report = tokio::time::timeout(TEST_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.stopped, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_returns_when_sessions_close() {
    let (gw, _far_rx) = MockSession::new("gw");
    let (edge, _edge_far_rx) = MockSession::new("edge");
    let forwarder = Forwarder::new(session_map(&[gw.clone(), edge.clone()]));

    let mut handle = forwarder.spawn(vec![
        TunnelSpec::reverse("gw", "0.0.0.0:2222", "127.0.0.1:22"),
        TunnelSpec::reverse("edge", "0.0.0.0:8080", "127.0.0.1:80"),
    ]);
    for tunnel in handle.tunnels() {
        tokio::time::timeout(TEST_TIMEOUT, tunnel.listening())
            .await
            .unwrap()
            .expect("tunnel should be listening");
    }

    // Losing the sessions ends every reverse listener
    forwarder.close_sessions().await;
    assert!(gw.is_closed());
    assert!(edge.is_closed());

    let report = tokio::time::timeout(TEST_TIMEOUT, handle.wait()).await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.failed, 2);
}

#[tokio::test]
async fn test_start_with_nothing_to_run() {
    let (gw, _far_rx) = MockSession::new("gw");
    let forwarder = Forwarder::new(session_map(&[gw]));

    let report = tokio::time::timeout(
        TEST_TIMEOUT,
        forwarder.start(vec![TunnelSpec::forward(
            "bastion",
            "127.0.0.1:0",
            "10.0.0.5:80",
        )]),
    )
    .await
    .unwrap();

    assert_eq!(report.dispatched, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(forwarder.sessions().len(), 1);
}
