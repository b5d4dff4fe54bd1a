use super::support::{
    eventually, loopback, spawn_dns, spawn_http_204, spawn_stun_tcp, spawn_stun_udp,
    StunBehavior, LOOPBACK,
};
use crate::connectivity::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use trust_dns_proto::op::{Message, MessageType, ResponseCode};
use trust_dns_proto::rr::RecordType;

fn counting_sink() -> (FailureSink, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let sink: FailureSink = Arc::new(move |_err| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (sink, calls)
}

#[tokio::test]
async fn test_stun_udp_reflects_local_address() {
    let (server, _) = spawn_stun_udp(StunBehavior::Reflect).await;
    let mut socket = UdpSocket::bind(LOOPBACK).await.unwrap();
    socket.connect(server).await.unwrap();
    let local = socket.local_addr().unwrap();

    let mapped = get_mapped_address(&mut socket, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(mapped, local);
}

#[tokio::test]
async fn test_stun_tcp_reflects_local_address() {
    let server = spawn_stun_tcp(StunBehavior::Reflect).await;
    let mut stream = TcpStream::connect(server).await.unwrap();
    let local = stream.local_addr().unwrap();

    let mapped = get_mapped_address(&mut stream, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(mapped, local);
}

#[tokio::test]
async fn test_stun_rejects_foreign_transaction() {
    let (server, _) = spawn_stun_udp(StunBehavior::WrongTransaction).await;
    let mut socket = UdpSocket::bind(LOOPBACK).await.unwrap();
    socket.connect(server).await.unwrap();

    let result = get_mapped_address(&mut socket, Duration::from_secs(2)).await;
    assert!(matches!(result, Err(MappingError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_stun_times_out() {
    let (server, seen) = spawn_stun_udp(StunBehavior::Silent).await;
    let mut socket = UdpSocket::bind(LOOPBACK).await.unwrap();
    socket.connect(server).await.unwrap();

    let result = get_mapped_address(&mut socket, Duration::from_millis(200)).await;
    assert!(matches!(result, Err(MappingError::Timeout)));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dns_query_encoding() {
    let probe = DnsProbe::new(loopback(), "223.5.5.5:53".parse().unwrap(), "baidu.com").unwrap();
    let bytes = probe.build_query(0x1234).unwrap();

    let decoded = Message::from_vec(&bytes).unwrap();
    assert_eq!(decoded.id(), 0x1234);
    assert_eq!(decoded.message_type(), MessageType::Query);
    assert!(decoded.recursion_desired());
    assert_eq!(decoded.queries().len(), 1);
    assert_eq!(decoded.queries()[0].query_type(), RecordType::A);
    assert_eq!(decoded.queries()[0].name().to_ascii().trim_end_matches('.'), "baidu.com");
}

#[test]
fn test_http_probe_requires_plain_http() {
    assert!(matches!(
        HttpProbe::new(loopback(), "https://example.com/", Duration::from_secs(1)),
        Err(MappingError::NotSupported)
    ));
    assert!(HttpProbe::new(loopback(), "http://example.com/generate_204", Duration::from_secs(1)).is_ok());
}

#[tokio::test]
async fn test_dns_probe_success_and_failure() {
    let scope = CancellationToken::new();

    let (ok_server, ok_seen) = spawn_dns(ResponseCode::NoError).await;
    let mut probe = KeepaliveProbe::Dns(DnsProbe::new(loopback(), ok_server, "example.com").unwrap());
    probe.probe(&scope).await.unwrap();
    assert_eq!(ok_seen.load(Ordering::SeqCst), 1);

    let (bad_server, _) = spawn_dns(ResponseCode::ServFail).await;
    let mut probe = KeepaliveProbe::Dns(DnsProbe::new(loopback(), bad_server, "example.com").unwrap());
    assert!(matches!(probe.probe(&scope).await, Err(MappingError::Probe(_))));
}

#[tokio::test]
async fn test_http_probe_reuses_connection() {
    let scope = CancellationToken::new();
    let (server, connections, requests) = spawn_http_204().await;
    let url = format!("http://{}/generate_204", server);
    let mut probe = KeepaliveProbe::Http(HttpProbe::new(loopback(), &url, Duration::from_secs(2)).unwrap());

    for _ in 0..3 {
        probe.probe(&scope).await.unwrap();
    }
    assert_eq!(requests.load(Ordering::SeqCst), 3);
    assert_eq!(connections.load(Ordering::SeqCst), 1, "Probes should share one connection");
}

#[tokio::test]
async fn test_keepalive_stops_on_cancel() {
    let (server, seen) = spawn_dns(ResponseCode::NoError).await;
    let probe = KeepaliveProbe::Dns(DnsProbe::new(loopback(), server, "example.com").unwrap());
    let timing = KeepaliveTiming {
        interval: Duration::from_millis(30),
        probe_timeout: Duration::from_secs(1),
    };
    let (sink, failures) = counting_sink();
    let scope = CancellationToken::new();

    let task = tokio::spawn(run_keepalive(scope.clone(), probe, timing, FailureOnce::new(sink)));
    assert!(eventually(Duration::from_secs(2), || seen.load(Ordering::SeqCst) >= 3).await);

    scope.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("keepalive should exit after cancel")
        .unwrap();

    let after_cancel = seen.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(seen.load(Ordering::SeqCst), after_cancel, "No probes after cancel");
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_keepalive_reports_failure_once_and_keeps_probing() {
    let (server, seen) = spawn_dns(ResponseCode::ServFail).await;
    let probe = KeepaliveProbe::Dns(DnsProbe::new(loopback(), server, "example.com").unwrap());
    let timing = KeepaliveTiming {
        interval: Duration::from_millis(20),
        probe_timeout: Duration::from_secs(1),
    };
    let (sink, failures) = counting_sink();
    let scope = CancellationToken::new();

    let task = tokio::spawn(run_keepalive(scope.clone(), probe, timing, FailureOnce::new(sink)));
    assert!(eventually(Duration::from_secs(2), || seen.load(Ordering::SeqCst) >= 4).await);
    scope.cancel();
    task.await.unwrap();

    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keepalive_probe_timeout_is_a_failure() {
    // A bound socket that never answers
    let silent = UdpSocket::bind(LOOPBACK).await.unwrap();
    let probe = KeepaliveProbe::Dns(
        DnsProbe::new(loopback(), silent.local_addr().unwrap(), "example.com").unwrap(),
    );
    let timing = KeepaliveTiming {
        interval: Duration::from_secs(60),
        probe_timeout: Duration::from_millis(100),
    };
    let (sink, failures) = counting_sink();
    let scope = CancellationToken::new();

    let task = tokio::spawn(run_keepalive(scope.clone(), probe, timing, FailureOnce::new(sink)));
    assert!(eventually(Duration::from_secs(2), || failures.load(Ordering::SeqCst) == 1).await);

    // Cancel interrupts the long interval wait
    scope.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("keepalive should exit during the interval wait")
        .unwrap();
}

#[tokio::test]
async fn test_keepalive_on_cancelled_scope_never_reports() {
    let (server, seen) = spawn_dns(ResponseCode::NoError).await;
    let timing = KeepaliveTiming {
        interval: Duration::from_millis(10),
        probe_timeout: Duration::from_secs(1),
    };
    let (sink, failures) = counting_sink();
    let scope = CancellationToken::new();
    scope.cancel();

    for _ in 0..50 {
        let probe = KeepaliveProbe::Dns(DnsProbe::new(loopback(), server, "example.com").unwrap());
        run_keepalive(scope.clone(), probe, timing, FailureOnce::new(sink.clone())).await;
    }

    assert_eq!(failures.load(Ordering::SeqCst), 0, "Shutdown must not look like a failure");
    assert_eq!(seen.load(Ordering::SeqCst), 0, "No probe after cancel");
}

#[tokio::test]
async fn test_reuse_dial_on_cancelled_scope_is_interrupted() {
    let scope = CancellationToken::new();
    scope.cancel();
    let (server, _) = spawn_dns(ResponseCode::NoError).await;

    for _ in 0..20 {
        let err = crate::connectivity::reuse::dial_udp(&scope, loopback(), server)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
    }
}
