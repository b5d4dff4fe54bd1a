// Loopback fakes shared by the tests: STUN and DNS servers, mock routers,
// echo targets

use crate::connectivity::{
    MappingError, PortMappingRequest, RouterClient, RouterDiscovery, RouterKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stun::agent::TransactionId;
use stun::message::{Message, BINDING_REQUEST, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use trust_dns_proto::op::{Message as DnsMessage, MessageType, OpCode, ResponseCode};
use trust_dns_proto::serialize::binary::BinEncodable;

pub const LOOPBACK: &str = "127.0.0.1:0";

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Poll `cond` every 10ms until it holds or `within` elapses
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// STUN

#[derive(Clone, Copy, PartialEq)]
pub enum StunBehavior {
    /// Answer with the sender's address
    Reflect,
    /// Answer with a different transaction id
    WrongTransaction,
    /// Never answer
    Silent,
}

fn stun_response(request: &[u8], peer: SocketAddr, behavior: StunBehavior) -> Option<Vec<u8>> {
    let mut req = Message::new();
    req.raw = request.to_vec();
    req.decode().ok()?;
    if req.typ != BINDING_REQUEST {
        return None;
    }

    let transaction = match behavior {
        StunBehavior::Reflect => req.transaction_id,
        StunBehavior::WrongTransaction => TransactionId::new(),
        StunBehavior::Silent => return None,
    };
    let mut resp = Message::new();
    resp.build(&[
        Box::new(transaction),
        Box::new(BINDING_SUCCESS),
        Box::new(XorMappedAddress {
            ip: peer.ip(),
            port: peer.port(),
        }),
    ])
    .ok()?;
    Some(resp.raw)
}

/// STUN server over UDP; returns its address and the number of requests seen
pub async fn spawn_stun_udp(behavior: StunBehavior) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind(LOOPBACK).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(resp) = stun_response(&buf[..n], peer, behavior) {
                let _ = socket.send_to(&resp, peer).await;
            }
        }
    });
    (addr, seen)
}

/// STUN server over TCP, one request per connection
pub async fn spawn_stun_tcp(behavior: StunBehavior) -> SocketAddr {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, peer)) = listener.accept().await {
            tokio::spawn(async move {
                let mut header = [0u8; 20];
                if stream.read_exact(&mut header).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes([header[2], header[3]]) as usize;
                let mut raw = header.to_vec();
                raw.resize(20 + len, 0);
                if stream.read_exact(&mut raw[20..]).await.is_err() {
                    return;
                }
                match stun_response(&raw, peer, behavior) {
                    Some(resp) => {
                        let _ = stream.write_all(&resp).await;
                        // Keep the stream open until the client is done
                        let mut rest = Vec::new();
                        let _ = stream.read_to_end(&mut rest).await;
                    }
                    None => {
                        let mut rest = Vec::new();
                        let _ = stream.read_to_end(&mut rest).await;
                    }
                }
            });
        }
    });
    addr
}

// DNS

/// DNS server answering every query with `code`; counts queries
pub async fn spawn_dns(code: ResponseCode) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind(LOOPBACK).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let Ok(query) = DnsMessage::from_vec(&buf[..n]) else {
                continue;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut response = DnsMessage::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_response_code(code)
                .add_queries(query.queries().to_vec());
            if let Ok(bytes) = response.to_bytes() {
                let _ = socket.send_to(&bytes, peer).await;
            }
        }
    });
    (addr, seen)
}

// HTTP

/// HTTP/1.1 server answering 204; counts accepted connections and requests
pub async fn spawn_http_204() -> (SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let (conn_count, req_count) = (connections.clone(), requests.clone());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            conn_count.fetch_add(1, Ordering::SeqCst);
            let req_count = req_count.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    req_count.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let mut resp = Response::new(Full::new(Bytes::new()));
                        *resp.status_mut() = StatusCode::NO_CONTENT;
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr, connections, requests)
}

// Echo targets

pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rx, mut tx) = stream.split();
                let _ = tokio::io::copy(&mut rx, &mut tx).await;
            });
        }
    });
    addr
}

/// TCP target that signals once its accepted connection reads EOF
pub async fn spawn_tcp_eof_watcher() -> (SocketAddr, tokio::sync::mpsc::Receiver<()>) {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = stream.write_all(&buf[..n]).await;
                        }
                    }
                }
                let _ = tx.send(()).await;
            });
        }
    });
    (addr, rx)
}

/// An address nothing listens on
pub async fn closed_tcp_addr() -> SocketAddr {
    let listener = TcpListener::bind(LOOPBACK).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

// Routers

pub struct MockClient {
    pub kind: RouterKind,
    pub fail: bool,
    pub requests: Mutex<Vec<PortMappingRequest>>,
}

impl MockClient {
    pub fn new(kind: RouterKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(kind: RouterKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RouterClient for MockClient {
    fn kind(&self) -> RouterKind {
        self.kind
    }

    async fn add_port_mapping(&self, request: &PortMappingRequest) -> Result<(), MappingError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(MappingError::GatewayError("ConflictInMappingEntry".to_string()));
        }
        Ok(())
    }
}

pub enum MockDiscovery {
    Found(RouterKind, Vec<Arc<MockClient>>),
    Broken(RouterKind),
}

impl MockDiscovery {
    pub fn empty(kind: RouterKind) -> Box<dyn RouterDiscovery> {
        Box::new(MockDiscovery::Found(kind, Vec::new()))
    }

    pub fn with(client: &Arc<MockClient>) -> Box<dyn RouterDiscovery> {
        Box::new(MockDiscovery::Found(client.kind, vec![client.clone()]))
    }

    pub fn group(kind: RouterKind, clients: Vec<Arc<MockClient>>) -> Box<dyn RouterDiscovery> {
        Box::new(MockDiscovery::Found(kind, clients))
    }

    pub fn broken(kind: RouterKind) -> Box<dyn RouterDiscovery> {
        Box::new(MockDiscovery::Broken(kind))
    }
}

#[async_trait]
impl RouterDiscovery for MockDiscovery {
    fn kind(&self) -> RouterKind {
        match self {
            MockDiscovery::Found(kind, _) | MockDiscovery::Broken(kind) => *kind,
        }
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn RouterClient>>, MappingError> {
        match self {
            MockDiscovery::Found(_, clients) => Ok(clients
                .iter()
                .map(|c| c.clone() as Arc<dyn RouterClient>)
                .collect()),
            MockDiscovery::Broken(_) => Err(MappingError::NoGateway),
        }
    }
}
