//! Test harness for the proxy integration tests.
//!
//! Provides echo/recording backends on both networks, a parked listener
//! for fleets driven entirely through the API, and small wait helpers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ezproxy_proxyd::{ConnectionAdder, ProxyContainer, ProxyListener, ProxySpawner};
use ezproxy_scope::CancelScope;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::sleep;

/// A TCP server that echoes every byte back.
#[allow(dead_code)]
pub struct TcpEchoServer {
    pub addr: SocketAddr,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bytes_received = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let bytes_clone = Arc::clone(&bytes_received);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        let bytes = Arc::clone(&bytes_clone);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            loop {
                                match stream.read(&mut buf).await {
                                    Ok(0) => break,
                                    Ok(n) => {
                                        bytes.fetch_add(n as u64, Ordering::Relaxed);
                                        if stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for TcpEchoServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A TCP server that records what it receives and sends nothing back.
#[allow(dead_code)]
pub struct TcpRecordingServer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpRecordingServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let received_clone = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { break };
                        let sink = Arc::clone(&received_clone);
                        tokio::spawn(async move {
                            let mut buf = vec![0u8; 8192];
                            while let Ok(n) = stream.read(&mut buf).await {
                                if n == 0 {
                                    break;
                                }
                                sink.lock().unwrap().extend_from_slice(&buf[..n]);
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TcpRecordingServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A UDP server that echoes every datagram back to its sender.
#[allow(dead_code)]
pub struct UdpEchoServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl UdpEchoServer {
    pub async fn spawn() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        let Ok((n, from)) = recv else { break };
                        let _ = socket.send_to(&buf[..n], from).await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for UdpEchoServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A listener that accepts nothing and waits for its scope; for fleets
/// whose sessions are registered through the API or the mpx registry.
#[allow(dead_code)]
pub struct ParkedListener;

#[async_trait]
impl ProxyListener for ParkedListener {
    async fn run(&self, scope: CancelScope, _adder: Arc<dyn ConnectionAdder>) {
        scope.cancelled().await;
    }
}

/// Grab a free TCP port on localhost.
#[allow(dead_code)]
pub fn free_tcp_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Grab a free UDP port on localhost.
#[allow(dead_code)]
pub fn free_udp_addr() -> SocketAddr {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Connect to a listener that may still be binding.
#[allow(dead_code)]
pub async fn connect_with_retries(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr}");
}

/// Poll until `cond` holds, or fail the test.
#[allow(dead_code)]
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Wait for the fleet's first session to appear.
#[allow(dead_code)]
pub async fn wait_for_session(spawner: &ProxySpawner) -> Arc<ProxyContainer> {
    for _ in 0..400 {
        if let Some(pc) = spawner.get_all_proxies().into_iter().next() {
            return pc;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("no session appeared in time");
}
