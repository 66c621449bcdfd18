//! Local TCP stubs for tests that need a network peer

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Handler mapping a request line to (status, body)
pub type Route = dyn Fn(&str) -> (u16, String) + Send + Sync;

/// Serve HTTP/1.1 on a local port, answering from `route`.
///
/// Works both as an origin server (`GET /path`) and as a forward proxy
/// (`GET http://host/path`). Returns the bound address and a request counter.
pub async fn spawn_http_stub<F>(route: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let route: Arc<Route> = Arc::new(route);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let route = Arc::clone(&route);
            tokio::spawn(async move {
                serve_one(socket, &counter, route.as_ref()).await;
            });
        }
    });

    (addr, hits)
}

async fn serve_one(mut socket: TcpStream, counter: &AtomicUsize, route: &Route) {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    counter.fetch_add(1, Ordering::SeqCst);

    let request = String::from_utf8_lossy(&request);
    let request_line = request.lines().next().unwrap_or_default();
    let (status, body) = route(request_line);
    let reason = if status == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Accept connections and never answer. Returns the address and an accept counter.
pub async fn spawn_black_hole() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    (addr, accepted)
}

/// Address nothing listens on
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Forward proxy answering 200 for request lines containing `/ok`, 503 otherwise
pub async fn spawn_forward_proxy() -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_http_stub(|line| {
        if line.contains("/ok") {
            (200, "ok".to_string())
        } else {
            (503, String::new())
        }
    })
    .await
}
