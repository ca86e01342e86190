use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Delay between two readiness attempts
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether something accepts TCP connections on `127.0.0.1:port`
pub async fn port_accepts(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(READY_POLL_INTERVAL, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Poll `port` until it accepts a connection
///
/// Never returns otherwise; callers bound it with a timeout or race it
/// against the child's exit.
pub async fn wait_until_ready(port: u16) {
    loop {
        if port_accepts(port).await {
            return;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
