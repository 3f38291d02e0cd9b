//! Physical WebSocket connections.
//!
//! Two flavours of the same connection:
//! - [`connect`]: async `tokio-tungstenite` stream for the cooperative
//!   strategies.
//! - [`connect_blocking`]: blocking `tungstenite` socket for the
//!   thread-per-socket strategy. Its read timeout is a stop-flag polling
//!   interval, not a message deadline; [`is_read_timeout`] tells the two
//!   apart.
//!
//! Both bound connect plus upgrade by `connect_timeout`. There is no
//! reconnection: a failed connect is reported to the caller once.

use std::io;
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::HandshakeError;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{self, stream::MaybeTlsStream as SyncMaybeTls, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wslat_core::error::FeedError;

/// A connected async WebSocket connection.
pub type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Sink half of a [`FeedSocket`], used to send messages.
pub type WsSink = SplitSink<FeedSocket, Message>;

/// Stream half of a [`FeedSocket`], used to receive messages.
pub type WsStream = SplitStream<FeedSocket>;

/// A connected blocking WebSocket socket.
pub type BlockingSocket = tungstenite::WebSocket<SyncMaybeTls<StdTcpStream>>;

/// Open an async connection to `url`.
pub async fn connect(url: &str, connect_timeout: Duration) -> Result<FeedSocket, FeedError> {
    tracing::debug!(url = %url, "connecting to feed");

    let (stream, _response) =
        tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| {
                FeedError::Connection(format!("connect to {url} timed out after {connect_timeout:?}"))
            })?
            .map_err(|e| FeedError::Connection(format!("failed to connect to {url}: {e}")))?;

    if let MaybeTlsStream::Plain(tcp) = stream.get_ref() {
        let _ = tcp.set_nodelay(true);
    }

    tracing::debug!(url = %url, "connected to feed");
    Ok(stream)
}

/// Open a blocking connection to `url`.
///
/// `poll_interval` becomes the socket read timeout once the upgrade has
/// completed, so the owning thread wakes up periodically to check its stop
/// flag.
pub fn connect_blocking(
    url: &str,
    connect_timeout: Duration,
    poll_interval: Duration,
) -> Result<BlockingSocket, FeedError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| FeedError::Connection(format!("invalid url {url}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| FeedError::Connection(format!("url {url} has no host")))?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("wss") => 443,
        _ => 80,
    });

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| FeedError::Connection(format!("failed to resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| FeedError::Connection(format!("{host}:{port} resolved to no address")))?;

    tracing::debug!(url = %url, addr = %addr, "connecting to feed");

    let tcp = StdTcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| FeedError::Connection(format!("failed to connect to {addr}: {e}")))?;
    tcp.set_nodelay(true).map_err(io_error)?;
    // Bound the upgrade handshake by the connect timeout.
    tcp.set_read_timeout(Some(connect_timeout)).map_err(io_error)?;

    let (socket, _response) = tungstenite::client_tls(url, tcp).map_err(|e| match e {
        HandshakeError::Interrupted(_) => {
            FeedError::Connection(format!("handshake with {url} timed out"))
        }
        HandshakeError::Failure(e) => {
            FeedError::Connection(format!("handshake with {url} failed: {e}"))
        }
    })?;

    set_read_timeout(&socket, Some(poll_interval)).map_err(io_error)?;

    tracing::debug!(url = %url, "connected to feed");
    Ok(socket)
}

/// Whether a blocking read failed only because the poll interval elapsed.
pub fn is_read_timeout(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

fn set_read_timeout(socket: &BlockingSocket, timeout: Option<Duration>) -> io::Result<()> {
    match socket.get_ref() {
        SyncMaybeTls::Plain(tcp) => tcp.set_read_timeout(timeout),
        SyncMaybeTls::NativeTls(tls) => tls.get_ref().set_read_timeout(timeout),
        _ => Ok(()),
    }
}

fn io_error(e: io::Error) -> FeedError {
    FeedError::Connection(format!("socket setup failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_timeout_detection() {
        let would_block = tungstenite::Error::Io(io::Error::from(io::ErrorKind::WouldBlock));
        let timed_out = tungstenite::Error::Io(io::Error::from(io::ErrorKind::TimedOut));
        let reset = tungstenite::Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(is_read_timeout(&would_block));
        assert!(is_read_timeout(&timed_out));
        assert!(!is_read_timeout(&reset));
        assert!(!is_read_timeout(&tungstenite::Error::ConnectionClosed));
    }

    #[test]
    fn test_blocking_connect_rejects_bad_url() {
        let err = connect_blocking("not a url", Duration::from_millis(100), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, FeedError::Connection(_)));
    }

    #[test]
    fn test_blocking_connect_refused() {
        // Bind then drop a listener to obtain a local port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("ws://127.0.0.1:{port}/ws");
        let err = connect_blocking(&url, Duration::from_millis(500), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, FeedError::Connection(_)));
    }

    #[tokio::test]
    async fn test_async_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("ws://127.0.0.1:{port}/ws");
        let err = connect(&url, Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, FeedError::Connection(_)));
    }
}
