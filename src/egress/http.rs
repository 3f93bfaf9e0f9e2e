//! HTTP CONNECT tunnel client
//!
//! Opens a TCP tunnel to a destination through an HTTP/HTTPS proxy using the
//! CONNECT method (RFC 7231 §4.3.6), with optional Basic credentials
//! (RFC 7617). After a 200 response the socket is an opaque byte stream to
//! the destination; chunked or keep-alive semantics do not apply.

use super::candidate::ProxyAuth;
use crate::common::DialError;
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Build the exact CONNECT request for `host:port`
pub fn build_connect_request(host: &str, port: u16, auth: Option<&ProxyAuth>) -> String {
    let mut request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
        host, port, host, port
    );

    if let Some(auth) = auth {
        let credentials = format!("{}:{}", auth.username, auth.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }

    request.push_str("\r\n");
    request
}

/// Find end of HTTP headers (double CRLF)
fn find_header_end(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(3) {
        if &data[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    None
}

/// Parse the status code out of an HTTP/1.x status line
fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Perform the CONNECT handshake on an already-open proxy socket.
///
/// On success the socket is in pass-through mode. A non-200 status or a
/// malformed response is `ProxyRejected`; socket errors surface as `Io`.
pub async fn establish<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<&ProxyAuth>,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_connect_request(host, port, auth);

    timeout(write_timeout, stream.write_all(request.as_bytes()))
        .await
        .map_err(|_| DialError::Timeout("CONNECT write"))??;

    let mut response = [0u8; 1024];
    let mut total_read = 0;

    loop {
        let n = timeout(read_timeout, stream.read(&mut response[total_read..]))
            .await
            .map_err(|_| DialError::Timeout("CONNECT response"))??;

        if n == 0 {
            return Err(DialError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during CONNECT",
            )));
        }

        total_read += n;

        if let Some(header_end) = find_header_end(&response[..total_read]) {
            let head = String::from_utf8_lossy(&response[..header_end]);
            let status_line = head.lines().next().unwrap_or("");
            debug!("CONNECT {}:{} -> {}", host, port, status_line);

            return match parse_status_code(status_line) {
                Some(200) => Ok(()),
                Some(code) => Err(DialError::rejected(Some(code))),
                None => Err(DialError::rejected(None)),
            };
        }

        if total_read >= response.len() {
            return Err(DialError::rejected(None));
        }
    }
}
