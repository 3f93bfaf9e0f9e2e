//! Inbound session handling
//!
//! After TLS the client sends a fixed preamble: the SHA-256 digest of the
//! shared password (32 bytes), one command byte, and the destination in
//! SOCKS5 address encoding. The server answers a single status byte, then
//! the session becomes either a spliced TCP tunnel or a length-prefixed
//! UDP-over-TCP relay.

use crate::common::net::{read_u16_be, write_u16_be, Address};
use crate::common::{DialError, Error, Result};
use crate::egress::{Dialer, EgressDialer};
use crate::padding::{PaddingFactory, ShapedStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// Tunnel a TCP stream to the destination
pub const CMD_TCP: u8 = 0x01;
/// Relay length-prefixed datagrams to the destination
pub const CMD_UOT: u8 = 0x03;

const ACK_OK: u8 = 0x00;
const MAX_DATAGRAM: usize = 65535;

/// Shared per-session dependencies
pub struct SessionContext {
    pub password_digest: [u8; 32],
    pub dialer: Arc<dyn Dialer>,
    /// Present when an egress pool is configured; carries the UDP entry point
    pub egress: Option<Arc<EgressDialer>>,
    pub padding: Arc<PaddingFactory>,
    pub read_timeout: Duration,
}

/// Drive one authenticated session to completion
pub async fn handle<S>(stream: S, ctx: &SessionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = ShapedStream::new(stream, ctx.padding.write_plan());

    let mut digest = [0u8; 32];
    timeout(ctx.read_timeout, stream.read_exact(&mut digest))
        .await
        .map_err(|_| Error::auth("preamble timed out"))??;
    if digest != ctx.password_digest {
        return Err(Error::auth("bad password digest"));
    }

    let mut cmd = [0u8; 1];
    stream.read_exact(&mut cmd).await?;
    let (dest, port) = Address::read_from(&mut stream).await?;
    let dest_str = dest.to_string_with_port(port);

    match cmd[0] {
        CMD_TCP => relay_tcp(stream, ctx, &dest_str).await,
        CMD_UOT => relay_uot(stream, ctx, dest, port).await,
        other => Err(Error::protocol(format!("unknown command: {:#04x}", other))),
    }
}

async fn relay_tcp<S>(mut client: S, ctx: &SessionContext, dest: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut remote = match ctx.dialer.dial("tcp", dest).await {
        Ok(remote) => remote,
        Err(e) => {
            debug!("outbound dial {} failed: {}", dest, e);
            return Err(e.into());
        }
    };

    client.write_all(&[ACK_OK]).await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut remote).await?;
    debug!("tcp session to {} closed: {}B up, {}B down", dest, up, down);
    Ok(())
}

/// A datagram path: either a SOCKS5 UDP association through the egress
/// pool, or a locally bound socket when the primary cannot carry UDP.
enum UotTransport {
    Proxied(Box<dyn crate::egress::EgressStream>),
    Local(UdpSocket),
}

async fn open_uot_transport(
    ctx: &SessionContext,
    dest: &Address,
    port: u16,
) -> Result<UotTransport> {
    if let Some(egress) = &ctx.egress {
        match egress.dial_udp(&dest.to_string_with_port(port)).await {
            Ok(stream) => {
                debug!("udp relay via egress pool");
                return Ok(UotTransport::Proxied(Box::new(stream)));
            }
            Err(DialError::UdpUnsupportedByProxy) => {
                debug!("primary cannot carry udp, using local socket");
            }
            Err(e) => {
                debug!("udp associate failed, using local socket: {}", e);
            }
        }
    }

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(dest.to_string_with_port(port))
        .await
        .map_err(Error::Io)?;
    Ok(UotTransport::Local(socket))
}

/// Client -> destination over a stream-shaped relay
async fn uot_up_stream<R, W>(mut client: R, mut remote: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frame = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match read_u16_be(&mut client).await {
            Ok(len) => len as usize,
            Err(_) => return Ok(()), // client closed
        };
        client.read_exact(&mut frame[..len]).await?;
        remote.write_all(&frame[..len]).await?;
    }
}

/// Destination -> client over a stream-shaped relay
async fn uot_down_stream<R, W>(mut remote: R, mut client: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = remote.read(&mut datagram).await?;
        if n == 0 {
            return Ok(());
        }
        write_u16_be(&mut client, n as u16).await?;
        client.write_all(&datagram[..n]).await?;
    }
}

/// Client -> destination over a local socket
async fn uot_up_local<R>(mut client: R, socket: Arc<UdpSocket>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match read_u16_be(&mut client).await {
            Ok(len) => len as usize,
            Err(_) => return Ok(()),
        };
        client.read_exact(&mut frame[..len]).await?;
        socket.send(&frame[..len]).await?;
    }
}

/// Destination -> client over a local socket
async fn uot_down_local<W>(socket: Arc<UdpSocket>, mut client: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut datagram = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = socket.recv(&mut datagram).await?;
        write_u16_be(&mut client, n as u16).await?;
        client.write_all(&datagram[..n]).await?;
    }
}

async fn relay_uot<S>(mut client: S, ctx: &SessionContext, dest: Address, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let transport = open_uot_transport(ctx, &dest, port).await?;
    client.write_all(&[ACK_OK]).await?;

    let (client_r, client_w) = tokio::io::split(client);

    match transport {
        UotTransport::Proxied(stream) => {
            let (remote_r, remote_w) = tokio::io::split(stream);
            tokio::select! {
                r = uot_up_stream(client_r, remote_w) => r?,
                r = uot_down_stream(remote_r, client_w) => r?,
            }
        }
        UotTransport::Local(socket) => {
            let socket = Arc::new(socket);
            tokio::select! {
                r = uot_up_local(client_r, socket.clone()) => r?,
                r = uot_down_local(socket, client_w) => r?,
            }
        }
    }

    debug!("uot session to {} closed", dest.to_string_with_port(port));
    Ok(())
}
