//! SOCKS5 client (RFC 1928, RFC 1929)
//!
//! TCP CONNECT and UDP ASSOCIATE through a SOCKS5 proxy, with optional
//! username/password subnegotiation. The UDP side presents a stream-shaped
//! interface: writes prepend the `RSV RSV FRAG ATYP DST.ADDR DST.PORT`
//! datagram header, reads strip it for all three address types.

use super::candidate::ProxyAuth;
use crate::common::net::Address;
use crate::common::DialError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;

/// Build the method-selection greeting
fn build_greeting(auth: Option<&ProxyAuth>) -> Vec<u8> {
    match auth {
        Some(_) => vec![SOCKS5_VERSION, 2, AUTH_NONE, AUTH_PASSWORD],
        None => vec![SOCKS5_VERSION, 1, AUTH_NONE],
    }
}

/// Build a request frame: VER CMD RSV ATYP DST.ADDR DST.PORT
fn build_request(cmd: u8, target: &Address, port: u16) -> Result<Vec<u8>, DialError> {
    let mut request = vec![SOCKS5_VERSION, cmd, 0x00];
    target
        .encode_to(&mut request, port)
        .map_err(|_| DialError::config("destination address too long for SOCKS5"))?;
    Ok(request)
}

/// Build the RFC 1929 username/password frame
fn build_auth_request(auth: &ProxyAuth) -> Result<Vec<u8>, DialError> {
    if auth.username.len() > 255 || auth.password.len() > 255 {
        return Err(DialError::config("SOCKS5 username or password too long"));
    }
    let mut request = vec![0x01, auth.username.len() as u8];
    request.extend_from_slice(auth.username.as_bytes());
    request.push(auth.password.len() as u8);
    request.extend_from_slice(auth.password.as_bytes());
    Ok(request)
}

async fn write_with_timeout<S: AsyncWrite + Unpin>(
    stream: &mut S,
    data: &[u8],
    write_timeout: Duration,
    phase: &'static str,
) -> Result<(), DialError> {
    timeout(write_timeout, stream.write_all(data))
        .await
        .map_err(|_| DialError::Timeout(phase))??;
    Ok(())
}

async fn read_exact_with_timeout<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    read_timeout: Duration,
    phase: &'static str,
) -> Result<(), DialError> {
    timeout(read_timeout, stream.read_exact(buf))
        .await
        .map_err(|_| DialError::Timeout(phase))??;
    Ok(())
}

/// Greeting + optional subnegotiation, shared by CONNECT and UDP ASSOCIATE
async fn negotiate_method<S>(
    stream: &mut S,
    auth: Option<&ProxyAuth>,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_with_timeout(stream, &build_greeting(auth), write_timeout, "SOCKS5 greeting").await?;

    let mut response = [0u8; 2];
    read_exact_with_timeout(stream, &mut response, read_timeout, "SOCKS5 method reply").await?;

    if response[0] != SOCKS5_VERSION {
        return Err(DialError::rejected(None));
    }

    match response[1] {
        AUTH_NONE => Ok(()),
        AUTH_PASSWORD => {
            let auth = auth.ok_or_else(|| DialError::rejected(None))?;
            write_with_timeout(stream, &build_auth_request(auth)?, write_timeout, "SOCKS5 auth")
                .await?;

            let mut status = [0u8; 2];
            read_exact_with_timeout(stream, &mut status, read_timeout, "SOCKS5 auth reply")
                .await?;
            if status[1] != 0x00 {
                return Err(DialError::rejected(Some(status[1] as u16)));
            }
            Ok(())
        }
        AUTH_NO_ACCEPTABLE => Err(DialError::rejected(None)),
        _ => Err(DialError::rejected(None)),
    }
}

/// Read and validate a reply frame, returning the bound address when asked
async fn read_reply<S: AsyncRead + Unpin>(
    stream: &mut S,
    read_timeout: Duration,
) -> Result<(Address, u16), DialError> {
    let mut head = [0u8; 4];
    read_exact_with_timeout(stream, &mut head, read_timeout, "SOCKS5 reply").await?;

    if head[0] != SOCKS5_VERSION {
        return Err(DialError::rejected(None));
    }
    if head[1] != REP_SUCCESS {
        return Err(DialError::rejected(Some(head[1] as u16)));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            read_exact_with_timeout(stream, &mut buf, read_timeout, "SOCKS5 reply addr").await?;
            let addr = Address::Ipv4([buf[0], buf[1], buf[2], buf[3]].into());
            Ok((addr, u16::from_be_bytes([buf[4], buf[5]])))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            read_exact_with_timeout(stream, &mut buf, read_timeout, "SOCKS5 reply addr").await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let addr = Address::Ipv6(ip.into());
            Ok((addr, u16::from_be_bytes([buf[16], buf[17]])))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact_with_timeout(stream, &mut len, read_timeout, "SOCKS5 reply addr").await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            read_exact_with_timeout(stream, &mut buf, read_timeout, "SOCKS5 reply addr").await?;
            let n = len[0] as usize;
            let domain = String::from_utf8_lossy(&buf[..n]).into_owned();
            Ok((
                Address::Domain(domain),
                u16::from_be_bytes([buf[n], buf[n + 1]]),
            ))
        }
        _ => Err(DialError::rejected(None)),
    }
}

/// Perform the CONNECT handshake on an already-open proxy socket.
///
/// After success the stream passes through to the destination.
pub async fn connect<S>(
    stream: &mut S,
    target: &Address,
    port: u16,
    auth: Option<&ProxyAuth>,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, auth, read_timeout, write_timeout).await?;

    let request = build_request(CMD_CONNECT, target, port)?;
    write_with_timeout(stream, &request, write_timeout, "SOCKS5 connect").await?;

    read_reply(stream, read_timeout).await?;
    debug!("SOCKS5 connected to {}", target.to_string_with_port(port));
    Ok(())
}

/// Establish a UDP association and return a stream-shaped relay.
///
/// The control socket is consumed and kept alive inside the returned stream;
/// the relay dies with it. The proxy is expected to report an IPv4 relay
/// endpoint.
pub async fn udp_associate(
    mut control: TcpStream,
    target: Address,
    target_port: u16,
    auth: Option<&ProxyAuth>,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<Socks5UdpStream, DialError> {
    negotiate_method(&mut control, auth, read_timeout, write_timeout).await?;

    let request = build_request(
        CMD_UDP_ASSOCIATE,
        &Address::Ipv4([0, 0, 0, 0].into()),
        0,
    )?;
    write_with_timeout(&mut control, &request, write_timeout, "SOCKS5 udp associate").await?;

    let (bound, bound_port) = read_reply(&mut control, read_timeout).await?;
    let relay = match bound {
        Address::Ipv4(ip) => format!("{}:{}", ip, bound_port),
        _ => return Err(DialError::rejected(None)),
    };

    let udp = UdpSocket::bind("0.0.0.0:0").await?;
    udp.connect(&relay).await?;
    debug!("SOCKS5 udp associate relay at {}", relay);

    Ok(Socks5UdpStream {
        udp,
        _control: control,
        target,
        target_port,
        recv_buf: vec![0u8; 65536],
    })
}

/// Header length of a SOCKS5 UDP datagram given its ATYP byte
fn udp_header_len(packet: &[u8]) -> Option<usize> {
    match packet.get(3)? {
        &ATYP_IPV4 => Some(10),
        &ATYP_DOMAIN => Some(5 + *packet.get(4)? as usize + 2),
        &ATYP_IPV6 => Some(22),
        _ => None,
    }
}

/// Encode one outgoing SOCKS5 UDP datagram for `target:port`
fn encode_udp_packet(target: &Address, port: u16, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(4 + target.len() + payload.len());
    packet.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV RSV FRAG
    target
        .encode_to(&mut packet, port)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// A UDP association presented as a byte stream.
///
/// Each write sends one datagram to the fixed destination; each read yields
/// one datagram's payload. Dropping the stream closes both the UDP socket
/// and the TCP control connection.
pub struct Socks5UdpStream {
    udp: UdpSocket,
    _control: TcpStream,
    target: Address,
    target_port: u16,
    recv_buf: Vec<u8>,
}

impl AsyncRead for Socks5UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = ReadBuf::new(&mut this.recv_buf);
        match this.udp.poll_recv(cx, &mut inner) {
            Poll::Ready(Ok(())) => {
                let packet = inner.filled();
                let data_start = match udp_header_len(packet) {
                    Some(n) => n,
                    None => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "invalid SOCKS5 UDP packet",
                        )))
                    }
                };
                if packet.len() < data_start {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "truncated SOCKS5 UDP packet",
                    )));
                }
                let payload = &packet[data_start..];
                let n = payload.len().min(buf.remaining());
                buf.put_slice(&payload[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Socks5UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let packet = match encode_udp_packet(&this.target, this.target_port, buf) {
            Ok(p) => p,
            Err(e) => return Poll::Ready(Err(e)),
        };
        match this.udp.poll_send(cx, &packet) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
