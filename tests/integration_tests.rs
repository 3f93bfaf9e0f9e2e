//! End-to-end egress scenarios against local mock proxies

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use veiltls::config::EgressConfig;
use veiltls::egress::{
    parse_candidates, DialTimeouts, EgressDialer, Pool, ProbeConfig, ProbeEngine,
};
use veiltls::DialError;

fn egress_config(dial: &str, fallback: bool) -> EgressConfig {
    EgressConfig {
        dial: dial.to_string(),
        dial_fallback: fallback,
        connect_timeout_secs: 2,
        read_timeout_secs: 2,
        write_timeout_secs: 2,
        ..EgressConfig::default()
    }
}

/// Bind-and-drop leaves a port that refuses connections
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn echo_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, task)
}

/// Consume a SOCKS5 greeting + CONNECT request, reply success, return the
/// requested destination as (host, port)
async fn socks5_accept(stream: &mut TcpStream) -> std::io::Result<(String, u16)> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let (host, port) = match head[3] {
        0x01 => {
            let mut b = [0u8; 6];
            stream.read_exact(&mut b).await?;
            (
                format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3]),
                u16::from_be_bytes([b[4], b[5]]),
            )
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut b = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut b).await?;
            let n = len[0] as usize;
            (
                String::from_utf8_lossy(&b[..n]).into_owned(),
                u16::from_be_bytes([b[n], b[n + 1]]),
            )
        }
        _ => {
            let mut b = [0u8; 18];
            stream.read_exact(&mut b).await?;
            ("ipv6".to_string(), u16::from_be_bytes([b[16], b[17]]))
        }
    };
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok((host, port))
}

/// Mock SOCKS5 proxy that accepts any tunnel and echoes the payload itself
async fn mock_socks5_echo() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if socks5_accept(&mut stream).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (port, task)
}

#[tokio::test]
async fn test_failover_to_direct() {
    let dead_port = closed_port().await;
    let (dest, _echo) = echo_listener().await;

    let dialer = EgressDialer::new(&egress_config(
        &format!("socks5://127.0.0.1:{},DIRECT", dead_port),
        false,
    ))
    .unwrap();

    let mut stream = dialer.dial("tcp", &dest.to_string()).await.unwrap();
    stream.write_all(b"via-direct").await.unwrap();
    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via-direct");

    let status = dialer.status();
    assert_eq!(status.current_rank, 1, "selection moved to DIRECT");
    assert_eq!(status.candidates[0].fail_count, 1);
    assert!(
        status.candidates[0].healthy,
        "one failure stays below the threshold"
    );
    assert!(status.candidates[1].is_current);
}

#[tokio::test]
async fn test_all_candidates_failed() {
    let dead1 = closed_port().await;
    let dead2 = closed_port().await;

    let dialer = EgressDialer::new(&egress_config(
        &format!("socks5://127.0.0.1:{},socks5://127.0.0.1:{}", dead1, dead2),
        false,
    ))
    .unwrap();

    let err = dialer.dial("tcp", "127.0.0.1:4242").await.unwrap_err();
    assert!(matches!(err, DialError::AllCandidatesFailed { .. }));

    // exactly one failed attempt per candidate per dial
    let status = dialer.status();
    assert_eq!(status.candidates[0].fail_count, 1);
    assert_eq!(status.candidates[1].fail_count, 1);
    assert!(status.candidates[0].healthy);
    assert!(status.candidates[1].healthy);
}

#[tokio::test]
async fn test_socks5_tunnel_end_to_end() {
    let (proxy_port, _proxy) = mock_socks5_echo().await;

    let dialer =
        EgressDialer::new(&egress_config(&format!("socks5://127.0.0.1:{}", proxy_port), false))
            .unwrap();

    let mut stream = dialer.dial("tcp", "upstream.internal:4242").await.unwrap();
    stream.write_all(b"tunneled").await.unwrap();
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunneled");

    let status = dialer.status();
    assert!(status.candidates[0].healthy);
    assert_eq!(status.candidates[0].fail_count, 0);
}

#[tokio::test]
async fn test_http_connect_tunnel_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let proxy = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        // echo after the tunnel goes opaque
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
        request
    });

    let dialer =
        EgressDialer::new(&egress_config(&format!("http://127.0.0.1:{}", proxy_port), false))
            .unwrap();

    let mut stream = dialer.dial("tcp", "example.com:80").await.unwrap();
    stream.write_all(b"payload").await.unwrap();
    let mut buf = [0u8; 7];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"payload");

    let request = proxy.await.unwrap();
    assert!(request.starts_with("CONNECT example.com:80 HTTP/1.1\r\n"));
    assert!(request.contains("Host: example.com:80\r\n"));
}

#[tokio::test]
async fn test_smart_failback_after_probe_cycle() {
    // candidate 0: a live SOCKS5 proxy whose tunnel answers probes with 204
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = listener.local_addr().unwrap().port();
    let _probe_target = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if socks5_accept(&mut stream).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.0 204 No Content\r\n\r\n")
                    .await;
            });
        }
    });

    let candidates = parse_candidates(
        &format!("socks5://127.0.0.1:{},socks5://127.0.0.1:1", proxy_port),
        false,
    )
    .unwrap();
    let pool = Arc::new(parking_lot::RwLock::new(Pool::new(candidates)));

    // drive candidate 0 past the threshold, leave candidate 1 carrying traffic
    {
        let mut pool = pool.write();
        pool.mark_dial_err(0);
        pool.mark_dial_err(0);
        pool.mark_dial_err(0);
        pool.mark_dial_ok(1);
        assert_eq!(pool.current_rank(), 1);
        assert!(!pool.get(0).healthy);
    }

    let engine = ProbeEngine::new(
        pool.clone(),
        ProbeConfig {
            urls: vec![format!("http://127.0.0.1:{}/generate_204", proxy_port)],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
            success_threshold: 1,
            transfer_idle: Duration::ZERO,
        },
        DialTimeouts {
            connect: Duration::from_secs(2),
            read: Duration::from_secs(2),
            write: Duration::from_secs(2),
        },
    );
    engine.sweep().await;

    let pool = pool.read();
    assert!(pool.get(0).healthy, "probe restored candidate 0");
    assert_eq!(pool.get(0).fail_count, 0);
    assert_eq!(pool.current_rank(), 0, "selection failed back to rank 0");
}
