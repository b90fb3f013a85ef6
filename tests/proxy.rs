// End-to-end scenarios against a scripted mock upstream proxy
use ntlm_proxy::config::{Config, SystemConfig, UserConfig};
use ntlm_proxy::context::ProxyContext;
use ntlm_proxy::error::ProxyError;
use ntlm_proxy::server::ProxyServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_config(proxy_port: u16) -> Config {
    Config {
        user: UserConfig {
            username: "User".into(),
            password: "Password".into(),
            domain: "Domain".into(),
            proxy_host: "127.0.0.1".into(),
            proxy_port,
            local_port: 0,
        },
        system: SystemConfig::default(),
    }
}

async fn start_server(proxy_port: u16) -> ProxyServer {
    let context = Arc::new(ProxyContext::new(test_config(proxy_port)));
    let mut server = ProxyServer::new(context);
    server.start().await.expect("server should start");
    server
}

/// Reads a head block off the socket; bytes past the blank line are
/// returned separately, they belong to the entity.
async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            return (String::from_utf8_lossy(&buf).into_owned(), leftover);
        }
        let n = stream.read(&mut chunk).await.expect("mock read");
        if n == 0 {
            return (String::from_utf8_lossy(&buf).into_owned(), Vec::new());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_entity(stream: &mut TcpStream, mut leftover: Vec<u8>, len: usize) -> Vec<u8> {
    while leftover.len() < len {
        let mut chunk = vec![0u8; len - leftover.len()];
        let n = stream.read(&mut chunk).await.expect("mock entity read");
        assert!(n > 0, "peer closed inside entity");
        leftover.extend_from_slice(&chunk[..n]);
    }
    leftover
}

/// A minimal Type-2 challenge: empty target name, an EOL-only target info
/// list, and the fixed server challenge 0102030405060708.
fn type2_message() -> Vec<u8> {
    let target_info = [0u8; 4];
    let mut msg = Vec::new();
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&48u32.to_le_bytes());
    msg.extend_from_slice(&0x0000_0201u32.to_le_bytes());
    msg.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&48u32.to_le_bytes());
    msg.extend_from_slice(&target_info);
    msg
}

fn base64(bytes: &[u8]) -> String {
    // tiny standalone encoder so the test does not reach into the crate
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for group in bytes.chunks(3) {
        let b = [group[0], *group.get(1).unwrap_or(&0), *group.get(2).unwrap_or(&0)];
        let n = u32::from_be_bytes([0, b[0], b[1], b[2]]);
        out.push(TABLE[(n >> 18 & 63) as usize] as char);
        out.push(TABLE[(n >> 12 & 63) as usize] as char);
        out.push(if group.len() > 1 { TABLE[(n >> 6 & 63) as usize] as char } else { '=' });
        out.push(if group.len() > 2 { TABLE[(n & 63) as usize] as char } else { '=' });
    }
    out
}

#[tokio::test]
async fn connect_runs_two_stage_ntlm_on_a_single_upstream_connection() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = upstream.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let accepted_count = Arc::clone(&accepted);
    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        accepted_count.fetch_add(1, Ordering::SeqCst);

        let (head, _) = read_head(&mut sock).await;
        assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"), "head: {head}");
        assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
        sock.write_all(
            b"HTTP/1.1 407 Proxy Authentication Required\r\n\
              Proxy-Authenticate: NTLM\r\n\
              Connection: keep-alive\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();

        let (head, _) = read_head(&mut sock).await;
        assert!(
            head.contains("Proxy-Authorization: NTLM TlRMTVNTUAAB"),
            "expected Type-1 negotiate, got: {head}"
        );
        let challenge = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             Proxy-Authenticate: NTLM {}\r\n\
             Content-Length: 0\r\n\r\n",
            base64(&type2_message())
        );
        sock.write_all(challenge.as_bytes()).await.unwrap();

        let (head, _) = read_head(&mut sock).await;
        assert!(
            head.contains("Proxy-Authorization: NTLM TlRMTVNTUAAD"),
            "expected Type-3 authenticate, got: {head}"
        );
        sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();

        let mut ping = [0u8; 4];
        sock.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        sock.write_all(b"pong").await.unwrap();
        let _ = sock.read(&mut [0u8; 1]).await;
    });

    let mut server = start_server(proxy_port).await;
    let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    // first tunnel bytes ride along with the CONNECT head, the way TLS
    // clients send their ClientHello without waiting for the 200
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nping")
        .await
        .unwrap();

    let (response, leftover) = read_head(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(leftover.is_empty());

    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    assert_eq!(accepted.load(Ordering::SeqCst), 1, "NTLM rounds must share one connection");
    server.close().await;
}

#[tokio::test]
async fn refused_connect_relays_the_upstream_response_verbatim() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = upstream.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let _ = read_head(&mut sock).await;
        sock.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 4\r\n\r\nnope")
            .await
            .unwrap();
    });

    let mut server = start_server(proxy_port).await;
    let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "response: {text}");
    assert!(text.ends_with("\r\n\r\nnope"), "entity must ride along: {text}");
    server.close().await;
}

#[tokio::test]
async fn small_post_is_relayed_with_hop_by_hop_headers_stripped() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = upstream.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let (head, leftover) = read_head(&mut sock).await;
        assert!(
            head.starts_with("POST http://backend.test/data HTTP/1.1\r\n"),
            "head: {head}"
        );
        assert!(head.contains("Host: backend.test"));
        let lower = head.to_ascii_lowercase();
        assert!(!lower.contains("proxy-connection"), "hop-by-hop leaked: {head}");
        assert!(!lower.contains("\r\nconnection:"), "hop-by-hop leaked: {head}");

        let body = read_entity(&mut sock, leftover, 10).await;
        assert_eq!(body, b"0123456789");

        sock.write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Length: 3\r\n\
              Keep-Alive: timeout=5\r\n\
              Proxy-Connection: keep-alive\r\n\r\nhey",
        )
        .await
        .unwrap();
        let _ = sock.read(&mut [0u8; 1]).await;
    });

    let mut server = start_server(proxy_port).await;
    let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    client
        .write_all(
            b"POST http://backend.test/data HTTP/1.1\r\n\
              Host: backend.test\r\n\
              Proxy-Connection: keep-alive\r\n\
              Content-Length: 10\r\n\r\n0123456789",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "response: {text}");
    assert!(text.ends_with("\r\n\r\nhey"), "body must be exactly hey: {text}");
    let lower = text.to_ascii_lowercase();
    assert!(!lower.contains("keep-alive"), "hop-by-hop leaked back: {text}");
    assert!(!lower.contains("proxy-connection"), "hop-by-hop leaked back: {text}");
    server.close().await;
}

#[tokio::test]
async fn relay_replays_a_buffered_body_across_ntlm_rounds() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = upstream.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();

        let (head, leftover) = read_head(&mut sock).await;
        assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
        let body = read_entity(&mut sock, leftover, 5).await;
        assert_eq!(body, b"hello");
        sock.write_all(
            b"HTTP/1.1 407 Proxy Authentication Required\r\n\
              Proxy-Authenticate: NTLM\r\n\
              Connection: keep-alive\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();

        let (head, leftover) = read_head(&mut sock).await;
        assert!(head.contains("Proxy-Authorization: NTLM TlRMTVNTUAAB"), "head: {head}");
        let body = read_entity(&mut sock, leftover, 5).await;
        assert_eq!(body, b"hello", "repeatable body must be re-sent");
        let challenge = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\n\
             Proxy-Authenticate: NTLM {}\r\n\
             Connection: keep-alive\r\n\
             Content-Length: 0\r\n\r\n",
            base64(&type2_message())
        );
        sock.write_all(challenge.as_bytes()).await.unwrap();

        let (head, leftover) = read_head(&mut sock).await;
        assert!(head.contains("Proxy-Authorization: NTLM TlRMTVNTUAAD"), "head: {head}");
        let body = read_entity(&mut sock, leftover, 5).await;
        assert_eq!(body, b"hello");
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        let _ = sock.read(&mut [0u8; 1]).await;
    });

    let mut server = start_server(proxy_port).await;
    let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    client
        .write_all(
            b"POST http://backend.test/submit HTTP/1.1\r\n\
              Host: backend.test\r\n\
              Content-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "response: {text}");
    assert!(text.ends_with("\r\n\r\nok"), "response: {text}");
    server.close().await;
}

#[tokio::test]
async fn malformed_request_yields_400() {
    let mut server = start_server(1).await;
    let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400 Bad Request"));
    server.close().await;
}

#[tokio::test]
async fn server_lifecycle_enforces_single_start_and_frees_the_port() {
    let mut server = start_server(1).await;
    let addr = server.local_addr().unwrap();

    assert!(matches!(
        server.start().await,
        Err(ProxyError::IllegalState(_))
    ));

    server.close().await;
    server.close().await;

    let rebound = TcpListener::bind(addr).await;
    assert!(rebound.is_ok(), "port must be freed by close");

    assert!(matches!(
        server.start().await,
        Err(ProxyError::IllegalState(_))
    ));
}
