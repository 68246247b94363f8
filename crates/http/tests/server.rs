//! End-to-end tests over real sockets: request/response cycles,
//! keep-alive reuse, phase timeouts, routing churn and protocol upgrade.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use socket_http::endpoint::EndPointManager;
use socket_http::handler::{BoxError, Handler, make_handler};
use socket_http::protocol::body::ReqBody;
use socket_http::server::HttpServer;
use socket_http::upgrade::OnUpgrade;

/// Echoes the request body back, or `METHOD /path` when there is none.
async fn echo(request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
    let (parts, body) = request.into_parts();
    let bytes = body.collect().await?.to_bytes();
    let reply = if bytes.is_empty() { Bytes::from(format!("{} {}", parts.method, parts.uri.path())) } else { bytes };
    Ok(Response::new(Full::new(reply)))
}

async fn start_server<H>(handler: H) -> (Arc<EndPointManager>, Arc<HttpServer>, SocketAddr)
where
    H: Handler + 'static,
{
    let manager = EndPointManager::new();
    let server = HttpServer::new(handler);
    server.add_prefix("http://*:0/");
    server.start(&manager).await.unwrap();

    let endpoint: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let listener = manager.listener_at(endpoint).await.expect("listener registered");
    let mut addr = listener.local_addr();
    addr.set_ip("127.0.0.1".parse().unwrap());

    (manager, server, addr)
}

async fn start_echo_server() -> (Arc<EndPointManager>, Arc<HttpServer>, SocketAddr) {
    start_server(make_handler(echo)).await
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Reads one response with a Content-Length (or empty) body; leaves the
/// connection open for keep-alive tests.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "connection closed before the response head completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") { value.trim().parse::<usize>().ok() } else { None }
        })
        .unwrap_or(0);

    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await.unwrap();
        assert!(n > 0, "connection closed inside the response body");
        body.extend_from_slice(&tmp[..n]);
    }

    (head, body)
}

/// Reads until the peer closes; 0 means a clean FIN, errors also count as
/// torn down.
async fn read_until_closed(stream: &mut TcpStream) -> usize {
    let mut tmp = [0u8; 64];
    match timeout(Duration::from_secs(5), stream.read(&mut tmp)).await {
        Ok(Ok(n)) => n,
        Ok(Err(_)) => 0,
        Err(_) => panic!("server did not close the connection in time"),
    }
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let pos = find_subslice(data, b"\r\n").expect("chunk size line");
        let size = usize::from_str_radix(std::str::from_utf8(&data[..pos]).unwrap().trim(), 16).unwrap();
        data = &data[pos + 2..];
        if size == 0 {
            break;
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
    out
}

#[tokio::test]
async fn serves_a_simple_request() {
    let (manager, server, addr) = start_echo_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /hello HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").await.unwrap();

    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "unexpected head: {head}");
    assert_eq!(body, b"GET /hello");

    server.stop(&manager).await;
}

#[tokio::test]
async fn keep_alive_reuses_the_connection_until_close() {
    let (manager, server, addr) = start_echo_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();

    for i in 0..3 {
        let request = format!("GET /r{i} HTTP/1.1\r\nHost: a\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let (head, body) = read_response(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(body, format!("GET /r{i}").into_bytes());
    }

    // opting out of keep-alive ends the cycle after the response
    stream.write_all(b"GET /last HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").await.unwrap();
    let (_, body) = read_response(&mut stream).await;
    assert_eq!(body, b"GET /last");
    assert_eq!(read_until_closed(&mut stream).await, 0);

    server.stop(&manager).await;
}

#[tokio::test]
async fn undrainable_body_prevents_reuse() {
    // the handler ignores its body entirely
    let handler = make_handler(|_req: Request<ReqBody>| async move {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"done"))))
    });
    let (manager, server, addr) = start_server(handler).await;
    server.timeouts().set_drain_entity_body(Duration::from_millis(200));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // a keep-alive request declaring far more body than it sends
    stream.write_all(b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 100000\r\n\r\npartial").await.unwrap();

    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"done");

    // the drain budget expires on the missing bytes; no reuse
    assert_eq!(read_until_closed(&mut stream).await, 0);

    server.stop(&manager).await;
}

#[tokio::test]
async fn short_idle_timeout_disconnects_a_silent_peer() {
    let (manager, server, addr) = start_echo_server().await;
    server.timeouts().set_idle_connection(Duration::from_millis(100));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // never send a byte; within ~1s the server must give up
    let mut tmp = [0u8; 16];
    let n = timeout(Duration::from_secs(2), stream.read(&mut tmp))
        .await
        .expect("server kept a silent peer past its idle budget")
        .unwrap_or(0);
    assert_eq!(n, 0);

    server.stop(&manager).await;
}

#[tokio::test]
async fn long_idle_timeout_keeps_a_silent_peer_connected() {
    let (manager, server, addr) = start_echo_server().await;
    server.timeouts().set_idle_connection(Duration::from_millis(5000));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    // still connected: the request goes through
    stream.write_all(b"GET /still-here HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"GET /still-here");

    server.stop(&manager).await;
}

#[tokio::test]
async fn oversized_header_block_is_rejected() {
    let (manager, server, addr) = start_echo_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n").await.unwrap();
    // a never-terminated header bringing the accumulated head to exactly
    // one byte past the 32 KiB ceiling
    let huge = format!("X-Filler: {}", "a".repeat(32_734));
    stream.write_all(huge.as_bytes()).await.unwrap();

    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 400"), "unexpected head: {head}");
    assert_eq!(read_until_closed(&mut stream).await, 0);

    server.stop(&manager).await;
}

#[tokio::test]
async fn unroutable_request_gets_a_400() {
    let manager = EndPointManager::new();
    let server = HttpServer::new(make_handler(echo));
    // only a narrow path is registered; everything else is unroutable
    server.add_prefix("http://*:0/only/");
    server.start(&manager).await.unwrap();
    let listener = manager.listener_at("0.0.0.0:0".parse().unwrap()).await.unwrap();
    let mut addr = listener.local_addr();
    addr.set_ip("127.0.0.1".parse().unwrap());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /elsewhere HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();

    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 400"));
    assert_eq!(read_until_closed(&mut stream).await, 0);

    server.stop(&manager).await;
}

#[tokio::test]
async fn prefixes_route_to_their_servers_on_a_shared_endpoint() {
    let manager = EndPointManager::new();

    let api = HttpServer::new(make_handler(|_req: Request<ReqBody>| async {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"api"))))
    }));
    api.add_prefix("http://*:0/api/");
    api.start(&manager).await.unwrap();

    let root = HttpServer::new(make_handler(|_req: Request<ReqBody>| async {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"root"))))
    }));
    root.add_prefix("http://*:0/");
    root.start(&manager).await.unwrap();

    let listener = manager.listener_at("0.0.0.0:0".parse().unwrap()).await.unwrap();
    let mut addr = listener.local_addr();
    addr.set_ip("127.0.0.1".parse().unwrap());

    // both requests ride one keep-alive connection; the second rebinds it
    // to the other logical server
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"GET /api/users HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"api");

    stream.write_all(b"GET /elsewhere HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"root");

    api.stop(&manager).await;
    root.stop(&manager).await;
}

#[tokio::test]
async fn concurrent_registration_never_tears_the_routing_table() {
    let (manager, server, addr) = start_echo_server().await;

    // churn extra servers on and off the same endpoint while requests fly
    let churn = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            for _ in 0..50 {
                let extra = HttpServer::new(make_handler(|_req: Request<ReqBody>| async {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"extra"))))
                }));
                extra.add_prefix("http://*:0/extra/");
                extra.start(&manager).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                extra.stop(&manager).await;
            }
        })
    };

    for _ in 0..100 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /root HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let (head, body) = read_response(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(body, b"GET /root");
    }

    churn.await.unwrap();
    server.stop(&manager).await;
}

#[tokio::test]
async fn chunked_request_and_response_round_trip() {
    // echo with a streamed response body of unknown size, so the response
    // goes out chunked
    let handler = make_handler(|req: Request<ReqBody>| async move {
        let bytes = req.into_body().collect().await?.to_bytes();
        let frames: Vec<Result<http_body::Frame<Bytes>, Infallible>> =
            bytes.chunks(3).map(|chunk| Ok(http_body::Frame::data(Bytes::copy_from_slice(chunk)))).collect();
        let body = http_body_util::StreamBody::new(futures::stream::iter(frames));
        Ok::<_, BoxError>(Response::new(body))
    });
    let (manager, server, addr) = start_server(handler).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /e HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    stream.write_all(b"6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n").await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
    assert!(text.contains("transfer-encoding: chunked"));

    let body_start = find_subslice(&raw, b"\r\n\r\n").unwrap() + 4;
    assert_eq!(decode_chunked(&raw[body_start..]), b"hello world");

    server.stop(&manager).await;
}

#[tokio::test]
async fn expect_continue_gets_an_interim_response() {
    let (manager, server, addr) = start_echo_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"POST /c HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n")
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    stream.read_exact(&mut interim).await.unwrap();
    assert_eq!(&interim[..], b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"hello").await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, b"hello");

    server.stop(&manager).await;
}

#[tokio::test]
async fn entity_body_timeout_surfaces_as_a_body_error() {
    let handler = make_handler(|req: Request<ReqBody>| async move {
        match req.into_body().collect().await {
            Ok(_) => Ok::<_, BoxError>(Response::new(Full::new(Bytes::from_static(b"read ok")))),
            Err(e) => Err(e.into()),
        }
    });
    let (manager, server, addr) = start_server(handler).await;
    server.timeouts().set_entity_body(Duration::from_millis(200));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // declare ten body bytes, deliver three, then stall
    stream.write_all(b"POST /slow HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\nabc").await.unwrap();

    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 500"), "unexpected head: {head}");

    server.stop(&manager).await;
}

#[tokio::test]
async fn upgrade_hands_over_the_raw_stream() {
    let handler = make_handler(|mut req: Request<ReqBody>| async move {
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>().expect("upgrade handle present");
        tokio::spawn(async move {
            let mut io = on_upgrade.upgraded().await.expect("upgrade completed");
            let mut buf = [0u8; 5];
            io.read_exact(&mut buf).await.unwrap();
            io.write_all(&buf).await.unwrap();
        });

        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "echo")
            .body(http_body_util::Empty::<Bytes>::new())
            .unwrap();
        Ok::<_, Infallible>(response)
    });
    let (manager, server, addr) = start_server(handler).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET /up HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n").await.unwrap();

    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "unexpected head: {head}");
    assert!(body.is_empty());

    // http framing has stopped; the stream is a plain echo pipe now
    stream.write_all(b"ping!").await.unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping!");

    server.stop(&manager).await;
}

#[tokio::test]
async fn stopping_the_server_closes_idle_connections() {
    let (manager, server, addr) = start_echo_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // one exchange binds the connection to the server
    stream.write_all(b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"));

    server.stop(&manager).await;
    assert_eq!(read_until_closed(&mut stream).await, 0);
}
