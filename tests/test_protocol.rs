use std::{future::Future, net::SocketAddr, time::Duration};

use actix_rt::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use bytes::Bytes;
use courier::{
    error::{ProtocolError, SendRequestError, TimeoutKind},
    ClientRequest, Connector, ConnectorConfig, ContinuationOutcome,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

fn connector(config: ConnectorConfig) -> Connector {
    let _ = env_logger::builder().is_test(true).try_init();
    Connector::new(config.proxy_from_env(false)).unwrap()
}

/// Accepts one connection and runs `script` on it.
async fn scripted<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    actix_rt::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });

    addr
}

/// Reads up to the end of the header section; returns the head and any body bytes after it.
async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0; 4096];

    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return (String::from_utf8(buf).unwrap(), rest);
        }

        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before end of head");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_exact_body(stream: &mut TcpStream, mut have: Vec<u8>, len: usize) -> Vec<u8> {
    let mut chunk = [0; 8192];
    while have.len() < len {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        have.extend_from_slice(&chunk[..n]);
    }
    have
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

#[actix_rt::test]
async fn request_wire_format() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let addr = scripted(|mut stream| async move {
        let (head, _) = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        let _ = tx.send(head);
    })
    .await;

    let connector = connector(ConnectorConfig::default());
    let mut exchange = connector.submit(
        ClientRequest::delete(url(addr, "/items/7?force=1")).insert_header(("x-trace", "abc")),
    );
    assert_eq!(exchange.available().await.unwrap().status().as_u16(), 204);
    exchange.done().await.unwrap();

    let head = rx.await.unwrap();
    assert!(head.starts_with("DELETE /items/7?force=1 HTTP/1.1\r\n"));
    assert!(head.contains(&format!("host: 127.0.0.1:{}\r\n", addr.port())));
    assert!(head.contains("x-trace: abc\r\n"));
}

#[actix_rt::test]
async fn chunked_response() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let connector = connector(ConnectorConfig::default());
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), Bytes::from_static(b"hello world"));
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn rejected_continuation_skips_body() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let addr = scripted(|mut stream| async move {
        let (head, rest) = read_head(&mut stream).await;
        assert!(head.contains("expect: 100-continue\r\n"));
        assert!(rest.is_empty());

        stream
            .write_all(b"HTTP/1.1 417 Expectation Failed\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();

        // body must never arrive
        let mut buf = [0; 1024];
        let res = timeout(Duration::from_millis(300), stream.read(&mut buf)).await;
        let _ = tx.send(matches!(res, Err(_) | Ok(Ok(0)) | Ok(Err(_))));
    })
    .await;

    let connector = connector(
        ConnectorConfig::default()
            .continuation(true)
            .continuation_size_threshold(16),
    );
    let req = ClientRequest::post(url(addr, "/upload")).body(vec![b'x'; 4096]);
    let mut exchange = connector.submit(req);

    let res = exchange.available().await.unwrap();
    assert_eq!(res.status().as_u16(), 417);
    assert_eq!(
        res.continuation(),
        Some(ContinuationOutcome::Rejected(res.status()))
    );
    exchange.done().await.unwrap();
    assert!(rx.await.unwrap());
}

#[actix_rt::test]
async fn silent_server_gets_body_after_timeout() {
    let addr = scripted(|mut stream| async move {
        let (head, rest) = read_head(&mut stream).await;
        assert!(head.contains("expect: 100-continue\r\n"));

        let body = read_exact_body(&mut stream, rest, 4096).await;
        assert_eq!(body.len(), 4096);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let connector = connector(
        ConnectorConfig::default()
            .continuation(true)
            .continuation_size_threshold(16)
            .continuation_timeout(Duration::from_millis(100)),
    );
    let req = ClientRequest::put(url(addr, "/upload")).body(vec![b'x'; 4096]);
    let mut exchange = connector.submit(req);

    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.continuation(), Some(ContinuationOutcome::TimedOutProceed));
    let state = res.continuation_state();
    assert!(state.requested() && !state.responded());
    assert_eq!(res.bytes().await.unwrap(), Bytes::from_static(b"ok"));
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn slow_body_writer_does_not_trip_read_timeout() {
    let addr = scripted(|mut stream| async move {
        let (head, mut body) = read_head(&mut stream).await;
        assert!(head.contains("expect: 100-continue\r\n"));

        sleep(Duration::from_millis(20)).await;
        stream
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await
            .unwrap();

        let mut chunk = [0; 1024];
        while !body.ends_with(b"0\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            body.extend_from_slice(&chunk[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let connector = connector(
        ConnectorConfig::default()
            .continuation(true)
            .read_timeout(Duration::from_millis(200)),
    );
    // the head is held back until the writer produces its first byte
    let req = ClientRequest::post(url(addr, "/upload")).entity(None, |sink| {
        std::thread::sleep(Duration::from_millis(300));
        std::io::Write::write_all(sink, b"late body")
    });
    let mut exchange = connector.submit(req);

    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(res.continuation(), Some(ContinuationOutcome::Proceed));
    assert_eq!(res.bytes().await.unwrap(), Bytes::from_static(b"ok"));
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn unexpected_status_during_continuation() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let connector = connector(
        ConnectorConfig::default()
            .continuation(true)
            .continuation_size_threshold(16)
            .continuation_timeout(Duration::from_secs(5)),
    );
    let req = ClientRequest::post(url(addr, "/upload")).body(vec![b'x'; 4096]);
    let mut exchange = connector.submit(req);

    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Protocol(ProtocolError::UnexpectedContinuation(status)))
            if status.as_u16() == 202
    ));
    assert!(matches!(exchange.done().await, Err(SendRequestError::Aborted)));
}

#[actix_rt::test]
async fn stalled_body_times_out() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n0123456789")
            .await
            .unwrap();
        sleep(Duration::from_secs(3)).await;
    })
    .await;

    let connector = connector(ConnectorConfig::default().read_timeout(Duration::from_millis(200)));
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));

    let mut res = exchange.available().await.unwrap();
    assert!(res.bytes().await.is_err());
    let err = exchange.done().await.unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Read));
}

#[actix_rt::test]
async fn closed_before_end_of_body() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n0123456789")
            .await
            .unwrap();
        drop(stream);
    })
    .await;

    let connector = connector(ConnectorConfig::default());
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));

    let mut res = exchange.available().await.unwrap();
    assert!(res.bytes().await.is_err());
    assert!(matches!(exchange.done().await, Err(SendRequestError::Closed)));
}

#[actix_rt::test]
async fn response_until_close() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\nuntil eof")
            .await
            .unwrap();
        drop(stream);
    })
    .await;

    let connector = connector(ConnectorConfig::default());
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));

    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), Bytes::from_static(b"until eof"));
    exchange.done().await.unwrap();
    assert_eq!(connector.pool().total_idle(), 0);
}

#[actix_rt::test]
async fn malformed_status_line() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream.write_all(b"HTTP/1.1 abc OK\r\n\r\n").await.unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let connector = connector(ConnectorConfig::default());
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));

    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Protocol(_))
    ));
}

#[actix_rt::test]
async fn oversized_header_section() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        let header = "x".repeat(512);
        let res = format!("HTTP/1.1 200 OK\r\nx-large: {header}\r\ncontent-length: 0\r\n\r\n");
        stream.write_all(res.as_bytes()).await.unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let connector = connector(ConnectorConfig::default().max_header_size(128));
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));

    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Protocol(ProtocolError::HeadersTooLarge(_)))
    ));
}

#[actix_rt::test]
async fn idle_connections_are_pruned() {
    let addr = scripted(|mut stream| async move {
        read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        sleep(Duration::from_secs(3)).await;
    })
    .await;

    let connector = connector(
        ConnectorConfig::default().idle_prune_interval(Duration::from_millis(100)),
    );
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));
    exchange.available().await.unwrap();
    exchange.done().await.unwrap();
    assert_eq!(connector.pool().total_idle(), 1);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.pool().total_idle(), 0);
}

#[actix_rt::test]
async fn connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connector = connector(ConnectorConfig::default());
    let mut exchange = connector.submit(ClientRequest::get(url(addr, "/")));

    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Connect(_))
    ));
    assert!(matches!(exchange.done().await, Err(SendRequestError::Aborted)));
}
