use std::time::Duration;

use actix_web::{web, App, HttpRequest, HttpResponse};
use bytes::Bytes;
use courier::{
    error::{RedirectError, SendRequestError, TimeoutKind},
    ClientRequest, Connector, ConnectorConfig, ContinuationOutcome, EntityProcessing,
    RequestSettings,
};
use futures_util::stream;
use rand::{distributions::Alphanumeric, Rng};

const STR: &str = "Hello World Hello World Hello World Hello World Hello World \
                   Hello World Hello World Hello World Hello World Hello World \
                   Hello World Hello World Hello World Hello World Hello World \
                   Hello World Hello World Hello World Hello World Hello World";

fn connector(config: ConnectorConfig) -> Connector {
    let _ = env_logger::builder().is_test(true).try_init();
    Connector::new(config.proxy_from_env(false)).unwrap()
}

fn payload(len: usize) -> Bytes {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .collect::<Vec<u8>>()
        .into()
}

async fn echo(body: web::Bytes) -> HttpResponse {
    HttpResponse::Ok().body(body)
}

async fn method(req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().body(req.method().to_string())
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(4 * 1024 * 1024))
        .route("/", web::to(|| async { HttpResponse::Ok().body(STR) }))
        .route("/echo", web::to(echo))
        .route("/method", web::to(method))
        .route(
            "/slow",
            web::to(|| async {
                actix_rt::time::sleep(Duration::from_secs(2)).await;
                HttpResponse::Ok().body(STR)
            }),
        )
        .route(
            "/loop",
            web::to(|| async {
                HttpResponse::SeeOther()
                    .insert_header(("location", "/loop"))
                    .finish()
            }),
        )
        .route(
            "/hop/{n}",
            web::to(|n: web::Path<u32>| async move {
                HttpResponse::Found()
                    .insert_header(("location", format!("/hop/{}", *n + 1)))
                    .finish()
            }),
        )
        .route(
            "/submit",
            web::to(|| async {
                HttpResponse::SeeOther()
                    .insert_header(("location", "/method"))
                    .finish()
            }),
        )
        .route(
            "/moved",
            web::to(|| async {
                HttpResponse::TemporaryRedirect()
                    .insert_header(("location", "/echo"))
                    .finish()
            }),
        );
}

#[actix_rt::test]
async fn simple_get() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());

    let req = ClientRequest::get(srv.url("/")).insert_header(("x-test", "111"));
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert!(res.status().is_success());
    assert_eq!(res.uri().path(), "/");
    assert_eq!(res.continuation(), None);
    assert!(!res.continuation_state().requested());

    let bytes = res.bytes().await.unwrap();
    assert_eq!(bytes, Bytes::from_static(STR.as_ref()));
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn echo_in_every_transfer_mode() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());
    let data = payload(1024 * 1024);

    // preset length
    let req = ClientRequest::post(srv.url("/echo")).body(data.clone());
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), data);
    exchange.done().await.unwrap();

    // chunked stream of unknown length
    let chunks = data
        .chunks(64 * 1024)
        .map(|chunk| Ok::<_, std::io::Error>(Bytes::copy_from_slice(chunk)))
        .collect::<Vec<_>>();
    let req = ClientRequest::post(srv.url("/echo")).streaming(stream::iter(chunks), None);
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), data);
    exchange.done().await.unwrap();

    // delayed length from a blocking writer
    let body = data.clone();
    let req = ClientRequest::post(srv.url("/echo"))
        .settings(RequestSettings::new().entity_processing(EntityProcessing::Buffered))
        .entity(None, move |sink| {
            for chunk in body.chunks(10_000) {
                std::io::Write::write_all(sink, chunk)?;
            }
            Ok(())
        });
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), data);
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn redirect_loop_is_detected() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());

    let mut exchange = connector.submit(ClientRequest::get(srv.url("/loop")));
    let err = exchange.available().await.unwrap_err();
    assert!(err.is_redirect());
    assert!(matches!(
        err,
        SendRequestError::Redirect(RedirectError::LoopDetected(ref uri)) if uri.path() == "/loop"
    ));
    assert!(matches!(exchange.done().await, Err(SendRequestError::Aborted)));
}

#[actix_rt::test]
async fn redirect_limit() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default().max_redirects(3));

    let mut exchange = connector.submit(ClientRequest::get(srv.url("/hop/0")));
    let err = exchange.available().await.unwrap_err();
    assert!(matches!(
        err,
        SendRequestError::Redirect(RedirectError::LimitExceeded(3))
    ));

    // not following hands back the redirect itself
    let req = ClientRequest::get(srv.url("/hop/0"))
        .settings(RequestSettings::new().follow_redirects(false));
    let mut exchange = connector.submit(req);
    let res = exchange.available().await.unwrap();
    assert_eq!(res.status().as_u16(), 302);
    assert_eq!(res.headers().get("location").unwrap(), "/hop/1");
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn see_other_switches_to_get() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());

    let req = ClientRequest::post(srv.url("/submit")).body("form data");
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.uri().path(), "/method");
    assert_eq!(res.bytes().await.unwrap(), Bytes::from_static(b"GET"));
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn temporary_redirect_resends_body() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());

    let req = ClientRequest::put(srv.url("/moved")).body("keep me");
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), Bytes::from_static(b"keep me"));
    exchange.done().await.unwrap();

    let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(b"once"))];
    let req = ClientRequest::put(srv.url("/moved")).streaming(stream::iter(chunks), None);
    let mut exchange = connector.submit(req);
    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Redirect(RedirectError::NonReplayableBody(_)))
    ));
}

#[actix_rt::test]
async fn continuation_proceeds() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(
        ConnectorConfig::default()
            .continuation(true)
            .continuation_size_threshold(1024),
    );
    let data = payload(2 * 1024 * 1024);

    let mut exchange = connector.submit(ClientRequest::post(srv.url("/echo")).body(data.clone()));
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.continuation(), Some(ContinuationOutcome::Proceed));
    assert_eq!(res.bytes().await.unwrap(), data);
    exchange.done().await.unwrap();

    // small bodies skip the handshake
    let mut exchange = connector.submit(ClientRequest::post(srv.url("/echo")).body("tiny"));
    let res = exchange.available().await.unwrap();
    assert_eq!(res.continuation(), None);
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn connections_are_reused() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());

    for _ in 0..3 {
        let mut exchange = connector.submit(ClientRequest::get(srv.url("/")));
        let mut res = exchange.available().await.unwrap();
        res.bytes().await.unwrap();
        exchange.done().await.unwrap();
        assert_eq!(connector.pool().total_idle(), 1);
    }

    connector.close();
    assert_eq!(connector.pool().total_idle(), 0);
    assert!(matches!(
        connector.submit(ClientRequest::get(srv.url("/"))).available().await,
        Err(SendRequestError::Connect(_))
    ));
}

#[actix_rt::test]
async fn concurrent_exchanges() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default().max_connections_per_destination(4));

    let exchanges = (0..10)
        .map(|_| connector.submit(ClientRequest::get(srv.url("/"))))
        .collect::<Vec<_>>();

    for mut exchange in exchanges {
        let mut res = exchange.available().await.unwrap();
        assert_eq!(res.bytes().await.unwrap().len(), STR.len());
        exchange.done().await.unwrap();
    }

    assert!(connector.pool().total_idle() <= 4);
}

#[actix_rt::test]
async fn blocking_send() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());
    let url = srv.url("/echo");

    let body = actix_rt::task::spawn_blocking(move || {
        let res = connector.send(ClientRequest::post(url).body("blocking"))?;
        let mut body = String::new();
        std::io::Read::read_to_string(&mut res.into_body().into_reader(), &mut body).unwrap();
        Ok::<_, courier::error::ProcessingError>(body)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(body, "blocking");
}

#[actix_rt::test]
async fn callback_receives_response() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());
    let (tx, rx) = tokio::sync::oneshot::channel();

    let canceller = connector.submit_with(ClientRequest::get(srv.url("/method")), move |res| {
        let _ = tx.send(res.map(|res| res.status()));
    });

    assert!(rx.await.unwrap().unwrap().is_success());
    assert!(!canceller.is_cancelled());
}

#[actix_rt::test]
async fn cancel_pending_exchange() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default());

    let mut exchange = connector.submit(ClientRequest::get(srv.url("/slow")));
    actix_rt::time::sleep(Duration::from_millis(100)).await;
    exchange.cancel();

    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Canceled)
    ));
    assert!(matches!(exchange.done().await, Err(SendRequestError::Aborted)));
}

#[actix_rt::test]
async fn total_timeout() {
    let srv = actix_test::start(|| App::new().configure(routes));
    let connector = connector(ConnectorConfig::default().total_timeout(Duration::from_millis(200)));

    let mut exchange = connector.submit(ClientRequest::get(srv.url("/slow")));
    let err = exchange.available().await.unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Total));

    // a per-request override disables it
    let req = ClientRequest::get(srv.url("/"))
        .settings(RequestSettings::new().total_timeout(Duration::ZERO));
    let mut exchange = connector.submit(req);
    assert!(exchange.available().await.is_ok());
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn http2_prior_knowledge() {
    let srv = actix_test::start_with(actix_test::config().h2(), || {
        App::new().configure(routes)
    });
    let connector = connector(ConnectorConfig::default().http2(true).continuation(true));

    // larger than the initial stream window
    let data = payload(256 * 1024);
    let mut exchange = connector.submit(ClientRequest::post(srv.url("/echo")).body(data.clone()));
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.version(), actix_web::http::Version::HTTP_2);
    assert!(!res.continuation_state().requested());
    assert_eq!(res.bytes().await.unwrap(), data);
    exchange.done().await.unwrap();
    assert_eq!(connector.pool().total_idle(), 1);

    // streamed body over the pooled connection
    let chunks = data
        .chunks(10_000)
        .map(|chunk| Ok::<_, std::io::Error>(Bytes::copy_from_slice(chunk)))
        .collect::<Vec<_>>();
    let req = ClientRequest::post(srv.url("/echo")).streaming(stream::iter(chunks), None);
    let mut exchange = connector.submit(req);
    let mut res = exchange.available().await.unwrap();
    assert_eq!(res.bytes().await.unwrap(), data);
    exchange.done().await.unwrap();
    assert_eq!(connector.pool().total_idle(), 1);

    let mut exchange = connector.submit(ClientRequest::head(srv.url("/")));
    let mut res = exchange.available().await.unwrap();
    assert!(res.status().is_success());
    assert!(res.bytes().await.unwrap().is_empty());
    exchange.done().await.unwrap();
}

#[actix_rt::test]
async fn http2_read_timeout_and_cancel() {
    let srv = actix_test::start_with(actix_test::config().h2(), || {
        App::new().configure(routes)
    });
    let connector = connector(
        ConnectorConfig::default()
            .http2(true)
            .read_timeout(Duration::from_millis(200)),
    );

    let mut exchange = connector.submit(ClientRequest::get(srv.url("/slow")));
    let err = exchange.available().await.unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Read));

    let mut exchange = connector.submit(ClientRequest::get(srv.url("/slow")));
    actix_rt::time::sleep(Duration::from_millis(100)).await;
    exchange.cancel();
    assert!(matches!(
        exchange.available().await,
        Err(SendRequestError::Canceled)
    ));
    assert!(matches!(exchange.done().await, Err(SendRequestError::Aborted)));
}
