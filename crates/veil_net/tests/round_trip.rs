mod helpers;

use helpers::peers::Peer;
use helpers::stubs::{StubDialer, StubEngine, StubImpersonator, StubPlain};
use http::{Request, StatusCode, Version};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use veil_net::{Error, ProfileId, RequestBody, Stage, TargetAddress, Transport, TransportConfig};

const H1_OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

fn get(uri: &str) -> Request<RequestBody> {
    Request::get(uri).body(RequestBody::Empty).unwrap()
}

fn transport(
    config: TransportConfig,
    dialer: Arc<StubDialer>,
    impersonator: Arc<StubImpersonator>,
) -> Transport {
    Transport::builder(config)
        .direct_dialer(dialer)
        .impersonator(impersonator)
        .plain(Arc::new(StubPlain::default()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn unsupported_scheme_never_dials() {
    let dialer = StubDialer::new("direct", Peer::H2);
    let transport = transport(
        TransportConfig::default(),
        dialer.clone(),
        StubImpersonator::negotiating("h2"),
    );

    for uri in ["ftp://example.com/", "ws://example.com/chat", "/relative"] {
        let err = transport.round_trip(get(uri)).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)), "{uri}: {err}");
        assert_eq!(err.stage(), Stage::Scheme);
    }
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn plaintext_goes_to_the_stock_transport() {
    let dialer = StubDialer::new("direct", Peer::H2);
    let plain = Arc::new(StubPlain::default());
    let transport = Transport::builder(TransportConfig::default())
        .direct_dialer(dialer.clone())
        .impersonator(StubImpersonator::negotiating("h2"))
        .plain(plain.clone())
        .build()
        .unwrap();

    let response = transport.round_trip(get("http://example.com/x")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(plain.uris(), vec!["http://example.com/x".to_string()]);
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn https_defaults_to_port_443() {
    let dialer = StubDialer::new("direct", Peer::H2);
    let impersonator = StubImpersonator::negotiating("h2");
    let transport = transport(TransportConfig::default(), dialer.clone(), impersonator.clone());

    transport.round_trip(get("https://example.com/")).await.unwrap();
    transport.round_trip(get("https://[::1]:8443/")).await.unwrap();

    assert_eq!(
        dialer.targets(),
        vec![TargetAddress::new("example.com", 443), TargetAddress::new("::1", 8443)]
    );
    let seen = impersonator.seen();
    assert_eq!(seen[0], ("example.com".to_string(), ProfileId::ChromeAuto, false));
}

#[tokio::test]
async fn h2_end_to_end() {
    let dialer = StubDialer::new("direct", Peer::H2);
    let transport = transport(
        TransportConfig::default(),
        dialer.clone(),
        StubImpersonator::negotiating("h2"),
    );

    let response = transport.round_trip(get("https://example.com/probe")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), Version::HTTP_2);
    assert_eq!(response.headers()["x-path"], "/probe");

    let body = response.into_body().bytes().await.unwrap();
    assert_eq!(&body[..], b"ok");
    assert_eq!(dialer.probe.closes(), 1);
}

#[tokio::test]
async fn http11_and_empty_alpn_speak_http11() {
    for alpn in ["http/1.1", ""] {
        let dialer = StubDialer::new("direct", Peer::H1(H1_OK));
        let transport = transport(
            TransportConfig::default(),
            dialer.clone(),
            StubImpersonator::negotiating(alpn),
        );

        let response = transport.round_trip(get("https://example.com/")).await.unwrap();
        assert_eq!(response.version(), Version::HTTP_11, "alpn {alpn:?}");
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        assert_eq!(dialer.probe.closes(), 0);
        body.close().unwrap();
        assert_eq!(dialer.probe.closes(), 1);
        body.close().unwrap();
        drop(body);
        assert_eq!(dialer.probe.closes(), 1);
    }
}

#[tokio::test]
async fn unknown_alpn_writes_nothing() {
    let dialer = StubDialer::new("direct", Peer::Silent);
    let transport = transport(
        TransportConfig::default(),
        dialer.clone(),
        StubImpersonator::negotiating("h3"),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedProtocol(ref p) if p == "h3"), "{err}");
    assert_eq!(dialer.probe.written(), 0);
    assert_eq!(dialer.probe.closes(), 1);
}

#[tokio::test]
async fn body_close_closes_connection_once_even_when_raw_close_fails() {
    let dialer = StubDialer::new("direct", Peer::Silent);
    let engine = Arc::new(StubEngine::default());
    let transport = Transport::builder(TransportConfig::default())
        .direct_dialer(dialer.clone())
        .impersonator(StubImpersonator::negotiating("h2"))
        .engine(engine.clone())
        .plain(Arc::new(StubPlain::default()))
        .build()
        .unwrap();

    let response = transport.round_trip(get("https://example.com/")).await.unwrap();
    let mut body = response.into_body();
    assert!(body.close().is_err());
    assert_eq!(dialer.probe.closes(), 1);

    assert!(body.close().is_ok());
    drop(body);
    assert_eq!(dialer.probe.closes(), 1);
    assert_eq!(engine.body_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn socks5_proxy_is_always_used_when_configured() {
    let direct = StubDialer::new("direct", Peer::H2);
    let socks = StubDialer::new("socks5", Peer::H2);
    let config = TransportConfig::default()
        .with_proxy_socks5(url::Url::parse("socks5://127.0.0.1:9050").unwrap());
    let transport = Transport::builder(config)
        .direct_dialer(direct.clone())
        .socks5_dialer(socks.clone())
        .impersonator(StubImpersonator::negotiating("h2"))
        .plain(Arc::new(StubPlain::default()))
        .build()
        .unwrap();

    let response = transport.round_trip(get("https://example.com:8443/")).await.unwrap();
    drop(response);

    assert_eq!(socks.targets(), vec![TargetAddress::new("example.com", 8443)]);
    assert!(direct.targets().is_empty());
    assert_eq!(socks.probe.closes(), 1);
}

#[tokio::test]
async fn socks5_dialer_is_ignored_without_proxy_config() {
    let direct = StubDialer::new("direct", Peer::H2);
    let socks = StubDialer::new("socks5", Peer::H2);
    let transport = Transport::builder(TransportConfig::default())
        .direct_dialer(direct.clone())
        .socks5_dialer(socks.clone())
        .impersonator(StubImpersonator::negotiating("h2"))
        .plain(Arc::new(StubPlain::default()))
        .build()
        .unwrap();

    transport.round_trip(get("https://example.com/")).await.unwrap();
    assert_eq!(direct.targets().len(), 1);
    assert!(socks.targets().is_empty());
}

#[tokio::test]
async fn handshake_failure_closes_the_dialed_stream() {
    let dialer = StubDialer::new("direct", Peer::Silent);
    let transport = transport(
        TransportConfig::default().with_profile(ProfileId::Firefox120),
        dialer.clone(),
        StubImpersonator::failing(),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    assert!(matches!(err, Error::Handshake { ref server_name, .. } if server_name == "example.com"));
    assert_eq!(err.stage(), Stage::Handshake);
    assert_eq!(dialer.probe.closes(), 1);
}

#[tokio::test]
async fn dispatch_failure_closes_the_connection() {
    let dialer = StubDialer::new("direct", Peer::H1(b"this is not http\r\n\r\n"));
    let transport = transport(
        TransportConfig::default(),
        dialer.clone(),
        StubImpersonator::negotiating("http/1.1"),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    assert!(matches!(err, Error::Read(_)), "{err}");
    assert_eq!(err.stage(), Stage::Dispatch);
    assert_eq!(dialer.probe.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_dial_times_out() {
    let dialer = StubDialer::slow("direct", Duration::from_secs(30));
    let transport = transport(
        TransportConfig::default().with_timeout(Duration::from_millis(200)),
        dialer.clone(),
        StubImpersonator::negotiating("h2"),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    match &err {
        Error::Dial { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::TimedOut),
        other => panic!("expected dial error, got {other}"),
    }
    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_during_dispatch() {
    let dialer = StubDialer::new("direct", Peer::Silent);
    let transport = transport(
        TransportConfig::default().with_timeout(Duration::from_secs(1)),
        dialer.clone(),
        StubImpersonator::negotiating("http/1.1"),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    assert!(matches!(err, Error::Dispatch(_)), "{err}");
    assert!(err.is_timeout());
    assert_eq!(dialer.probe.closes(), 1);
}

#[tokio::test]
async fn cancellation_interrupts_the_call() {
    let token = CancellationToken::new();
    token.cancel();
    let dialer = StubDialer::new("direct", Peer::H2);
    let transport = transport(
        TransportConfig::default().with_cancel(token),
        dialer.clone(),
        StubImpersonator::negotiating("h2"),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    match &err {
        Error::Dial { source, .. } => assert_eq!(source.kind(), std::io::ErrorKind::Interrupted),
        other => panic!("expected dial error, got {other}"),
    }
    assert!(dialer.targets().is_empty());
}

#[tokio::test]
async fn endless_header_is_cut_off_at_the_head_limit() {
    let dialer = StubDialer::new("direct", Peer::EndlessHeader);
    let transport = transport(
        TransportConfig::default(),
        dialer.clone(),
        StubImpersonator::negotiating("http/1.1"),
    );

    let err = transport.round_trip(get("https://example.com/")).await.unwrap_err();
    match &err {
        Error::Read(source) => assert_eq!(source.kind(), std::io::ErrorKind::InvalidData),
        other => panic!("expected read error, got {other}"),
    }
    assert_eq!(err.stage(), Stage::Dispatch);
    assert_eq!(dialer.probe.closes(), 1);
}

#[tokio::test]
async fn zero_timeout_does_not_expire_requests() {
    for (alpn, peer) in [("h2", Peer::H2), ("http/1.1", Peer::H1(H1_OK))] {
        let dialer = StubDialer::new("direct", peer);
        let transport = transport(
            TransportConfig::default().with_timeout(Duration::ZERO),
            dialer.clone(),
            StubImpersonator::negotiating(alpn),
        );
        assert!(transport.config().timeout.is_none());

        let response = transport.round_trip(get("https://example.com/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "alpn {alpn}");
        let body = response.into_body().bytes().await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
