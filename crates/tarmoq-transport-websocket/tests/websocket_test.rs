//! Loopback tests: a real websocket client talking to a live broker

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tarmoq_auth::StaticTokenStore;
use tarmoq_control::{Broker, BrokerConfig};
use tarmoq_proto::{ControlCodec, ControlMessage, ForwardRequest, ForwardResponse};
use tarmoq_transport_websocket::{WebSocketConfig, WebSocketListener};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn start() -> (Arc<Broker>, SocketAddr, CancellationToken) {
    init_tracing();
    let store = StaticTokenStore::new().with_token("tok-a", "alice");
    let broker = Arc::new(Broker::new(
        BrokerConfig::default().with_public_host("tarmoq.test"),
        Arc::new(store),
    ));

    let listener = WebSocketListener::bind(WebSocketConfig::new(SocketAddr::from((
        [127, 0, 0, 1],
        0,
    ))))
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(listener.serve(broker.clone(), shutdown.clone()));
    (broker, addr, shutdown)
}

async fn connect(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> Client {
    let mut request = format!("ws://{}{}", addr, path).into_client_request().unwrap();
    for (name, value) in headers {
        request.headers_mut().insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    let (client, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    client
}

async fn next_message(client: &mut Client) -> ControlMessage {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for broker")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Text(text) => return ControlCodec::decode_message(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected message {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_agent_receives_created() {
    let (broker, addr, shutdown) = start().await;
    let mut client = connect(
        addr,
        "/server",
        &[("Authorization", "Bearer tok-a"), ("Subdomain", "MyApp")],
    )
    .await;

    match next_message(&mut client).await {
        ControlMessage::Created { public_url } => {
            assert_eq!(public_url, "https://myapp.tarmoq.test/")
        }
        other => panic!("Expected CREATED, got {:?}", other),
    }
    assert_eq!(broker.session_count(), 1);

    client.close(None).await.unwrap();
    for _ in 0..50 {
        if broker.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(broker.session_count(), 0);
    assert!(broker.tunnels().is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn test_bad_token_gets_fatal_error_and_close() {
    let (broker, addr, shutdown) = start().await;
    let mut client = connect(addr, "/server", &[("Authorization", "Bearer nope")]).await;

    match next_message(&mut client).await {
        ControlMessage::Error { fatal, .. } => assert!(fatal),
        other => panic!("Expected ERROR, got {:?}", other),
    }

    let closed = timeout(WAIT, async {
        while let Some(message) = client.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(broker.session_count(), 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let (_broker, addr, shutdown) = start().await;
    let request = format!("ws://{}/nope", addr).into_client_request().unwrap();
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
    shutdown.cancel();
}

#[tokio::test]
async fn test_forward_round_trip() {
    let (broker, addr, shutdown) = start().await;
    let mut client = connect(
        addr,
        "/server",
        &[("authorization", "Bearer tok-a"), ("custom-subdomain", "echo")],
    )
    .await;
    next_message(&mut client).await;

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .route_http("echo", ForwardRequest::new("GET", "/ping"))
                .await
        })
    };

    let request_id = match next_message(&mut client).await {
        ControlMessage::Forward {
            request_id,
            request,
        } => {
            assert_eq!(request.path, "/ping");
            request_id
        }
        other => panic!("Expected FORWARD, got {:?}", other),
    };

    let reply = ControlCodec::encode_response(&ForwardResponse::new(request_id, 200, "pong"))
        .unwrap();
    client.send(Message::Text(reply)).await.unwrap();

    let response = timeout(WAIT, caller).await.unwrap().unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "pong");
    shutdown.cancel();
}
