//! Drives the OpenAI socket link against a local WebSocket server that plays
//! the provider.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::time::Duration;
use studio_realtime::{
    Event, EventKind, ManagerConfig, Provider, RealtimeError, RealtimeManager, SessionStatus,
    StartRequest, TurnDetection,
    upstream::{LinkEvent, LinkOptions, OpenAiConnector, UpstreamConnector},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Message,
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
    },
};

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
    (listener, url)
}

/// Accepts one connection, checking the auth headers on the way in.
async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    accept_hdr_async(stream, |request: &Request, response: Response| {
        let headers = request.headers();
        assert_eq!(headers["authorization"], "Bearer sk-test");
        assert_eq!(headers["openai-beta"], "realtime=v1");
        assert!(request.uri().query().unwrap_or_default().contains("model="));
        Ok(response)
    })
    .await
    .unwrap()
}

async fn next_json(socket: &mut ServerSocket) -> Value {
    loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(_) => panic!("client closed unexpectedly"),
            _ => continue,
        }
    }
}

async fn send_json(socket: &mut ServerSocket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Reads the session.update and acknowledges it like the provider does.
async fn handshake(socket: &mut ServerSocket) -> Value {
    let update = next_json(socket).await;
    assert_eq!(update["type"], "session.update");
    send_json(socket, json!({"type": "session.created", "session": {"id": "sess_1"}})).await;
    send_json(socket, json!({"type": "session.updated", "session": {"id": "sess_1"}})).await;
    update
}

fn link_options() -> LinkOptions {
    LinkOptions {
        session_id: "default".into(),
        provider: Provider::OpenAi,
        model: "gpt-4o-realtime-preview-2024-10-01".into(),
        credential: SecretString::from("sk-test".to_string()),
        voice: "alloy".into(),
        transcription_model: "whisper-1".into(),
        turn_detection: TurnDetection::default(),
        instructions: Some("You are a podcast co-host.".into()),
        temperature: None,
    }
}

#[tokio::test]
async fn test_link_speaks_the_realtime_protocol() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        let update = handshake(&mut socket).await;

        let session = &update["session"];
        assert_eq!(session["modalities"], json!(["text", "audio"]));
        assert_eq!(session["voice"], "alloy");
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["silence_duration_ms"], 500);
        assert!(update["event_id"].as_str().is_some());

        let append = next_json(&mut socket).await;
        assert_eq!(append["type"], "input_audio_buffer.append");
        assert_eq!(append["audio"], "AQID");
        assert_eq!(next_json(&mut socket).await["type"], "input_audio_buffer.commit");
        assert_eq!(next_json(&mut socket).await["type"], "response.create");

        let text = next_json(&mut socket).await;
        assert_eq!(text["type"], "conversation.item.create");
        assert_eq!(text["item"]["role"], "user");
        assert_eq!(text["item"]["content"][0]["type"], "input_text");
        assert_eq!(text["item"]["content"][0]["text"], "hello");

        send_json(&mut socket, json!({"type": "response.created", "response": {}})).await;
        send_json(&mut socket, json!({"type": "response.audio.delta", "delta": "AAA="})).await;
        send_json(&mut socket, json!({"type": "response.audio_transcript.delta", "delta": "Hi"})).await;
        send_json(&mut socket, json!({"type": "rate_limits.updated", "rate_limits": []})).await;
        send_json(
            &mut socket,
            json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "hello"}),
        )
        .await;
        send_json(&mut socket, json!({"type": "response.done", "response": {}})).await;

        // Wait for the client's close frame.
        while let Some(Ok(message)) = socket.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let connector = OpenAiConnector::new(url, Duration::from_secs(2));
    let mut channel = connector.open(link_options()).await.unwrap();
    assert_eq!(channel.events.recv().await, Some(LinkEvent::Ready));
    assert!(channel.link.is_ready());

    channel.link.send_audio(Bytes::from_static(&[1, 2, 3])).await.unwrap();
    channel.link.commit().await.unwrap();
    channel.link.request_response().await.unwrap();
    channel.link.send_text("hello".into()).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 5 {
        match channel.events.recv().await.unwrap() {
            LinkEvent::Event(event) => received.push(event),
            other => panic!("unexpected link event: {other:?}"),
        }
    }
    assert_eq!(
        received,
        vec![
            Event::AssistantSpeechStarted,
            Event::AssistantAudioDelta { audio: "AAA=".into() },
            Event::AssistantTextDelta { text: "Hi".into() },
            Event::UserTranscriptDelta {
                text: "hello".into(),
                is_final: true
            },
            Event::AssistantSpeechStopped,
        ]
    );

    channel.link.close().await;
    assert!(!channel.link.is_ready());
    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_upgrade_is_authentication_failure() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = accept_hdr_async(stream, |_: &Request, _: Response| {
            let mut rejection = ErrorResponse::new(Some("invalid key".to_string()));
            *rejection.status_mut() = StatusCode::UNAUTHORIZED;
            Err(rejection)
        })
        .await;
    });

    let connector = OpenAiConnector::new(url, Duration::from_secs(2));
    let err = connector.open(link_options()).await.err().unwrap();
    assert!(matches!(err, RealtimeError::AuthenticationFailed(_)), "{err:?}");
}

#[tokio::test]
async fn test_provider_error_before_ack_fails_handshake() {
    let (listener, url) = listen().await;
    tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        next_json(&mut socket).await;
        send_json(
            &mut socket,
            json!({
                "type": "error",
                "error": {"type": "invalid_request_error", "code": "invalid_api_key", "message": "Incorrect API key provided: sk-te****"}
            }),
        )
        .await;
        let _ = socket.next().await;
    });

    let connector = OpenAiConnector::new(url, Duration::from_secs(2));
    let mut channel = connector.open(link_options()).await.unwrap();
    match channel.events.recv().await {
        Some(LinkEvent::Failed(RealtimeError::AuthenticationFailed(message))) => {
            assert!(message.contains("Incorrect API key"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    channel.link.close().await;
}

#[tokio::test]
async fn test_manager_session_over_real_socket() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener).await;
        handshake(&mut socket).await;
        send_json(&mut socket, json!({"type": "response.text.delta", "delta": "On air"})).await;
        // Then drop the connection to simulate a network failure.
    });

    let mut config = ManagerConfig::default();
    config.openai.realtime_url = url;
    config.fallback_credential = Some(SecretString::from("sk-test".to_string()));
    config.handshake_timeout = Duration::from_secs(5);
    let manager = RealtimeManager::new(config).unwrap();
    let mut events = manager.subscribe(
        "studio",
        &[EventKind::SessionReady, EventKind::AssistantTextDelta, EventKind::Error],
    );

    let outcome = manager.start("studio", StartRequest::default()).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Active);

    assert!(matches!(events.next().await, Some(Event::SessionReady { .. })));
    assert_eq!(
        events.next().await,
        Some(Event::AssistantTextDelta { text: "On air".into() })
    );
    server.await.unwrap();

    assert!(matches!(events.next().await, Some(Event::Error { .. })));
    assert_eq!(manager.status("studio").status, SessionStatus::Error);

    manager.shutdown().await;
    assert_eq!(events.next().await, None);
}
