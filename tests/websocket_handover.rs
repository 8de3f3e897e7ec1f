//! End-to-end upgrade tests: a client and a server lab connection talking
//! to each other through byte shuttles.

#[macro_use]
mod common;

use common::*;
use http::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderValue, Method};
use std::io;
use std::time::Duration;
use wsgate::codec::Decoder;
use wsgate::http::FullHttpRequest;
use wsgate::net::websocket::{
    ClientHandshakeStateEvent, ClientHandshaker, ClientProtocolConfig, CloseState, Frame,
    FrameCodec, Opcode, ServerHandshakeStateEvent, ServerHandshaker, ServerProtocolConfig,
};
use wsgate::pipeline::{Context, Message, Stage, UserEvent};
use wsgate::Error;

fn scenario_server_config() -> ServerProtocolConfig {
    ServerProtocolConfig::new("/test").subprotocols("test-proto-1, test-proto-2")
}

fn scenario_client_config() -> ClientProtocolConfig {
    ClientProtocolConfig::new("ws://localhost:1234/test")
        .expect("valid url")
        .subprotocol("test-proto-2")
}

/// Starts the closing handshake as soon as the client handshake completes.
struct CloseOnComplete;

impl Stage for CloseOnComplete {
    fn on_user_event(&mut self, ctx: &mut Context<'_>, event: UserEvent) {
        if matches!(
            event,
            UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeComplete)
        ) {
            if let Some(handshaker) = ctx.attr::<ClientHandshaker>() {
                handshaker.close(ctx, Frame::close(Some(1000), None));
            }
        }
        ctx.fire_user_event(event);
    }
}

/// Writes a close frame on handshake completion but leaves the flush to
/// the caller.
struct WriteCloseOnComplete;

impl Stage for WriteCloseOnComplete {
    fn on_user_event(&mut self, ctx: &mut Context<'_>, event: UserEvent) {
        if matches!(
            event,
            UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeComplete)
        ) {
            ctx.write(Frame::close(Some(1000), None));
        }
        ctx.fire_user_event(event);
    }
}

fn drain_bytes(conn: &mut wsgate::pipeline::LabConnection) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::new();
    for chunk in conn.drain_outbound() {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

fn decode_client_frames(wire: bytes::Bytes) -> Vec<Frame> {
    let mut buf = bytes::BytesMut::from(&wire[..]);
    let mut codec = FrameCodec::server();
    std::iter::from_fn(|| codec.decode(&mut buf).expect("client frame decodes")).collect()
}

#[test]
fn handshake_negotiates_subprotocol_and_reports_request() {
    init_test_logging();
    test_phase!("handshake_negotiates_subprotocol_and_reports_request");

    let (mut server, server_protocol) = server_pipeline(scenario_server_config(), PassThrough);
    let (mut client, client_protocol) = client_pipeline(scenario_client_config(), PassThrough);
    server.activate();
    client.activate();

    test_section!("request");
    assert!(transfer_all(&mut client, &mut server));
    assert!(server_protocol.handshake_future().is_success());
    match server.take_user_events().as_slice() {
        [UserEvent::ServerHandshake(ServerHandshakeStateEvent::HandshakeComplete), UserEvent::ServerHandshakeComplete(done)] =>
        {
            assert_eq!(done.request_uri(), "/test");
            assert_eq!(done.selected_subprotocol(), Some("test-proto-2"));
            assert_with_log!(
                done.request_headers().len() == 8,
                "request header count",
                8,
                done.request_headers().len()
            );
        }
        other => panic!("unexpected server events: {other:?}"),
    }
    let server_handshaker = server.attr::<ServerHandshaker>().expect("handshaker recorded");
    assert_eq!(server_handshaker.websocket_url(), "ws://localhost:1234/test");

    test_section!("response");
    assert!(transfer_all(&mut server, &mut client));
    assert!(client_protocol.handshake_future().is_success());
    match client.take_user_events().as_slice() {
        [UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeIssued), UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeComplete), UserEvent::ClientHandshakeComplete(done)] => {
            assert_eq!(done.selected_subprotocol(), Some("test-proto-2"));
        }
        other => panic!("unexpected client events: {other:?}"),
    }
    assert_eq!(
        client_protocol.handshaker().actual_subprotocol().as_deref(),
        Some("test-proto-2")
    );
    assert_eq!(
        server.pipeline_names(),
        ["ws-decoder", "ws-encoder", "ws-protocol", "user"]
    );
    assert_eq!(
        client.pipeline_names(),
        ["ws-decoder", "ws-encoder", "ws-protocol", "user"]
    );
    assert_eq!(server.executor().armed_timers(), 0);
    assert_eq!(client.executor().armed_timers(), 0);

    test_section!("frames");
    client.write_outbound(Frame::text("hello server"));
    assert!(transfer_all(&mut client, &mut server));
    let frame = server.read_inbound().and_then(|m| m.as_frame().cloned()).unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(&frame.payload[..], b"hello server");

    server.write_outbound(Frame::binary(vec![1u8, 2, 3]));
    assert!(transfer_all(&mut server, &mut client));
    let frame = client.read_inbound().and_then(|m| m.as_frame().cloned()).unwrap();
    assert_eq!(frame.opcode, Opcode::Binary);

    // The server answers pings; the client swallows the pong.
    client.write_outbound(Frame::ping("are you there"));
    assert!(transfer_all(&mut client, &mut server));
    assert!(server.read_inbound().is_none());
    assert!(transfer_all(&mut server, &mut client));
    assert!(client.read_inbound().is_none());

    assert!(!server.finish_and_release_all());
    assert!(!client.finish_and_release_all());
    test_complete!("handshake_negotiates_subprotocol_and_reports_request");
}

#[test]
fn client_times_out_when_server_never_answers() {
    init_test_logging();
    test_phase!("client_times_out_when_server_never_answers");

    let config = scenario_client_config().handshake_timeout(Duration::from_millis(100));
    let (mut client, protocol) = client_pipeline(config, PassThrough);
    client.activate();
    assert!(!client.drain_outbound().is_empty());

    client.advance_time_by(Duration::from_millis(99));
    assert!(!protocol.handshake_future().is_done());

    client.advance_time_by(Duration::from_millis(1));
    assert_eq!(client.executor().armed_timers(), 0);

    let cause = protocol.handshake_future().cause().expect("handshake failed");
    assert!(cause.is_handshake_timeout());
    let events = client.take_user_events();
    assert!(matches!(
        events.as_slice(),
        [
            UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeIssued),
            UserEvent::ClientHandshake(ClientHandshakeStateEvent::HandshakeTimeout)
        ]
    ));
    assert!(client.read_inbound().is_none());
    assert!(!client.is_active());
    assert!(!protocol.handshaker().is_handshake_complete());
    assert!(!client.finish_and_release_all());
    test_complete!("client_times_out_when_server_never_answers");
}

#[test]
fn unanswered_close_is_forced_and_late_close_ignored() {
    init_test_logging();
    test_phase!("unanswered_close_is_forced_and_late_close_ignored");

    let swallower = CloseSwallower::default();
    let (mut server, _server_protocol) = server_pipeline(
        scenario_server_config().handle_close_frames(false),
        swallower.clone(),
    );
    let client_config = scenario_client_config()
        .handle_close_frames(false)
        .force_close_timeout(Some(Duration::from_millis(20)));
    let (mut client, client_protocol) = client_pipeline(client_config, CloseOnComplete);
    server.activate();
    client.activate();

    test_section!("handshake");
    assert!(transfer_all(&mut client, &mut server));
    assert!(transfer_all(&mut server, &mut client));
    let tracker = client_protocol.handshaker().close_tracker().clone();
    assert_eq!(tracker.state(), CloseState::CloseSent);

    test_section!("close goes unanswered");
    assert!(transfer_all(&mut client, &mut server));
    assert!(swallower.seen().iter().any(Frame::is_close));
    assert!(!transfer_all(&mut server, &mut client));

    client.advance_time_by(Duration::from_millis(19));
    assert!(client.is_active());
    client.advance_time_by(Duration::from_millis(1));
    assert!(!client.is_active());
    assert_eq!(tracker.state(), CloseState::ForceClosed);
    assert!(client_protocol.handshaker().is_force_close_complete());

    test_section!("late close");
    server.write_outbound(Frame::close(Some(1000), None));
    assert!(transfer_all(&mut server, &mut client));
    assert_eq!(tracker.state(), CloseState::ForceClosed);
    assert!(client.read_inbound().is_none());
    assert!(client.drain_outbound().is_empty());

    assert!(!client.finish_and_release_all());
    assert!(!server.finish_and_release_all());
    test_complete!("unanswered_close_is_forced_and_late_close_ignored");
}

#[test]
fn answered_close_cancels_force_close() {
    init_test_logging();
    let (mut server, _server_protocol) = server_pipeline(scenario_server_config(), PassThrough);
    let client_config =
        scenario_client_config().force_close_timeout(Some(Duration::from_millis(20)));
    let (mut client, client_protocol) = client_pipeline(client_config, CloseOnComplete);
    server.activate();
    client.activate();

    assert!(transfer_all(&mut client, &mut server));
    assert!(transfer_all(&mut server, &mut client));
    assert!(transfer_all(&mut client, &mut server));

    // The server echoes the close and hangs up; the echo completes the client side.
    assert!(!server.is_active());
    assert!(transfer_all(&mut server, &mut client));
    assert!(!client.is_active());

    client.advance_time_by(Duration::from_millis(50));
    let handshaker = client_protocol.handshaker();
    assert_eq!(handshaker.close_tracker().state(), CloseState::CloseExchanged);
    assert!(!handshaker.is_force_close_complete());
    assert_eq!(client.executor().armed_timers(), 0);
}

#[test]
fn delivered_close_answer_ends_connection() {
    init_test_logging();
    test_phase!("delivered_close_answer_ends_connection");

    let (mut server, _server_protocol) = server_pipeline(scenario_server_config(), PassThrough);
    let client_config = scenario_client_config()
        .handle_close_frames(false)
        .force_close_timeout(Some(Duration::from_millis(20)));
    let (mut client, client_protocol) = client_pipeline(client_config, CloseOnComplete);
    server.activate();
    client.activate();

    assert!(transfer_all(&mut client, &mut server));
    assert!(transfer_all(&mut server, &mut client));
    let tracker = client_protocol.handshaker().close_tracker().clone();
    assert_eq!(tracker.state(), CloseState::CloseSent);

    test_section!("server echoes");
    assert!(transfer_all(&mut client, &mut server));
    assert!(!server.is_active());
    assert!(transfer_all(&mut server, &mut client));

    let delivered = std::iter::from_fn(|| client.read_inbound())
        .filter_map(|msg| msg.as_frame().cloned())
        .find(Frame::is_close)
        .expect("peer close delivered to the application");
    assert_eq!(delivered.close_code(), Some(1000));
    assert!(!client.is_active());
    assert_eq!(tracker.state(), CloseState::CloseExchanged);
    assert_eq!(client.executor().armed_timers(), 0);

    client.advance_time_by(Duration::from_secs(60));
    assert!(!client_protocol.handshaker().is_force_close_complete());
    assert_eq!(tracker.state(), CloseState::CloseExchanged);
    test_complete!("delivered_close_answer_ends_connection");
}

#[test]
fn zero_grace_close_still_reaches_the_wire() {
    init_test_logging();
    test_phase!("zero_grace_close_still_reaches_the_wire");

    let swallower = CloseSwallower::default();
    let (mut server, _server_protocol) = server_pipeline(
        scenario_server_config().handle_close_frames(false),
        swallower.clone(),
    );
    let client_config = scenario_client_config().force_close_timeout(Some(Duration::ZERO));
    let (mut client, client_protocol) = client_pipeline(client_config, CloseOnComplete);
    server.activate();
    client.activate();

    assert!(transfer_all(&mut client, &mut server));
    assert!(transfer_all(&mut server, &mut client));

    // Forced on the turn after the flush, with the close already queued.
    let tracker = client_protocol.handshaker().close_tracker().clone();
    assert_eq!(tracker.state(), CloseState::ForceClosed);
    assert!(!client.is_active());
    let wire = drain_bytes(&mut client);
    let sent = decode_client_frames(wire.clone());
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_close());
    assert_eq!(sent[0].close_code(), Some(1000));

    test_section!("server receives the close");
    server.write_inbound(wire);
    assert!(swallower.seen().iter().any(Frame::is_close));
    test_complete!("zero_grace_close_still_reaches_the_wire");
}

#[test]
fn zero_grace_timer_waits_for_the_flush() {
    init_test_logging();
    test_phase!("zero_grace_timer_waits_for_the_flush");

    let (mut server, _server_protocol) = server_pipeline(scenario_server_config(), PassThrough);
    let client_config = scenario_client_config().force_close_timeout(Some(Duration::ZERO));
    let (mut client, client_protocol) = client_pipeline(client_config, WriteCloseOnComplete);
    server.activate();
    client.activate();

    assert!(transfer_all(&mut client, &mut server));
    assert!(transfer_all(&mut server, &mut client));

    let tracker = client_protocol.handshaker().close_tracker().clone();
    assert_eq!(tracker.state(), CloseState::CloseSent);
    assert!(client.is_active());
    assert_eq!(client.executor().armed_timers(), 0);
    assert!(client.read_outbound().is_none());

    test_section!("flush");
    client.flush();
    assert_eq!(tracker.state(), CloseState::ForceClosed);
    assert!(!client.is_active());
    let sent = decode_client_frames(drain_bytes(&mut client));
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_close());
    test_complete!("zero_grace_timer_waits_for_the_flush");
}

#[test]
fn server_write_failure_fails_handshake() {
    init_test_logging();
    let (mut server, protocol) = server_pipeline(scenario_server_config(), PassThrough);
    let (mut client, _client_protocol) = client_pipeline(scenario_client_config(), PassThrough);
    server.activate();
    client.activate();
    server.set_write_failure(Some(Error::from(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "reset by peer",
    ))));

    assert!(transfer_all(&mut client, &mut server));

    let cause = protocol.handshake_future().cause().expect("handshake failed");
    assert_eq!(cause.io_kind(), Some(io::ErrorKind::ConnectionReset));
    assert_eq!(server.errors().len(), 1);
    assert!(server.user_events().is_empty());
    assert_eq!(server.executor().armed_timers(), 0);
    assert!(server.drain_outbound().is_empty());
}

fn upgrade_request(method: Method, uri: &str, version: &'static str) -> FullHttpRequest {
    FullHttpRequest::new(method, uri)
        .with_header(HOST, HeaderValue::from_static("localhost:1234"))
        .with_header(UPGRADE, HeaderValue::from_static("websocket"))
        .with_header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .with_header(
            SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        )
        .with_header(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(version))
}

#[test]
fn request_released_once_on_every_branch() {
    init_test_logging();
    let cases = [
        ("forbidden", Method::POST, "/test", "13"),
        ("unsupported version", Method::GET, "/test", "8"),
        ("admitted", Method::GET, "/test", "13"),
        ("pass-through", Method::GET, "/elsewhere", "13"),
    ];
    for (branch, method, uri, version) in cases {
        test_section!(branch);
        let counter = DropCounter::default();
        let (mut server, _protocol) = server_pipeline(scenario_server_config(), PassThrough);
        server.activate();

        let request = upgrade_request(method, uri, version)
            .with_body(counter.tracked_body(b"upgrade body"));
        server.write_inbound_message(Message::Request(request));

        // Whatever reached the application is the application's to release.
        while let Some(msg) = server.read_inbound() {
            drop(msg);
        }
        server.drain_outbound();
        assert_with_log!(
            counter.drops() == 1,
            format!("{branch}: request released once"),
            1,
            counter.drops()
        );
        server.finish_and_release_all();
        assert_eq!(counter.drops(), 1, "{branch}: no second release");
    }
}
