use podium::config::ServerConfig;
use podium::protocol::{ClientMessage, ServerMessage};
use podium::quiz::Quiz;
use podium::services::{ServiceContext, ServiceDescriptor};
use podium::sessions::{Outbound, SessionHandle};
use podium::types::address;
use podium::ws::handlers::handle_message;
use podium::ws::BridgeSession;
use podium::{InteractionServer, LifecycleState, ServerHandle};
use serde_json::{json, Value};
use serial_test::serial;
use std::time::Duration;
use tokio::sync::mpsc;

struct Attendee {
    session: BridgeSession,
    rx: mpsc::Receiver<Outbound>,
}

async fn start_server() -> ServerHandle {
    if let Some(previous) = InteractionServer::current() {
        previous.stop().await;
        previous.release().expect("previous server should release");
    }
    let server = InteractionServer::create("127.0.0.1", 0, ServerConfig::default())
        .expect("server should be created");
    server
        .start(&ServiceDescriptor::defaults())
        .await
        .expect("server should start");
    server
}

async fn shutdown(server: ServerHandle) {
    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
    server.release().expect("stopped server should release");
}

/// Connect an attendee the way the WebSocket bridge does
async fn join(ctx: &ServiceContext, name: &str, channels: &[&str]) -> Attendee {
    let session = BridgeSession {
        id: format!("session-{}", name),
        nickname: name.to_string(),
    };
    let (handle, rx) = SessionHandle::channel(16);
    ctx.sessions.register(&session.id, handle).await;

    for channel in channels {
        let response = handle_message(
            ClientMessage::Subscribe {
                address: channel.to_string(),
            },
            &session,
            ctx,
        )
        .await;
        assert!(
            matches!(response, Some(ServerMessage::Subscribed { .. })),
            "subscribe to {} failed: {:?}",
            channel,
            response
        );
    }
    Attendee { session, rx }
}

async fn submit(ctx: &ServiceContext, attendee: &Attendee, quiz_id: u64, answers: &[u64]) -> Value {
    let response = handle_message(
        ClientMessage::Send {
            address: address::QUIZ_SUBMIT.to_string(),
            body: json!({ "quiz_id": quiz_id, "answers": answers }),
            reply_id: Some(format!("{}-submit", attendee.session.id)),
        },
        &attendee.session,
        ctx,
    )
    .await;
    match response {
        Some(ServerMessage::Reply { body, .. }) => body,
        other => panic!("Expected reply, got {:?}", other),
    }
}

async fn next_event(attendee: &mut Attendee) -> Outbound {
    tokio::time::timeout(Duration::from_secs(1), attendee.rx.recv())
        .await
        .expect("event should arrive")
        .expect("session queue should be open")
}

fn two_of_three() -> Quiz {
    Quiz::new("Which of these are prime?")
        .with_answer("1", false)
        .with_answer("2", true)
        .with_answer("3", true)
}

/// End-to-end quiz round: publish, three attendees answer, close
#[tokio::test]
#[serial]
async fn test_quiz_round() {
    let server = start_server().await;
    let ctx = server.context();
    let mut results = server.bus().consumer(address::QUIZ_RESULTS).unwrap();

    let mut alice = join(&ctx, "alice", &[address::QUIZ_PUBLISH, address::QUIZ_CLOSE]).await;
    let mut bob = join(&ctx, "bob", &[address::QUIZ_PUBLISH, address::QUIZ_CLOSE]).await;
    let mut carol = join(&ctx, "carol", &[address::QUIZ_PUBLISH]).await;

    // 1. Presenter publishes
    let quiz = two_of_three();
    let published = server
        .bus()
        .request(address::QUIZ_PUBLISH, json!(quiz))
        .await
        .unwrap();
    assert_eq!(published["delivered"], 3);

    // 2. Attendees see the question without the solution
    for attendee in [&mut alice, &mut bob, &mut carol] {
        let event = next_event(attendee).await;
        assert_eq!(event.channel, address::QUIZ_PUBLISH);
        assert_eq!(event.payload["id"], json!(quiz.id));
        assert_eq!(event.payload["correct_answers"], 2);
        assert!(event.payload["answers"][1].get("correct").is_none());
    }

    let empty = results.recv().await.unwrap();
    assert_eq!(empty["correct"], 0);
    assert_eq!(empty["incorrect"], 0);

    // 3. Attendees answer
    assert_eq!(submit(&ctx, &alice, quiz.id, &[2, 3]).await["accepted"], true);
    assert_eq!(submit(&ctx, &bob, quiz.id, &[1]).await["accepted"], true);
    assert_eq!(submit(&ctx, &carol, quiz.id, &[2, 3, 1]).await["accepted"], true);

    // 4. Presenter closes and gets the final tally
    let tally = server
        .bus()
        .request(address::QUIZ_CLOSE, json!({ "quiz_id": quiz.id }))
        .await
        .unwrap();
    assert_eq!(tally["correct"], 1);
    assert_eq!(tally["incorrect"], 2);
    assert_eq!(tally["closed"], true);
    assert_eq!(tally["entries"]["session-alice"], true);

    let closed = next_event(&mut alice).await;
    assert_eq!(closed.channel, address::QUIZ_CLOSE);
    assert_eq!(closed.payload["quiz_id"], json!(quiz.id));

    // 5. Late answers are dropped
    assert_eq!(submit(&ctx, &bob, quiz.id, &[2, 3]).await["accepted"], false);
    let current = server
        .bus()
        .request(address::QUIZ_CURRENT, json!({}))
        .await
        .unwrap();
    assert_eq!(current["active"], false);

    shutdown(server).await;
}

#[tokio::test]
#[serial]
async fn test_last_answer_wins() {
    let server = start_server().await;
    let ctx = server.context();
    let alice = join(&ctx, "alice", &[]).await;

    let quiz = two_of_three();
    server
        .bus()
        .request(address::QUIZ_PUBLISH, json!(quiz))
        .await
        .unwrap();

    submit(&ctx, &alice, quiz.id, &[1]).await;
    submit(&ctx, &alice, quiz.id, &[3, 2]).await;

    let tally = server
        .bus()
        .request(address::QUIZ_CLOSE, json!({ "quiz_id": quiz.id }))
        .await
        .unwrap();
    assert_eq!(tally["correct"], 1);
    assert_eq!(tally["incorrect"], 0);
    assert_eq!(tally["entries"].as_object().unwrap().len(), 1);
    assert_eq!(tally["entries"]["session-alice"], true);

    shutdown(server).await;
}

#[tokio::test]
#[serial]
async fn test_late_joiner_gets_current_quiz() {
    let server = start_server().await;
    let ctx = server.context();

    let quiz = two_of_three();
    server
        .bus()
        .request(address::QUIZ_PUBLISH, json!(quiz))
        .await
        .unwrap();

    let late = join(&ctx, "late", &[address::QUIZ_PUBLISH]).await;
    let response = handle_message(
        ClientMessage::Send {
            address: address::QUIZ_CURRENT.to_string(),
            body: json!({}),
            reply_id: Some("current".to_string()),
        },
        &late.session,
        &ctx,
    )
    .await;
    match response {
        Some(ServerMessage::Reply { body, .. }) => {
            assert_eq!(body["active"], true);
            assert_eq!(body["quiz"]["question"]["text"], "Which of these are prime?");
        }
        other => panic!("Expected reply, got {:?}", other),
    }

    shutdown(server).await;
}

#[tokio::test]
#[serial]
async fn test_chat_round_trip() {
    let server = start_server().await;
    let ctx = server.context();
    let mut presenter_inbox = server.bus().consumer(address::CHAT_PRESENTER_INBOX).unwrap();

    let mut alice = join(&ctx, "alice", &[address::CHAT_ATTENDEE_INBOX]).await;
    let mut bob = join(&ctx, "bob", &[address::CHAT_ATTENDEE_INBOX]).await;

    // Attendee question reaches the presenter, stamped with the session
    handle_message(
        ClientMessage::Send {
            address: address::CHAT_TO_PRESENTER.to_string(),
            body: json!({ "body": "Is there a recording?" }),
            reply_id: None,
        },
        &alice.session,
        &ctx,
    )
    .await;
    let question = tokio::time::timeout(Duration::from_secs(1), presenter_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(question["origin"], "session-alice");
    assert_eq!(question["author"], "alice");
    assert_eq!(question["direction"], "ATTENDEE_TO_PRESENTER");

    // Presenter answers everybody
    let reply = server
        .bus()
        .request(
            address::CHAT_TO_ATTENDEES,
            json!({ "author": "Presenter", "body": "Yes, tomorrow" }),
        )
        .await
        .unwrap();
    assert_eq!(reply["delivered"], 2);

    for attendee in [&mut alice, &mut bob] {
        let event = next_event(attendee).await;
        assert_eq!(event.channel, address::CHAT_ATTENDEE_INBOX);
        assert_eq!(event.payload["body"], "Yes, tomorrow");
    }

    // Attendees may not impersonate the presenter
    let forbidden = handle_message(
        ClientMessage::Send {
            address: address::CHAT_TO_ATTENDEES.to_string(),
            body: json!({ "body": "spam" }),
            reply_id: None,
        },
        &bob.session,
        &ctx,
    )
    .await;
    assert!(matches!(forbidden, Some(ServerMessage::Error { .. })));

    shutdown(server).await;
}

#[tokio::test]
#[serial]
async fn test_stop_closes_sessions() {
    let server = start_server().await;
    let ctx = server.context();
    let mut alice = join(&ctx, "alice", &[address::QUIZ_PUBLISH]).await;
    assert_eq!(server.sessions().len().await, 1);

    server.stop().await;
    assert!(server.sessions().is_empty().await);
    assert!(alice.rx.recv().await.is_none());

    // Stopping again changes nothing
    server.stop().await;
    assert_eq!(server.state(), LifecycleState::Stopped);
    server.release().unwrap();
}
