mod support;

use std::sync::Arc;

use chat_client::{
    ChatClient, ChatError, ClientEvent, ClientSettings, ConnectionState, DeliveryState,
    HistoryOutcome, LocalId, MessageKey, SignedOut,
};
use shared::{
    domain::{ChatId, MessageId, UserId},
    protocol::ClientRequest,
};
use support::{eventually, wire, FakeChatApi, FakeTransport, Harness, OpenStep, ME};

fn ids(messages: &[chat_client::Message]) -> Vec<String> {
    messages.iter().map(|message| message.id.to_string()).collect()
}

#[tokio::test]
async fn send_while_disconnected_is_flushed_after_join_and_confirmed_once() {
    let mut h = Harness::new([OpenStep::Accept]);
    let history = h
        .client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");
    assert_eq!(
        history.wait().await,
        Ok(HistoryOutcome::Merged { inserted: 0 })
    );

    let local_id = h.client.send_message("  hello ").await.expect("queued send");
    assert_eq!(local_id, LocalId(1));
    let snapshot = h.client.session().await.expect("session");
    assert_eq!(snapshot.queued_sends, 1);
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "hello");
    assert_eq!(snapshot.messages[0].delivery_state, DeliveryState::Pending);
    assert!(h.api.sends().is_empty());

    h.client.connect().await.expect("connect");
    let mut server = h.next_server().await;
    assert_eq!(
        server.next_request().await,
        ClientRequest::JoinChat {
            chat_id: ChatId::new("c-1"),
        }
    );
    assert_eq!(
        h.wait_for_event(|event| matches!(event, ClientEvent::SendConfirmed { .. }))
            .await,
        ClientEvent::SendConfirmed {
            local_id,
            message_id: MessageId::new("S42"),
        }
    );

    let (_, request) = h.api.sends().into_iter().next().expect("one send");
    let mut echo = wire("S42", ME, "hello", 142);
    echo.client_ref = request.client_ref;
    server.push("c-1", echo);
    server.push("c-1", wire("S50", "u-bob", "hey", 150));

    let client = Arc::clone(&h.client);
    eventually(|| {
        let client = Arc::clone(&client);
        async move { client.messages().await.len() == 2 }
    })
    .await;

    let messages = h.client.messages().await;
    assert_eq!(ids(&messages), vec!["S42", "S50"]);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[0].delivery_state, DeliveryState::Confirmed);
    assert!(messages[0].sent_by_me());
    assert!(!messages[1].sent_by_me());
    assert_eq!(h.api.sends().len(), 1);
    assert_eq!(
        h.client.session().await.map(|s| (s.pending_sends, s.queued_sends)),
        Some((0, 0))
    );
}

#[tokio::test]
async fn history_and_live_messages_merge_without_duplicates() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    let mut server = h.next_server().await;
    let release = h.api.hold_history("c-1");

    let history = h
        .client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");
    server.next_request().await;
    server.push("c-1", wire("S3", "u-bob", "third", 30));

    let client = Arc::clone(&h.client);
    eventually(|| {
        let client = Arc::clone(&client);
        async move { client.messages().await.len() == 1 }
    })
    .await;

    release
        .send(vec![
            wire("S1", "u-bob", "first", 10),
            wire("S2", ME, "second", 20),
            wire("S3", "u-bob", "third", 30),
        ])
        .expect("release history");

    assert_eq!(
        history.wait().await,
        Ok(HistoryOutcome::Merged { inserted: 2 })
    );
    let messages = h.client.messages().await;
    assert_eq!(ids(&messages), vec!["S1", "S2", "S3"]);
    assert!(messages[1].sent_by_me());
    assert_eq!(messages[0].sender_name, "bob");
}

#[tokio::test]
async fn failed_history_keeps_live_messages() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    let mut server = h.next_server().await;
    h.api.fail_history("c-1");
    let release = h.api.hold_history("c-1");

    let history = h
        .client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");
    server.next_request().await;
    server.push("c-1", wire("S5", "u-bob", "still here", 50));

    let client = Arc::clone(&h.client);
    eventually(|| {
        let client = Arc::clone(&client);
        async move { client.messages().await.len() == 1 }
    })
    .await;
    release.send(Vec::new()).expect("release history");

    match history.wait().await {
        Err(ChatError::HistoryFetch { chat_id, reason }) => {
            assert_eq!(chat_id, ChatId::new("c-1"));
            assert!(reason.contains("history unavailable"), "{reason}");
        }
        other => panic!("expected a history error, got {other:?}"),
    }
    let failed = h
        .wait_for_event(|event| matches!(event, ClientEvent::HistoryFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        ClientEvent::HistoryFailed { chat_id, .. } if chat_id == ChatId::new("c-1")
    ));

    let messages = h.client.messages().await;
    assert_eq!(ids(&messages), vec!["S5"]);
    assert_eq!(messages[0].content, "still here");
    assert!(h.client.session().await.is_some());
}

#[tokio::test]
async fn switching_chats_discards_the_stale_history() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    let mut server = h.next_server().await;
    let release_a = h.api.hold_history("c-a");
    h.api.set_history("c-b", vec![wire("B1", "u-bob", "in b", 5)]);

    let history_a = h
        .client
        .open_chat(ChatId::new("c-a"))
        .await
        .expect("open a");
    let history_b = h
        .client
        .open_chat(ChatId::new("c-b"))
        .await
        .expect("open b");
    assert!(!history_a.is_finished());
    let _ = release_a.send(vec![wire("A1", "u-bob", "in a", 1)]);

    assert_eq!(history_a.wait().await, Ok(HistoryOutcome::Discarded));
    assert_eq!(
        history_b.wait().await,
        Ok(HistoryOutcome::Merged { inserted: 1 })
    );
    assert_eq!(ids(&h.client.messages().await), vec!["B1"]);
    assert_eq!(
        h.client.session().await.map(|s| s.chat_id),
        Some(ChatId::new("c-b"))
    );

    assert_eq!(
        server.next_request().await,
        ClientRequest::JoinChat {
            chat_id: ChatId::new("c-a"),
        }
    );
    assert_eq!(
        server.next_request().await,
        ClientRequest::LeaveChat {
            chat_id: ChatId::new("c-a"),
        }
    );
    assert_eq!(
        server.next_request().await,
        ClientRequest::JoinChat {
            chat_id: ChatId::new("c-b"),
        }
    );
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn live_message_for_another_chat_is_ignored() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    let server = h.next_server().await;
    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat")
        .wait()
        .await
        .expect("history");

    server.push("c-other", wire("X1", "u-bob", "elsewhere", 1));
    server.push("c-1", wire("S1", "u-bob", "here", 2));

    let client = Arc::clone(&h.client);
    eventually(|| {
        let client = Arc::clone(&client);
        async move { !client.messages().await.is_empty() }
    })
    .await;
    assert_eq!(ids(&h.client.messages().await), vec!["S1"]);
}

#[tokio::test]
async fn rejected_send_stays_visible_as_failed() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.api.reject_content("spam");
    h.client.connect().await.expect("connect");
    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");

    let err = h.client.send_message("spam").await.expect_err("rejected");

    assert!(matches!(err, ChatError::SendFailure { local_id: LocalId(1), .. }));
    assert!(matches!(
        h.wait_for_event(|event| matches!(event, ClientEvent::SendFailed { .. }))
            .await,
        ClientEvent::SendFailed {
            local_id: LocalId(1),
            ..
        }
    ));
    let messages = h.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageKey::Provisional(LocalId(1)));
    assert_eq!(messages[0].delivery_state, DeliveryState::Failed);
}

#[tokio::test]
async fn connected_send_confirms_from_the_ack() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");

    let local_id = h.client.send_message("hi there").await.expect("send");

    let messages = h.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, MessageKey::Canonical(MessageId::new("S42")));
    assert_eq!(messages[0].delivery_state, DeliveryState::Confirmed);
    assert_eq!(local_id, LocalId(1));
}

#[tokio::test]
async fn input_validation_happens_before_any_side_effect() {
    let h = Harness::new([OpenStep::Accept]);

    assert_eq!(
        h.client.send_message("hello").await,
        Err(ChatError::NoActiveChat)
    );
    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");
    assert_eq!(h.client.send_message("   ").await, Err(ChatError::EmptyMessage));
    assert!(h.client.messages().await.is_empty());
}

#[tokio::test]
async fn signed_out_client_makes_no_attempt() {
    let (transport, _servers) = FakeTransport::new([]);
    let api = FakeChatApi::new();
    let client = ChatClient::new(
        Arc::new(SignedOut),
        transport.clone(),
        api.clone(),
        ClientSettings::default(),
    );

    assert_eq!(client.connect().await, Err(ChatError::AuthMissing));
    assert!(matches!(
        client.open_chat(ChatId::new("c-1")).await,
        Err(ChatError::AuthMissing)
    ));
    assert_eq!(
        client.send_message("hello").await,
        Err(ChatError::AuthMissing)
    );
    assert_eq!(transport.opens(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn opening_a_chat_connects_in_the_background() {
    let mut h = Harness::with_settings([OpenStep::Accept], ClientSettings::default());

    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");

    let mut server = h.next_server().await;
    assert_eq!(
        server.next_request().await,
        ClientRequest::JoinChat {
            chat_id: ChatId::new("c-1"),
        }
    );
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn open_chat_with_user_resolves_the_direct_chat() {
    let h = Harness::new([]);

    h.client
        .open_chat_with_user(&UserId::new("u-bob"))
        .await
        .expect("open direct chat");

    assert_eq!(
        h.client.session().await.map(|s| s.chat_id),
        Some(ChatId::new("c-with-u-bob"))
    );
    assert_eq!(
        h.client.rooms().pending_room().await,
        Some(ChatId::new("c-with-u-bob"))
    );
}

#[tokio::test]
async fn closing_a_chat_leaves_the_room_and_keeps_the_connection() {
    let mut h = Harness::new([OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    let mut server = h.next_server().await;
    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");
    server.next_request().await;

    h.client.close_chat().await;

    assert_eq!(
        server.next_request().await,
        ClientRequest::LeaveChat {
            chat_id: ChatId::new("c-1"),
        }
    );
    assert!(h.client.session().await.is_none());
    assert_eq!(h.client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_rejoins_the_open_chat() {
    let mut h = Harness::new([OpenStep::Accept, OpenStep::Accept]);
    h.client.connect().await.expect("connect");
    let mut first = h.next_server().await;
    h.client
        .open_chat(ChatId::new("c-1"))
        .await
        .expect("open chat");
    first.next_request().await;

    drop(first);

    h.wait_for_event(|event| {
        *event == ClientEvent::ConnectionChanged(ConnectionState::Reconnecting)
    })
    .await;
    let mut second = h.next_server().await;
    assert_eq!(
        second.next_request().await,
        ClientRequest::JoinChat {
            chat_id: ChatId::new("c-1"),
        }
    );
    h.wait_for_event(|event| *event == ClientEvent::ConnectionChanged(ConnectionState::Connected))
        .await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_surface_connection_failed() {
    let mut h = Harness::new([
        OpenStep::Accept,
        OpenStep::Reject("down"),
        OpenStep::Reject("down"),
        OpenStep::Reject("down"),
        OpenStep::Reject("down"),
        OpenStep::Reject("down"),
    ]);
    h.client.connect().await.expect("connect");
    drop(h.next_server().await);

    let failed = h
        .wait_for_event(|event| matches!(event, ClientEvent::ConnectionFailed(_)))
        .await;

    assert!(matches!(failed, ClientEvent::ConnectionFailed(reason) if reason.contains("5 reconnect attempts")));
    assert_eq!(h.client.connection_state(), ConnectionState::Failed);
    assert_eq!(h.transport.opens(), 6);
}
