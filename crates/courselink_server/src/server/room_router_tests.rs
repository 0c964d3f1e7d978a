#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courselink_domain::{ChatId, MessageId, UserId};
use courselink_protocol::{ReceiveMessage, ServerEvent};

use crate::server::connection::ConnectionState;
use crate::server::room_router::RouterError;
use crate::server::test_support::{
	CHAT, FlakyStore, MENTOR, OTHER_CHAT, OUTSIDER, STUDENT, app_state, assert_quiet, connect, init_test_logging,
	next_event, seeded_state, seeded_store,
};

fn message(chat_id: ChatId, id: i64, text: &str) -> ServerEvent {
	ServerEvent::ReceiveMessage(ReceiveMessage {
		id: MessageId(id),
		content: text.to_string(),
		sender_id: UserId(10),
		sender_name: None,
		sender_image: None,
		created_at: id,
		chat_id,
	})
}

#[tokio::test]
async fn join_succeeds_only_for_participants() {
	init_test_logging();
	let state = seeded_state();

	let (student, _rx_s) = connect(&state, STUDENT);
	let (mentor, _rx_m) = connect(&state, MENTOR);
	let (outsider, _rx_o) = connect(&state, OUTSIDER);

	assert_eq!(state.router.join(&student, CHAT).await.expect("student joins"), CHAT);
	assert_eq!(state.router.join(&mentor, CHAT).await.expect("mentor joins"), CHAT);

	let err = state.router.join(&outsider, CHAT).await.expect_err("outsider rejected");
	assert!(matches!(err, RouterError::Unauthorized { .. }), "got {err:?}");
	assert_eq!(err.reason(), "Unauthorized access to chat");

	let err = state.router.join(&student, ChatId(999)).await.expect_err("missing chat");
	assert!(matches!(err, RouterError::NotFound(ChatId(999))));
	assert_eq!(err.reason(), "Chat not found");

	assert_eq!(state.router.room_sizes().get(&CHAT).copied(), Some(2));
	assert!(!state.router.is_member(outsider.id(), CHAT));
}

#[tokio::test]
async fn join_twice_is_a_noop() {
	let state = seeded_state();
	let (student, mut rx) = connect(&state, STUDENT);

	state.router.join(&student, CHAT).await.expect("first join");
	state.router.join(&student, CHAT).await.expect("second join");

	assert_eq!(state.router.room_sizes().get(&CHAT).copied(), Some(1));

	state.router.broadcast(CHAT, message(CHAT, 1, "once"));
	assert!(matches!(next_event(&mut rx).await, ServerEvent::ReceiveMessage(_)));
	assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn store_failure_during_join_is_internal_error() {
	let store = Arc::new(FlakyStore::new(seeded_store()));
	FlakyStore::set(&store.fail_lookup, true);
	let state = app_state(store, Duration::from_secs(5), 16);

	let (student, _rx) = connect(&state, STUDENT);
	let err = state.router.join(&student, CHAT).await.expect_err("lookup fails");
	assert!(matches!(err, RouterError::Store(_)));
	assert_eq!(err.reason(), "Internal server error");
	assert!(state.router.room_sizes().is_empty());
}

#[tokio::test]
async fn broadcast_reaches_only_members_of_that_room() {
	let state = seeded_state();

	let (student, mut rx_student) = connect(&state, STUDENT);
	let (outsider, mut rx_outsider) = connect(&state, OUTSIDER);

	state.router.join(&student, CHAT).await.expect("join chat");
	state.router.join(&outsider, OTHER_CHAT).await.expect("join other chat");

	let report = state.router.broadcast(OTHER_CHAT, message(OTHER_CHAT, 1, "other"));
	assert_eq!(report.delivered, 1);
	assert_quiet(&mut rx_student).await;

	state.router.broadcast(CHAT, message(CHAT, 2, "mine"));
	match next_event(&mut rx_student).await {
		ServerEvent::ReceiveMessage(m) => assert_eq!(m.content, "mine"),
		other => panic!("expected receive-message, got: {other:?}"),
	}

	match next_event(&mut rx_outsider).await {
		ServerEvent::ReceiveMessage(m) => assert_eq!(m.content, "other"),
		other => panic!("expected receive-message, got: {other:?}"),
	}
	assert_quiet(&mut rx_outsider).await;
}

#[tokio::test]
async fn broadcast_to_unknown_room_is_a_noop() {
	let state = seeded_state();
	let report = state.router.broadcast(ChatId(77), message(ChatId(77), 1, "nobody"));
	assert_eq!(report.delivered, 0);
	assert_eq!(report.dropped, 0);
}

#[tokio::test]
async fn leave_all_removes_every_membership_and_is_idempotent() {
	let state = seeded_state();
	let (mentor, _rx) = connect(&state, MENTOR);

	state.router.join(&mentor, CHAT).await.expect("join chat");
	state.router.join(&mentor, OTHER_CHAT).await.expect("join other chat");
	assert_eq!(state.router.rooms_for_conn(mentor.id()).len(), 2);

	let mut left = state.router.leave_all(mentor.id());
	left.sort();
	assert_eq!(left, vec![CHAT, OTHER_CHAT]);

	assert!(state.router.rooms_for_conn(mentor.id()).is_empty());
	assert!(state.router.room_sizes().is_empty(), "empty rooms are dropped");
	assert!(state.router.leave_all(mentor.id()).is_empty());
}

#[tokio::test]
async fn disconnected_connection_cannot_join() {
	let state = seeded_state();
	let (student, _rx) = connect(&state, STUDENT);

	assert!(state.gateway.disconnect(&student));
	assert_eq!(student.state(), ConnectionState::Disconnected);

	let err = state.router.join(&student, CHAT).await.expect_err("closed connection");
	assert!(matches!(err, RouterError::NotAuthenticated));
	assert!(state.router.room_sizes().is_empty());
}

#[tokio::test]
async fn full_queue_drops_events_for_the_slow_member() {
	let store = Arc::new(seeded_store());
	let state = app_state(store, Duration::from_secs(5), 1);

	let (student, mut rx) = connect(&state, STUDENT);
	state.router.join(&student, CHAT).await.expect("join");

	let first = state.router.broadcast(CHAT, message(CHAT, 1, "a-1"));
	assert_eq!(first.delivered, 1);

	let second = state.router.broadcast(CHAT, message(CHAT, 2, "a-2"));
	assert_eq!(second.dropped, 1);

	match next_event(&mut rx).await {
		ServerEvent::ReceiveMessage(m) => assert_eq!(m.content, "a-1"),
		other => panic!("expected a-1 first, got: {other:?}"),
	}

	// With capacity 1 the marker never fits behind a delivered event, so it stays pending.
	state.router.broadcast(CHAT, message(CHAT, 3, "a-3"));
	match next_event(&mut rx).await {
		ServerEvent::ReceiveMessage(m) => assert_eq!(m.content, "a-3"),
		other => panic!("expected a-3, got: {other:?}"),
	}

	state.router.broadcast(CHAT, message(CHAT, 4, "a-4"));
	match next_event(&mut rx).await {
		ServerEvent::ReceiveMessage(m) => assert_eq!(m.content, "a-4"),
		other => panic!("expected a-4, got: {other:?}"),
	}
	assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn lagged_marker_follows_next_delivery_when_there_is_room() {
	let store = Arc::new(seeded_store());
	let state = app_state(store, Duration::from_secs(5), 2);

	let (student, mut rx) = connect(&state, STUDENT);
	state.router.join(&student, CHAT).await.expect("join");

	state.router.broadcast(CHAT, message(CHAT, 1, "a-1"));
	state.router.broadcast(CHAT, message(CHAT, 2, "a-2"));
	let dropped = state.router.broadcast(CHAT, message(CHAT, 3, "a-3"));
	assert_eq!(dropped.dropped, 1);

	next_event(&mut rx).await;
	next_event(&mut rx).await;

	state.router.broadcast(CHAT, message(CHAT, 4, "a-4"));
	match next_event(&mut rx).await {
		ServerEvent::ReceiveMessage(m) => assert_eq!(m.content, "a-4"),
		other => panic!("expected a-4, got: {other:?}"),
	}
	match next_event(&mut rx).await {
		ServerEvent::Lagged(l) => {
			assert_eq!(l.chat_id, CHAT);
			assert_eq!(l.dropped, 1);
		}
		other => panic!("expected lagged marker, got: {other:?}"),
	}
}

#[tokio::test]
async fn closed_receivers_are_pruned_on_broadcast() {
	let state = seeded_state();

	let (student, rx_student) = connect(&state, STUDENT);
	let (mentor, mut rx_mentor) = connect(&state, MENTOR);
	state.router.join(&student, CHAT).await.expect("join");
	state.router.join(&mentor, CHAT).await.expect("join");

	drop(rx_student);

	let report = state.router.broadcast(CHAT, message(CHAT, 1, "hello"));
	assert_eq!(report.delivered, 1);
	assert_eq!(state.router.room_sizes().get(&CHAT).copied(), Some(1));
	assert!(!state.router.is_member(student.id(), CHAT));
	assert!(state.router.is_member(mentor.id(), CHAT));

	next_event(&mut rx_mentor).await;
}
