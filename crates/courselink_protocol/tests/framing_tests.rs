use courselink_domain::{ChatId, MessageId, UserId};
use courselink_protocol::{
	ClientEvent, DEFAULT_MAX_FRAME_SIZE, FramingError, JoinChat, ReceiveMessage, SendMessage, ServerEvent, decode_event,
	encode_event, encode_event_default,
};
use proptest::prelude::*;

#[test]
fn client_events_decode_from_wire_text() {
	let join: ClientEvent =
		decode_event(r#"{"event":"join-chat","data":{"chatId":5}}"#, DEFAULT_MAX_FRAME_SIZE).expect("decode join");
	assert_eq!(join, ClientEvent::JoinChat(JoinChat { chat_id: ChatId(5) }));

	let send: ClientEvent = decode_event(
		r#"{"event":"send-message","data":{"chatId":"5","content":"Hi"}}"#,
		DEFAULT_MAX_FRAME_SIZE,
	)
	.expect("decode send");
	assert_eq!(
		send,
		ClientEvent::SendMessage(SendMessage {
			chat_id: ChatId(5),
			content: "Hi".to_string(),
		})
	);
}

#[test]
fn unknown_event_names_are_decode_errors() {
	let err = decode_event::<ClientEvent>(r#"{"event":"typing","data":{"chatId":5}}"#, DEFAULT_MAX_FRAME_SIZE)
		.expect_err("unknown event");
	assert!(matches!(err, FramingError::Decode(_)));
}

#[test]
fn encode_default_matches_explicit_default_limit() {
	let ev = ServerEvent::error("Chat not found");
	let a = encode_event_default(&ev).expect("encode default");
	let b = encode_event(&ev, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	assert_eq!(a, b);
}

#[test]
fn server_events_survive_the_wire() {
	let ev = ServerEvent::ReceiveMessage(ReceiveMessage {
		id: MessageId(9),
		content: "line one\nline \"two\"".to_string(),
		sender_id: UserId(10),
		sender_name: None,
		sender_image: Some("https://cdn.example/a.png".to_string()),
		created_at: 1,
		chat_id: ChatId(5),
	});

	let text = encode_event_default(&ev).expect("encode");
	let back: ServerEvent = decode_event(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(back, ev);
}

proptest! {
	#[test]
	fn any_content_within_limit_decodes_to_itself(content in ".{0,512}", chat in 1i64..1_000_000) {
		let ev = ClientEvent::SendMessage(SendMessage { chat_id: ChatId(chat), content });
		let text = encode_event_default(&ev).expect("encode");
		let back: ClientEvent = decode_event(&text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		prop_assert_eq!(back, ev);
	}

	#[test]
	fn oversized_frames_are_always_rejected(extra in 1usize..256, max in 16usize..256) {
		let text = "x".repeat(max + extra);
		let is_too_large = matches!(
			decode_event::<ClientEvent>(&text, max),
			Err(FramingError::FrameTooLarge { .. })
		);
		prop_assert!(is_too_large);
	}
}
