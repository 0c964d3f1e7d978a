#![forbid(unsafe_code)]

//! Conversation endpoints the web client uses to hydrate state before joining rooms.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use courselink_domain::{ChatId, CourseId, IdentityClaim};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

use crate::server::auth::extract_credential;
use crate::server::state::AppState;
use crate::server::store::{ConversationSummary, OpenOutcome, StoreError};

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("unauthenticated")]
	Unauthenticated,

	#[error("bad request: {0}")]
	BadRequest(&'static str),

	#[error("forbidden: {0}")]
	Forbidden(&'static str),

	#[error("not found: {0}")]
	NotFound(&'static str),

	#[error(transparent)]
	Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, message) = match &self {
			ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "Unauthenticated"),
			ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, *m),
			ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, *m),
			ApiError::NotFound(m) => (StatusCode::NOT_FOUND, *m),
			ApiError::Store(e) => {
				error!(error = %e, "store error in http handler");
				(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
			}
		};
		(status, Json(json!({ "error": message }))).into_response()
	}
}

/// Caller identity from a Bearer header or the `token` cookie.
#[derive(Debug, Clone)]
pub struct AuthUser(pub IdentityClaim);

impl FromRequestParts<AppState> for AuthUser {
	type Rejection = ApiError;

	async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
		let credential = extract_credential(None, &parts.headers).ok_or(ApiError::Unauthenticated)?;
		let claim = state
			.verifier
			.verify(&credential)
			.map_err(|_| ApiError::Unauthenticated)?;
		Ok(AuthUser(claim))
	}
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
	pub id: i64,
	pub content: String,
	pub sender_id: i64,
	pub sender_name: Option<String>,
	pub sender_role: Option<String>,
	pub sender_image: Option<String>,
	pub created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
	pub chat_id: i64,
	pub course_id: i64,
	pub student_user_id: i64,
	pub mentor_user_id: i64,
	pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListItem {
	pub chat_id: i64,
	pub title: String,
	pub subtitle: String,
	pub image: Option<String>,
	pub course_id: i64,
	pub last_message: String,
	pub updated_at: i64,
}

impl From<ConversationSummary> for ConversationListItem {
	fn from(s: ConversationSummary) -> Self {
		let fallback = if s.counterpart_is_student { "Student" } else { "Mentor" };
		let updated_at = s.activity_ms();
		ConversationListItem {
			chat_id: s.chat_id.get(),
			title: s.counterpart_name.filter(|n| !n.is_empty()).unwrap_or_else(|| fallback.to_string()),
			subtitle: s.course_title,
			image: s.counterpart_image,
			course_id: s.course_id.get(),
			last_message: s
				.last_message
				.filter(|m| !m.is_empty())
				.unwrap_or_else(|| "No messages yet".to_string()),
			updated_at,
		}
	}
}

/// `GET /conversations/{chat_id}`
pub async fn get_conversation(
	AuthUser(claim): AuthUser,
	State(state): State<AppState>,
	Path(chat_id): Path<i64>,
) -> Result<Json<ConversationView>, ApiError> {
	let chat_id = ChatId(chat_id);
	let conversation = state
		.store
		.conversation(chat_id)
		.await?
		.ok_or(ApiError::NotFound("Chat not found"))?;

	if !conversation.is_participant(claim.user_id) {
		return Err(ApiError::Forbidden("Unauthorized access to this chat"));
	}

	let messages = state
		.store
		.history(chat_id)
		.await?
		.into_iter()
		.map(|m| HistoryMessage {
			id: m.id.get(),
			content: m.content,
			sender_id: m.sender_id.get(),
			sender_name: m.sender.name,
			sender_role: m.sender.role.map(|r| r.as_str().to_string()),
			sender_image: m.sender.image,
			created_at: m.created_at_ms,
		})
		.collect();

	Ok(Json(ConversationView {
		chat_id: conversation.id.get(),
		course_id: conversation.course_id.get(),
		student_user_id: conversation.student_user_id.get(),
		mentor_user_id: conversation.mentor_user_id.get(),
		messages,
	}))
}

/// `GET /conversations`
pub async fn list_conversations(
	AuthUser(claim): AuthUser,
	State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
	let chats: Vec<ConversationListItem> = state
		.store
		.conversations_for_user(claim.user_id)
		.await?
		.into_iter()
		.map(ConversationListItem::from)
		.collect();

	Ok(Json(json!({ "chats": chats })))
}

/// `POST /conversations` with `{ "courseId": <int or numeric string> }`.
pub async fn open_conversation(
	AuthUser(claim): AuthUser,
	State(state): State<AppState>,
	body: Bytes,
) -> Result<Json<Value>, ApiError> {
	let course_id = parse_course_id(&body).ok_or(ApiError::BadRequest("Course ID required"))?;

	match state.store.open_conversation(claim.user_id, course_id).await? {
		OpenOutcome::Opened(chat_id) => Ok(Json(json!({ "chatId": chat_id.get() }))),
		OpenOutcome::NotAStudent => Err(ApiError::Forbidden("Only students can start a chat")),
		OpenOutcome::NotEnrolled => Err(ApiError::Forbidden("You must be enrolled in the course to chat")),
	}
}

fn parse_course_id(body: &[u8]) -> Option<CourseId> {
	let value: Value = serde_json::from_slice(body).ok()?;
	match value.get("courseId")? {
		Value::Number(n) => n.as_i64().map(CourseId),
		Value::String(s) => s.parse::<CourseId>().ok(),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn summary(name: Option<&str>, last: Option<(&str, i64)>, counterpart_is_student: bool) -> ConversationSummary {
		ConversationSummary {
			chat_id: ChatId(5),
			course_id: CourseId(1),
			course_title: "Rust 101".to_string(),
			counterpart_name: name.map(str::to_string),
			counterpart_image: None,
			counterpart_is_student,
			last_message: last.map(|(m, _)| m.to_string()),
			last_message_at_ms: last.map(|(_, at)| at),
			updated_at_ms: 100,
		}
	}

	#[test]
	fn list_item_falls_back_to_role_title_and_placeholder_message() {
		let item = ConversationListItem::from(summary(None, None, true));
		assert_eq!(item.title, "Student");
		assert_eq!(item.last_message, "No messages yet");
		assert_eq!(item.updated_at, 100);

		let item = ConversationListItem::from(summary(None, None, false));
		assert_eq!(item.title, "Mentor");
	}

	#[test]
	fn list_item_uses_last_message_time_when_present() {
		let item = ConversationListItem::from(summary(Some("Ada"), Some(("hi", 250)), false));
		assert_eq!(item.title, "Ada");
		assert_eq!(item.subtitle, "Rust 101");
		assert_eq!(item.last_message, "hi");
		assert_eq!(item.updated_at, 250);
	}

	#[test]
	fn course_id_accepts_numbers_and_numeric_strings() {
		assert_eq!(parse_course_id(br#"{"courseId":3}"#), Some(CourseId(3)));
		assert_eq!(parse_course_id(br#"{"courseId":"3"}"#), Some(CourseId(3)));
		assert_eq!(parse_course_id(br#"{"courseId":null}"#), None);
		assert_eq!(parse_course_id(br#"{}"#), None);
		assert_eq!(parse_course_id(b"not json"), None);
	}
}
