#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown role: {0}")]
	UnknownRole(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! int_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
		#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
		#[cfg_attr(feature = "serde", serde(transparent))]
		pub struct $name(pub i64);

		impl $name {
			pub const fn get(self) -> i64 {
				self.0
			}
		}

		impl From<i64> for $name {
			fn from(v: i64) -> Self {
				Self(v)
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				s.parse::<i64>()
					.map(Self)
					.map_err(|_| ParseIdError::InvalidFormat(format!("expected integer id, got {s:?}")))
			}
		}
	};
}

int_id!(
	/// Account identifier (`users.id`).
	UserId
);
int_id!(
	/// Conversation identifier (`chats.id`).
	ChatId
);
int_id!(
	/// Course identifier.
	CourseId
);
int_id!(
	/// Student profile identifier (`students.id`, not the owning user).
	StudentId
);
int_id!(
	/// Mentor profile identifier (`mentors.id`, not the owning user).
	MentorId
);
int_id!(
	/// Persisted message identifier.
	MessageId
);

/// Account role as recorded by the account layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Role {
	Student,
	Mentor,
	Admin,
}

impl Role {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Student => "STUDENT",
			Role::Mentor => "MENTOR",
			Role::Admin => "ADMIN",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_uppercase().as_str() {
			"STUDENT" => Ok(Role::Student),
			"MENTOR" => Ok(Role::Mentor),
			"ADMIN" => Ok(Role::Admin),
			other => Err(ParseIdError::UnknownRole(other.to_string())),
		}
	}
}

/// Verified identity attached to a connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaim {
	pub user_id: UserId,
	pub email: Option<String>,
	pub role: Option<Role>,
}

impl IdentityClaim {
	pub fn new(user_id: UserId) -> Self {
		Self {
			user_id,
			email: None,
			role: None,
		}
	}
}

/// A 1:1 conversation between a course's student and its mentor.
///
/// Participant user ids are resolved through the student/mentor profile rows,
/// so the record can be checked against an [`IdentityClaim`] directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
	pub id: ChatId,
	pub course_id: CourseId,
	pub student_id: StudentId,
	pub mentor_id: MentorId,
	pub student_user_id: UserId,
	pub mentor_user_id: UserId,
	pub updated_at_ms: i64,
}

impl Conversation {
	/// True if `user` owns either side of the conversation.
	pub fn is_participant(&self, user: UserId) -> bool {
		user == self.student_user_id || user == self.mentor_user_id
	}

	/// The other side of the conversation, if `user` is a participant.
	pub fn counterpart(&self, user: UserId) -> Option<UserId> {
		if user == self.student_user_id {
			Some(self.mentor_user_id)
		} else if user == self.mentor_user_id {
			Some(self.student_user_id)
		} else {
			None
		}
	}
}

/// Display data for a message author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderProfile {
	pub name: Option<String>,
	pub image: Option<String>,
	pub role: Option<Role>,
}

/// A persisted message together with its author's display data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub chat_id: ChatId,
	pub sender_id: UserId,
	pub content: String,
	pub created_at_ms: i64,
	pub sender: SenderProfile,
}
