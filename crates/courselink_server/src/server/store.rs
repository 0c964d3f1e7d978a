#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use courselink_domain::{
	ChatId, Conversation, CourseId, MentorId, MessageId, Role, SenderProfile, StoredMessage, StudentId, UserId,
};
use parking_lot::Mutex;
use thiserror::Error;

/// One row of a user's conversation list, already resolved from that user's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
	pub chat_id: ChatId,
	pub course_id: CourseId,
	pub course_title: String,
	pub counterpart_name: Option<String>,
	pub counterpart_image: Option<String>,
	/// True when the caller is the mentor, i.e. the counterpart is the student.
	pub counterpart_is_student: bool,
	pub last_message: Option<String>,
	pub last_message_at_ms: Option<i64>,
	pub updated_at_ms: i64,
}

impl ConversationSummary {
	/// Most recent activity: the last message if any, else the chat's own marker.
	pub fn activity_ms(&self) -> i64 {
		self.last_message_at_ms.unwrap_or(self.updated_at_ms)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
	Opened(ChatId),
	NotAStudent,
	NotEnrolled,
}

/// Persistence boundary for conversations and their messages.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
	/// Load a conversation with its participants resolved to user ids.
	async fn conversation(&self, chat_id: ChatId) -> anyhow::Result<Option<Conversation>>;

	/// Insert a message and return it with the sender's display data.
	async fn insert_message(
		&self,
		chat_id: ChatId,
		sender: UserId,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<StoredMessage>;

	/// Bump the conversation's last-activity marker.
	async fn touch_conversation(&self, chat_id: ChatId, at_ms: i64) -> anyhow::Result<()>;

	/// All messages of a conversation, oldest first.
	async fn history(&self, chat_id: ChatId) -> anyhow::Result<Vec<StoredMessage>>;

	/// Conversations where `user` is either participant. Unordered.
	async fn conversations_for_user(&self, user: UserId) -> anyhow::Result<Vec<ConversationSummary>>;

	/// Find or create the (course, student) conversation for an enrolled student.
	async fn open_conversation(&self, user: UserId, course: CourseId) -> anyhow::Result<OpenOutcome>;
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store {op} timed out after {after:?}")]
	Timeout { op: &'static str, after: Duration },

	#[error("store {op} failed: {cause:#}")]
	Backend {
		op: &'static str,
		#[source]
		cause: anyhow::Error,
	},
}

/// Handle shared by the router, relay and HTTP layer. Every call is bounded by `timeout`.
#[derive(Clone)]
pub struct ConversationService {
	backend: Arc<dyn ConversationStore>,
	timeout: Duration,
}

impl std::fmt::Debug for ConversationService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConversationService")
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

impl ConversationService {
	pub fn new(backend: Arc<dyn ConversationStore>, timeout: Duration) -> Self {
		Self { backend, timeout }
	}

	#[allow(dead_code)]
	pub fn new_in_memory(store: InMemoryConversationStore) -> Self {
		Self::new(Arc::new(store), Duration::from_secs(5))
	}

	async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
	where
		F: Future<Output = anyhow::Result<T>>,
	{
		match tokio::time::timeout(self.timeout, fut).await {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(cause)) => Err(StoreError::Backend { op, cause }),
			Err(_) => Err(StoreError::Timeout {
				op,
				after: self.timeout,
			}),
		}
	}

	pub async fn conversation(&self, chat_id: ChatId) -> Result<Option<Conversation>, StoreError> {
		self.bounded("conversation", self.backend.conversation(chat_id)).await
	}

	pub async fn insert_message(
		&self,
		chat_id: ChatId,
		sender: UserId,
		content: &str,
		created_at_ms: i64,
	) -> Result<StoredMessage, StoreError> {
		self.bounded(
			"insert_message",
			self.backend.insert_message(chat_id, sender, content, created_at_ms),
		)
		.await
	}

	pub async fn touch_conversation(&self, chat_id: ChatId, at_ms: i64) -> Result<(), StoreError> {
		self.bounded("touch_conversation", self.backend.touch_conversation(chat_id, at_ms))
			.await
	}

	pub async fn history(&self, chat_id: ChatId) -> Result<Vec<StoredMessage>, StoreError> {
		self.bounded("history", self.backend.history(chat_id)).await
	}

	/// Conversations for `user`, most recent activity first.
	pub async fn conversations_for_user(&self, user: UserId) -> Result<Vec<ConversationSummary>, StoreError> {
		let mut list = self
			.bounded("conversations_for_user", self.backend.conversations_for_user(user))
			.await?;
		list.sort_by(|a, b| b.activity_ms().cmp(&a.activity_ms()).then(b.chat_id.cmp(&a.chat_id)));
		Ok(list)
	}

	pub async fn open_conversation(&self, user: UserId, course: CourseId) -> Result<OpenOutcome, StoreError> {
		self.bounded("open_conversation", self.backend.open_conversation(user, course))
			.await
	}
}

#[derive(Debug, Clone)]
struct UserRow {
	name: Option<String>,
	image: Option<String>,
	role: Role,
}

#[derive(Debug, Clone)]
struct CourseRow {
	title: String,
	mentor_id: MentorId,
}

#[derive(Debug, Clone)]
struct ChatRow {
	course_id: CourseId,
	student_id: StudentId,
	mentor_id: MentorId,
	updated_at_ms: i64,
}

#[derive(Debug, Clone)]
struct MessageRow {
	id: MessageId,
	chat_id: ChatId,
	sender_id: UserId,
	content: String,
	created_at_ms: i64,
}

#[derive(Debug, Default)]
struct MemoryTables {
	users: HashMap<UserId, UserRow>,
	students: HashMap<StudentId, UserId>,
	mentors: HashMap<MentorId, UserId>,
	courses: HashMap<CourseId, CourseRow>,
	enrollments: HashSet<(StudentId, CourseId)>,
	chats: HashMap<ChatId, ChatRow>,
	messages: Vec<MessageRow>,
	next_chat_id: i64,
	next_message_id: i64,
}

impl MemoryTables {
	/// `None` when the chat's student or mentor row is gone, matching the SQL joins.
	fn resolve(&self, id: ChatId, chat: &ChatRow) -> Option<Conversation> {
		let student_user_id = *self.students.get(&chat.student_id)?;
		let mentor_user_id = *self.mentors.get(&chat.mentor_id)?;

		Some(Conversation {
			id,
			course_id: chat.course_id,
			student_id: chat.student_id,
			mentor_id: chat.mentor_id,
			student_user_id,
			mentor_user_id,
			updated_at_ms: chat.updated_at_ms,
		})
	}

	fn profile(&self, user: UserId) -> SenderProfile {
		self.users
			.get(&user)
			.map(|u| SenderProfile {
				name: u.name.clone(),
				image: u.image.clone(),
				role: Some(u.role),
			})
			.unwrap_or_default()
	}

	fn hydrate(&self, m: &MessageRow) -> StoredMessage {
		StoredMessage {
			id: m.id,
			chat_id: m.chat_id,
			sender_id: m.sender_id,
			content: m.content.clone(),
			created_at_ms: m.created_at_ms,
			sender: self.profile(m.sender_id),
		}
	}
}

/// Process-local store for tests and `memory:` deployments.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
	inner: Mutex<MemoryTables>,
}

impl InMemoryConversationStore {
	pub fn new() -> Self {
		Self::default()
	}

	#[allow(dead_code)]
	pub fn add_user(&self, id: UserId, name: Option<&str>, image: Option<&str>, role: Role) {
		self.inner.lock().users.insert(
			id,
			UserRow {
				name: name.map(str::to_string),
				image: image.map(str::to_string),
				role,
			},
		);
	}

	#[allow(dead_code)]
	pub fn add_student(&self, id: StudentId, user: UserId) {
		self.inner.lock().students.insert(id, user);
	}

	#[allow(dead_code)]
	pub fn add_mentor(&self, id: MentorId, user: UserId) {
		self.inner.lock().mentors.insert(id, user);
	}

	#[allow(dead_code)]
	pub fn add_course(&self, id: CourseId, title: &str, mentor: MentorId) {
		self.inner.lock().courses.insert(
			id,
			CourseRow {
				title: title.to_string(),
				mentor_id: mentor,
			},
		);
	}

	#[allow(dead_code)]
	pub fn enroll(&self, student: StudentId, course: CourseId) {
		self.inner.lock().enrollments.insert((student, course));
	}

	#[allow(dead_code)]
	pub fn add_conversation(&self, id: ChatId, course: CourseId, student: StudentId, mentor: MentorId, updated_at_ms: i64) {
		let mut inner = self.inner.lock();
		inner.next_chat_id = inner.next_chat_id.max(id.get());
		inner.chats.insert(
			id,
			ChatRow {
				course_id: course,
				student_id: student,
				mentor_id: mentor,
				updated_at_ms,
			},
		);
	}

	/// Number of persisted messages across all conversations.
	#[allow(dead_code)]
	pub fn message_count(&self) -> usize {
		self.inner.lock().messages.len()
	}
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
	async fn conversation(&self, chat_id: ChatId) -> anyhow::Result<Option<Conversation>> {
		let inner = self.inner.lock();
		Ok(inner.chats.get(&chat_id).and_then(|chat| inner.resolve(chat_id, chat)))
	}

	async fn insert_message(
		&self,
		chat_id: ChatId,
		sender: UserId,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<StoredMessage> {
		let mut inner = self.inner.lock();
		if !inner.chats.contains_key(&chat_id) {
			return Err(anyhow!("insert into missing chat {chat_id}"));
		}

		inner.next_message_id += 1;
		let row = MessageRow {
			id: MessageId(inner.next_message_id),
			chat_id,
			sender_id: sender,
			content: content.to_string(),
			created_at_ms,
		};
		let stored = inner.hydrate(&row);
		inner.messages.push(row);
		Ok(stored)
	}

	async fn touch_conversation(&self, chat_id: ChatId, at_ms: i64) -> anyhow::Result<()> {
		if let Some(chat) = self.inner.lock().chats.get_mut(&chat_id) {
			chat.updated_at_ms = chat.updated_at_ms.max(at_ms);
		}
		Ok(())
	}

	async fn history(&self, chat_id: ChatId) -> anyhow::Result<Vec<StoredMessage>> {
		let inner = self.inner.lock();
		let mut rows: Vec<&MessageRow> = inner.messages.iter().filter(|m| m.chat_id == chat_id).collect();
		rows.sort_by_key(|m| (m.created_at_ms, m.id));
		Ok(rows.into_iter().map(|m| inner.hydrate(m)).collect())
	}

	async fn conversations_for_user(&self, user: UserId) -> anyhow::Result<Vec<ConversationSummary>> {
		let inner = self.inner.lock();
		let mut out = Vec::new();

		for (&chat_id, chat) in &inner.chats {
			let (Some(conv), Some(course)) = (inner.resolve(chat_id, chat), inner.courses.get(&chat.course_id)) else {
				continue;
			};
			let Some(counterpart) = conv.counterpart(user) else {
				continue;
			};
			if !inner.users.contains_key(&conv.student_user_id) || !inner.users.contains_key(&conv.mentor_user_id) {
				continue;
			}

			let last = inner
				.messages
				.iter()
				.filter(|m| m.chat_id == chat_id)
				.max_by_key(|m| (m.created_at_ms, m.id));
			let other = inner.users.get(&counterpart);

			out.push(ConversationSummary {
				chat_id,
				course_id: chat.course_id,
				course_title: course.title.clone(),
				counterpart_name: other.and_then(|u| u.name.clone()),
				counterpart_image: other.and_then(|u| u.image.clone()),
				counterpart_is_student: counterpart == conv.student_user_id,
				last_message: last.map(|m| m.content.clone()),
				last_message_at_ms: last.map(|m| m.created_at_ms),
				updated_at_ms: chat.updated_at_ms,
			});
		}

		Ok(out)
	}

	async fn open_conversation(&self, user: UserId, course: CourseId) -> anyhow::Result<OpenOutcome> {
		let mut inner = self.inner.lock();

		let is_student_role = inner.users.get(&user).is_some_and(|u| u.role == Role::Student);
		let student = inner.students.iter().find(|&(_, u)| *u == user).map(|(&id, _)| id);
		let Some(student) = student.filter(|_| is_student_role) else {
			return Ok(OpenOutcome::NotAStudent);
		};

		if !inner.enrollments.contains(&(student, course)) {
			return Ok(OpenOutcome::NotEnrolled);
		}

		if let Some((&id, _)) = inner
			.chats
			.iter()
			.find(|(_, c)| c.course_id == course && c.student_id == student)
		{
			return Ok(OpenOutcome::Opened(id));
		}

		let mentor_id = inner
			.courses
			.get(&course)
			.map(|c| c.mentor_id)
			.ok_or_else(|| anyhow!("enrollment references missing course {course}"))?;

		inner.next_chat_id += 1;
		let id = ChatId(inner.next_chat_id);
		let now = crate::util::unix_ms_now();
		inner.chats.insert(
			id,
			ChatRow {
				course_id: course,
				student_id: student,
				mentor_id,
				updated_at_ms: now,
			},
		);

		Ok(OpenOutcome::Opened(id))
	}
}
