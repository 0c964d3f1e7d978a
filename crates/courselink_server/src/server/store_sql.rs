#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use courselink_domain::{
	ChatId, Conversation, CourseId, MentorId, MessageId, Role, SenderProfile, StoredMessage, StudentId, UserId,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use super::store::{ConversationService, ConversationStore, ConversationSummary, InMemoryConversationStore, OpenOutcome};

/// sqlx-backed store. The relational schema is shared with the account/course layer.
#[derive(Clone)]
pub struct SqlConversationStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Run `$body` against whichever pool backs `$store`. The body is compiled once per driver.
macro_rules! with_pool {
	($store:expr, $pool:ident => $body:expr) => {
		match &$store.backend {
			SqlBackend::Sqlite($pool) => $body,
			SqlBackend::Postgres($pool) => $body,
		}
	};
}

const SELECT_CONVERSATION: &str = "SELECT c.id, c.course_id, c.student_id, c.mentor_id, \
	s.user_id AS student_user_id, m.user_id AS mentor_user_id, c.updated_at \
	FROM chats c \
	JOIN students s ON s.id = c.student_id \
	JOIN mentors m ON m.id = c.mentor_id \
	WHERE c.id = ?";

const INSERT_MESSAGE: &str =
	"INSERT INTO messages (chat_id, sender_id, content, created_at) VALUES (?, ?, ?, ?) RETURNING id";

const SELECT_PROFILE: &str = "SELECT name, image, role FROM users WHERE id = ?";

const TOUCH_CONVERSATION: &str = "UPDATE chats SET updated_at = ? WHERE id = ? AND updated_at < ?";

const SELECT_HISTORY: &str = "SELECT msg.id, msg.chat_id, msg.sender_id, msg.content, msg.created_at, \
	u.name AS sender_name, u.image AS sender_image, u.role AS sender_role \
	FROM messages msg \
	LEFT JOIN users u ON u.id = msg.sender_id \
	WHERE msg.chat_id = ? \
	ORDER BY msg.created_at ASC, msg.id ASC";

const SELECT_SUMMARIES: &str = "SELECT c.id AS chat_id, c.course_id, co.title AS course_title, c.updated_at, \
	su.id AS student_user_id, su.name AS student_name, su.image AS student_image, \
	mu.id AS mentor_user_id, mu.name AS mentor_name, mu.image AS mentor_image, \
	(SELECT content FROM messages WHERE chat_id = c.id ORDER BY created_at DESC, id DESC LIMIT 1) AS last_message, \
	(SELECT created_at FROM messages WHERE chat_id = c.id ORDER BY created_at DESC, id DESC LIMIT 1) AS last_message_at \
	FROM chats c \
	JOIN courses co ON co.id = c.course_id \
	JOIN students s ON s.id = c.student_id \
	JOIN mentors m ON m.id = c.mentor_id \
	JOIN users su ON su.id = s.user_id \
	JOIN users mu ON mu.id = m.user_id \
	WHERE su.id = ? OR mu.id = ?";

const SELECT_STUDENT_FOR_USER: &str =
	"SELECT s.id FROM users u JOIN students s ON s.user_id = u.id WHERE u.id = ? AND u.role = 'STUDENT'";

const SELECT_ENROLLED_MENTOR: &str = "SELECT co.mentor_id FROM enrollments e \
	JOIN courses co ON co.id = e.course_id \
	WHERE e.student_id = ? AND e.course_id = ?";

const INSERT_CHAT: &str = "INSERT INTO chats (course_id, student_id, mentor_id, created_at, updated_at) \
	VALUES (?, ?, ?, ?, ?) ON CONFLICT (course_id, student_id) DO NOTHING";

const SELECT_CHAT_ID: &str = "SELECT id FROM chats WHERE course_id = ? AND student_id = ?";

#[derive(Debug, sqlx::FromRow)]
struct ConversationRecord {
	id: i64,
	course_id: i64,
	student_id: i64,
	mentor_id: i64,
	student_user_id: i64,
	mentor_user_id: i64,
	updated_at: i64,
}

impl From<ConversationRecord> for Conversation {
	fn from(r: ConversationRecord) -> Self {
		Conversation {
			id: ChatId(r.id),
			course_id: CourseId(r.course_id),
			student_id: StudentId(r.student_id),
			mentor_id: MentorId(r.mentor_id),
			student_user_id: UserId(r.student_user_id),
			mentor_user_id: UserId(r.mentor_user_id),
			updated_at_ms: r.updated_at,
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRecord {
	name: Option<String>,
	image: Option<String>,
	role: Option<String>,
}

impl From<ProfileRecord> for SenderProfile {
	fn from(r: ProfileRecord) -> Self {
		SenderProfile {
			name: r.name,
			image: r.image,
			role: r.role.as_deref().and_then(|s| s.parse::<Role>().ok()),
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRecord {
	id: i64,
	chat_id: i64,
	sender_id: i64,
	content: String,
	created_at: i64,
	sender_name: Option<String>,
	sender_image: Option<String>,
	sender_role: Option<String>,
}

impl From<MessageRecord> for StoredMessage {
	fn from(r: MessageRecord) -> Self {
		StoredMessage {
			id: MessageId(r.id),
			chat_id: ChatId(r.chat_id),
			sender_id: UserId(r.sender_id),
			content: r.content,
			created_at_ms: r.created_at,
			sender: SenderProfile {
				name: r.sender_name,
				image: r.sender_image,
				role: r.sender_role.as_deref().and_then(|s| s.parse::<Role>().ok()),
			},
		}
	}
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRecord {
	chat_id: i64,
	course_id: i64,
	course_title: String,
	updated_at: i64,
	student_user_id: i64,
	student_name: Option<String>,
	student_image: Option<String>,
	mentor_user_id: i64,
	mentor_name: Option<String>,
	mentor_image: Option<String>,
	last_message: Option<String>,
	last_message_at: Option<i64>,
}

impl SummaryRecord {
	fn into_summary(self, viewer: UserId) -> ConversationSummary {
		// A user chatting with themself sees the mentor side, matching `Conversation::counterpart`.
		let viewer_is_student = UserId(self.student_user_id) == viewer;
		let (name, image) = if viewer_is_student {
			(self.mentor_name, self.mentor_image)
		} else {
			(self.student_name, self.student_image)
		};

		ConversationSummary {
			chat_id: ChatId(self.chat_id),
			course_id: CourseId(self.course_id),
			course_title: self.course_title,
			counterpart_name: name,
			counterpart_image: image,
			counterpart_is_student: !viewer_is_student,
			last_message: self.last_message,
			last_message_at_ms: self.last_message_at,
			updated_at_ms: self.updated_at,
		}
	}
}

impl SqlConversationStore {
	/// Connect by URL scheme (`sqlite:` or `postgres:`/`postgresql:`).
	pub async fn connect(database_url: &str, run_migrations: bool) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// Each sqlite in-memory connection is its own database, so keep exactly one alive.
			let pool_opts = if in_memory {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
			} else {
				SqlitePoolOptions::new().max_connections(8)
			};
			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;

			if run_migrations {
				sqlx::migrate!("migrations/sqlite")
					.run(&pool)
					.await
					.context("run sqlite migrations")?;
			}

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(16)
				.connect(database_url)
				.await
				.context("connect postgres")?;

			if run_migrations {
				sqlx::migrate!("migrations/postgres")
					.run(&pool)
					.await
					.context("run postgres migrations")?;
			}

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, or memory:)"))
		}
	}

	fn driver(&self) -> &'static str {
		match self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
		}
	}

	/// Queries are written with `?` placeholders; Postgres wants `$1, $2, ...`.
	fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
		match self.backend {
			SqlBackend::Sqlite(_) => Cow::Borrowed(query),
			SqlBackend::Postgres(_) => Cow::Owned(numbered_placeholders(query)),
		}
	}

	/// Execute raw statements; used by tests to seed account/course rows.
	#[cfg(test)]
	pub async fn raw_execute(&self, statements: &str) -> anyhow::Result<()> {
		with_pool!(self, pool => {
			sqlx::raw_sql(statements).execute(pool).await.context("raw execute")?;
		});
		Ok(())
	}
}

fn numbered_placeholders(query: &str) -> String {
	let mut out = String::with_capacity(query.len() + 16);
	let mut n = 0usize;
	for ch in query.chars() {
		if ch == '?' {
			n += 1;
			out.push('$');
			out.push_str(&n.to_string());
		} else {
			out.push(ch);
		}
	}
	out
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
	async fn conversation(&self, chat_id: ChatId) -> anyhow::Result<Option<Conversation>> {
		let sql = self.sql(SELECT_CONVERSATION);
		let row: Option<ConversationRecord> = with_pool!(self, pool => {
			sqlx::query_as::<_, ConversationRecord>(&sql)
				.bind(chat_id.get())
				.fetch_optional(pool)
				.await
				.with_context(|| format!("select conversation ({})", self.driver()))?
		});

		Ok(row.map(Conversation::from))
	}

	async fn insert_message(
		&self,
		chat_id: ChatId,
		sender: UserId,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<StoredMessage> {
		let insert = self.sql(INSERT_MESSAGE);
		let profile = self.sql(SELECT_PROFILE);

		let (id, sender_profile) = with_pool!(self, pool => {
			let mut tx = pool.begin().await.context("begin insert tx")?;

			let (id,): (i64,) = sqlx::query_as(&insert)
				.bind(chat_id.get())
				.bind(sender.get())
				.bind(content)
				.bind(created_at_ms)
				.fetch_one(&mut *tx)
				.await
				.with_context(|| format!("insert message ({})", self.driver()))?;

			let profile: Option<ProfileRecord> = sqlx::query_as::<_, ProfileRecord>(&profile)
				.bind(sender.get())
				.fetch_optional(&mut *tx)
				.await
				.with_context(|| format!("select sender profile ({})", self.driver()))?;

			tx.commit().await.context("commit insert tx")?;
			(id, profile)
		});

		Ok(StoredMessage {
			id: MessageId(id),
			chat_id,
			sender_id: sender,
			content: content.to_string(),
			created_at_ms,
			sender: sender_profile.map(SenderProfile::from).unwrap_or_default(),
		})
	}

	async fn touch_conversation(&self, chat_id: ChatId, at_ms: i64) -> anyhow::Result<()> {
		let sql = self.sql(TOUCH_CONVERSATION);
		with_pool!(self, pool => {
			sqlx::query(&sql)
				.bind(at_ms)
				.bind(chat_id.get())
				.bind(at_ms)
				.execute(pool)
				.await
				.with_context(|| format!("touch conversation ({})", self.driver()))?;
		});
		Ok(())
	}

	async fn history(&self, chat_id: ChatId) -> anyhow::Result<Vec<StoredMessage>> {
		let sql = self.sql(SELECT_HISTORY);
		let rows: Vec<MessageRecord> = with_pool!(self, pool => {
			sqlx::query_as::<_, MessageRecord>(&sql)
				.bind(chat_id.get())
				.fetch_all(pool)
				.await
				.with_context(|| format!("select history ({})", self.driver()))?
		});

		Ok(rows.into_iter().map(StoredMessage::from).collect())
	}

	async fn conversations_for_user(&self, user: UserId) -> anyhow::Result<Vec<ConversationSummary>> {
		let sql = self.sql(SELECT_SUMMARIES);
		let rows: Vec<SummaryRecord> = with_pool!(self, pool => {
			sqlx::query_as::<_, SummaryRecord>(&sql)
				.bind(user.get())
				.bind(user.get())
				.fetch_all(pool)
				.await
				.with_context(|| format!("select conversations ({})", self.driver()))?
		});

		Ok(rows.into_iter().map(|r| r.into_summary(user)).collect())
	}

	async fn open_conversation(&self, user: UserId, course: CourseId) -> anyhow::Result<OpenOutcome> {
		let select_student = self.sql(SELECT_STUDENT_FOR_USER);
		let select_mentor = self.sql(SELECT_ENROLLED_MENTOR);
		let insert_chat = self.sql(INSERT_CHAT);
		let select_chat = self.sql(SELECT_CHAT_ID);
		let now = crate::util::unix_ms_now();

		with_pool!(self, pool => {
			let mut tx = pool.begin().await.context("begin open tx")?;

			let student: Option<(i64,)> = sqlx::query_as(&select_student)
				.bind(user.get())
				.fetch_optional(&mut *tx)
				.await
				.context("select student")?;
			let Some((student_id,)) = student else {
				return Ok(OpenOutcome::NotAStudent);
			};

			let mentor: Option<(i64,)> = sqlx::query_as(&select_mentor)
				.bind(student_id)
				.bind(course.get())
				.fetch_optional(&mut *tx)
				.await
				.context("select enrollment")?;
			let Some((mentor_id,)) = mentor else {
				return Ok(OpenOutcome::NotEnrolled);
			};

			sqlx::query(&insert_chat)
				.bind(course.get())
				.bind(student_id)
				.bind(mentor_id)
				.bind(now)
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("insert chat")?;

			let (chat_id,): (i64,) = sqlx::query_as(&select_chat)
				.bind(course.get())
				.bind(student_id)
				.fetch_one(&mut *tx)
				.await
				.context("select chat id")?;

			tx.commit().await.context("commit open tx")?;

			info!(chat_id, student_id, course_id = course.get(), "conversation opened");
			Ok(OpenOutcome::Opened(ChatId(chat_id)))
		})
	}
}

/// Build the store named by `database_url`. `memory:` selects the process-local store.
pub async fn connect_store(
	database_url: &str,
	run_migrations: bool,
	timeout: Duration,
) -> anyhow::Result<ConversationService> {
	if database_url == "memory:" {
		info!("using in-memory conversation store");
		return Ok(ConversationService::new(
			Arc::new(InMemoryConversationStore::new()),
			timeout,
		));
	}

	let store = SqlConversationStore::connect(database_url, run_migrations).await?;
	info!(driver = store.driver(), run_migrations, "conversation store connected");
	Ok(ConversationService::new(Arc::new(store), timeout))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn placeholders_are_numbered_in_order() {
		assert_eq!(
			numbered_placeholders("UPDATE chats SET updated_at = ? WHERE id = ? AND updated_at < ?"),
			"UPDATE chats SET updated_at = $1 WHERE id = $2 AND updated_at < $3"
		);
		assert_eq!(numbered_placeholders("SELECT 1"), "SELECT 1");
	}

	#[tokio::test]
	async fn rejects_unknown_schemes() {
		let err = SqlConversationStore::connect("mysql://localhost/db", false)
			.await
			.err()
			.expect("mysql is not supported");
		assert!(err.to_string().contains("unsupported database_url"));
	}
}
