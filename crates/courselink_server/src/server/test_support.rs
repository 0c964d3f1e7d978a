#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use courselink_domain::{
	ChatId, Conversation, CourseId, IdentityClaim, MentorId, Role, StoredMessage, StudentId, UserId,
};
use courselink_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::app::build_router;
use crate::server::auth::{IdentityVerifier, issue_token};
use crate::server::connection::Connection;
use crate::server::gateway::ConnectionSettings;
use crate::server::health::HealthState;
use crate::server::room_router::RoomRouterConfig;
use crate::server::state::AppState;
use crate::server::store::{
	ConversationService, ConversationStore, ConversationSummary, InMemoryConversationStore, OpenOutcome,
};
use crate::util::SecretString;

pub const SECRET: &str = "test-secret";

pub const STUDENT: UserId = UserId(10);
pub const MENTOR: UserId = UserId(20);
pub const OUTSIDER: UserId = UserId(30);

/// Student 10 and mentor 20 talk in chat 5. User 30 is another student of the same
/// mentor and owns chat 6.
pub const CHAT: ChatId = ChatId(5);
pub const OTHER_CHAT: ChatId = ChatId(6);
pub const COURSE: CourseId = CourseId(1);
pub const UNENROLLED_COURSE: CourseId = CourseId(2);
/// Student 10 is enrolled here but has no conversation yet.
pub const FRESH_COURSE: CourseId = CourseId(3);

static LOG_INIT: OnceLock<()> = OnceLock::new();

pub fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("COURSELINK_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

pub fn seeded_store() -> InMemoryConversationStore {
	let store = InMemoryConversationStore::new();

	store.add_user(STUDENT, Some("Sam Student"), None, Role::Student);
	store.add_user(MENTOR, Some("Mia Mentor"), Some("https://cdn.example/mia.png"), Role::Mentor);
	store.add_user(OUTSIDER, None, None, Role::Student);

	store.add_student(StudentId(3), STUDENT);
	store.add_student(StudentId(7), OUTSIDER);
	store.add_mentor(MentorId(4), MENTOR);

	store.add_course(COURSE, "Rust 101", MentorId(4));
	store.add_course(UNENROLLED_COURSE, "Async Rust", MentorId(4));
	store.add_course(FRESH_COURSE, "Lifetimes", MentorId(4));
	store.enroll(StudentId(3), COURSE);
	store.enroll(StudentId(3), FRESH_COURSE);
	store.enroll(StudentId(7), COURSE);

	store.add_conversation(CHAT, COURSE, StudentId(3), MentorId(4), 1_000);
	store.add_conversation(OTHER_CHAT, COURSE, StudentId(7), MentorId(4), 2_000);

	store
}

/// Wraps the in-memory store with switches for injecting failures.
#[derive(Default)]
pub struct FlakyStore {
	pub inner: InMemoryConversationStore,
	pub fail_insert: AtomicBool,
	pub stall_insert: AtomicBool,
	pub fail_touch: AtomicBool,
	pub fail_lookup: AtomicBool,
}

impl FlakyStore {
	pub fn new(inner: InMemoryConversationStore) -> Self {
		Self {
			inner,
			..Self::default()
		}
	}

	pub fn set(flag: &AtomicBool, on: bool) {
		flag.store(on, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl ConversationStore for FlakyStore {
	async fn conversation(&self, chat_id: ChatId) -> anyhow::Result<Option<Conversation>> {
		if self.fail_lookup.load(Ordering::SeqCst) {
			anyhow::bail!("lookup unavailable");
		}
		self.inner.conversation(chat_id).await
	}

	async fn insert_message(
		&self,
		chat_id: ChatId,
		sender: UserId,
		content: &str,
		created_at_ms: i64,
	) -> anyhow::Result<StoredMessage> {
		if self.stall_insert.load(Ordering::SeqCst) {
			tokio::time::sleep(Duration::from_secs(60)).await;
		}
		if self.fail_insert.load(Ordering::SeqCst) {
			anyhow::bail!("insert rejected");
		}
		self.inner.insert_message(chat_id, sender, content, created_at_ms).await
	}

	async fn touch_conversation(&self, chat_id: ChatId, at_ms: i64) -> anyhow::Result<()> {
		if self.fail_touch.load(Ordering::SeqCst) {
			anyhow::bail!("touch rejected");
		}
		self.inner.touch_conversation(chat_id, at_ms).await
	}

	async fn history(&self, chat_id: ChatId) -> anyhow::Result<Vec<StoredMessage>> {
		self.inner.history(chat_id).await
	}

	async fn conversations_for_user(&self, user: UserId) -> anyhow::Result<Vec<ConversationSummary>> {
		self.inner.conversations_for_user(user).await
	}

	async fn open_conversation(&self, user: UserId, course: CourseId) -> anyhow::Result<OpenOutcome> {
		self.inner.open_conversation(user, course).await
	}
}

pub fn verifier() -> IdentityVerifier {
	IdentityVerifier::new(SecretString::new(SECRET))
}

pub fn token_for(user: UserId) -> String {
	issue_token(&IdentityClaim::new(user), SECRET, Some(Duration::from_secs(300)))
}

pub fn app_state(store: Arc<dyn ConversationStore>, store_timeout: Duration, queue_capacity: usize) -> AppState {
	let health = HealthState::new();
	health.mark_ready();

	AppState::new(
		ConversationService::new(store, store_timeout),
		verifier(),
		ConnectionSettings {
			outbound_queue_capacity: queue_capacity,
			..ConnectionSettings::default()
		},
		RoomRouterConfig { debug_logs: true },
		health,
	)
}

pub fn seeded_state() -> AppState {
	app_state(Arc::new(seeded_store()), Duration::from_secs(5), 64)
}

/// Admit a connection for `user` directly through the gateway, bypassing the socket.
pub fn connect(state: &AppState, user: UserId) -> (Connection, mpsc::Receiver<ServerEvent>) {
	let token = token_for(user);
	state
		.gateway
		.admit(state.gateway.begin(), Some(&token))
		.expect("token is valid")
}

pub async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected an event within timeout")
		.expect("channel open")
}

pub async fn assert_quiet(rx: &mut mpsc::Receiver<ServerEvent>) {
	if let Ok(Some(ev)) = timeout(Duration::from_millis(50), rx.recv()).await {
		panic!("expected no event, got: {ev:?}");
	}
}

/// Serve the full app on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	let app = build_router(state, None);

	tokio::spawn(async move {
		let _ = axum::serve(listener, app).await;
	});

	addr
}
