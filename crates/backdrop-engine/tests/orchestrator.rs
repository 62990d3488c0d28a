use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use backdrop_contracts::character::{BackgroundImageConfig, Character, ImageBackend};
use backdrop_contracts::chat::{ChatMessage, ChatTurn};
use backdrop_contracts::events::EventWriter;
use backdrop_contracts::store::{JsonFileStore, KeyValueStore, MemoryStore};
use backdrop_engine::{
    BackgroundCommit, BackgroundOrchestrator, CaptionChain, CaptionProvider, ChatHistory,
    EngineConfig, ImageClient, ImageError, ImageOutput, ImageRequest, ProcessedLedger,
    TranscriptHistory,
};

const CAPTION: &str = "standing by a rainy window, evening light.";
const IMAGE_URL: &str = "https://img/42.png";

struct StubCaption {
    reply: Option<&'static str>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubCaption {
    fn replying(reply: &'static str) -> Arc<Self> {
        Self::build(Some(reply), Duration::ZERO)
    }

    fn slow(reply: &'static str, delay: Duration) -> Arc<Self> {
        Self::build(Some(reply), delay)
    }

    fn failing() -> Arc<Self> {
        Self::build(None, Duration::ZERO)
    }

    fn build(reply: Option<&'static str>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptionProvider for StubCaption {
    fn name(&self) -> &str {
        "stub"
    }

    async fn try_caption(&self, _history: &[ChatTurn]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .map(str::to_string)
            .ok_or_else(|| anyhow!("provider offline"))
    }
}

enum Reply {
    Url(&'static str),
    RateLimited,
    Unauthorized,
}

struct StubImages {
    replies: Mutex<VecDeque<Reply>>,
    prompts: Mutex<Vec<String>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubImages {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Self::slow(replies, Duration::ZERO)
    }

    fn slow(replies: Vec<Reply>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().expect("prompts lock").last().cloned()
    }
}

#[async_trait]
impl ImageClient for StubImages {
    fn name(&self) -> &str {
        "stub-images"
    }

    async fn generate(&self, request: &ImageRequest) -> Result<ImageOutput, ImageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or(Reply::Unauthorized);
        match reply {
            Reply::Url(url) => Ok(ImageOutput {
                image_urls: vec![url.to_string()],
            }),
            Reply::RateLimited => Err(ImageError::RateLimited("slow down".to_string())),
            Reply::Unauthorized => Err(ImageError::Http {
                status: 401,
                body: "unauthorized".to_string(),
            }),
        }
    }
}

#[derive(Default)]
struct RecordingCommit {
    commits: Mutex<Vec<(String, String)>>,
    delay: Duration,
    fail: bool,
}

impl RecordingCommit {
    fn commits(&self) -> Vec<(String, String)> {
        self.commits.lock().expect("commits lock").clone()
    }
}

#[async_trait]
impl BackgroundCommit for RecordingCommit {
    async fn commit(&self, character_id: &str, image_url: &str) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(anyhow!("character store is read-only"));
        }
        self.commits
            .lock()
            .expect("commits lock")
            .push((character_id.to_string(), image_url.to_string()));
        Ok(())
    }
}

struct BrokenHistory;

#[async_trait]
impl ChatHistory for BrokenHistory {
    async fn recent_turns(&self, _character_id: &str, _limit: usize) -> anyhow::Result<Vec<ChatTurn>> {
        Err(anyhow!("history database locked"))
    }
}

fn character() -> Character {
    Character {
        id: "C1".to_string(),
        name: "Aya".to_string(),
        background_image: Some("backgrounds/aya.png".to_string()),
        enable_auto_extra_background: true,
        background_image_config: Some(BackgroundImageConfig {
            backend: Some(ImageBackend::NovelAi),
            fixed_tags: vec!["indoors".to_string()],
            seed: Some(42),
            ..BackgroundImageConfig::default()
        }),
        ..Character::default()
    }
}

fn messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            id: "m41".to_string(),
            role: "assistant".to_string(),
            content: "Shall we stay in tonight?".to_string(),
        },
        ChatMessage {
            id: "m42".to_string(),
            role: "user".to_string(),
            content: "It's raining outside.".to_string(),
        },
    ]
}

fn orchestrator(
    store: Arc<dyn KeyValueStore>,
    captions: Vec<Arc<StubCaption>>,
    images: Arc<StubImages>,
) -> BackgroundOrchestrator {
    let providers: Vec<Arc<dyn CaptionProvider>> = captions
        .into_iter()
        .map(|provider| provider as Arc<dyn CaptionProvider>)
        .collect();
    BackgroundOrchestrator::new(
        store,
        Arc::new(TranscriptHistory::from_messages(&messages())),
        CaptionChain::new(providers),
        images,
        EngineConfig::default(),
    )
}

#[tokio::test]
async fn rainy_window_scenario_commits_and_records_message() -> anyhow::Result<()> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let caption = StubCaption::replying(CAPTION);
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL)]);
    let orchestrator = orchestrator(store.clone(), vec![caption.clone()], images.clone());
    let commit = RecordingCommit::default();

    let result = orchestrator.trigger(&character(), &messages(), &commit).await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.image_url.as_deref(), Some(IMAGE_URL));
    assert_eq!(result.error, None);
    assert_eq!(
        commit.commits(),
        vec![("C1".to_string(), IMAGE_URL.to_string())]
    );
    assert!(orchestrator.ledger().has("C1", "m42"));
    assert_eq!(
        store.get(&ProcessedLedger::storage_key("C1")).await?,
        Some(serde_json::json!(["m42"]))
    );
    let prompt = images.last_prompt().unwrap_or_default();
    assert!(prompt.ends_with("indoors, standing by a rainy window, evening light"));

    let state = orchestrator.current_state("C1");
    assert!(!state.is_generating);
    assert_eq!(state.image.as_deref(), Some(IMAGE_URL));
    assert_eq!(state.error, None);
    Ok(())
}

#[tokio::test]
async fn second_trigger_for_same_message_calls_nothing() {
    let caption = StubCaption::replying(CAPTION);
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL), Reply::Url("https://img/43.png")]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![caption.clone()],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    assert!(orchestrator.trigger(&character(), &messages(), &commit).await.success);
    let again = orchestrator.trigger(&character(), &messages(), &commit).await;

    assert!(!again.success);
    assert_eq!(again.error.as_deref(), Some("Message already processed"));
    assert_eq!(caption.calls(), 1);
    assert_eq!(images.calls(), 1);
    assert_eq!(commit.commits().len(), 1);
}

#[tokio::test]
async fn ledger_survives_a_fresh_orchestrator() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.json");
    let commit = RecordingCommit::default();

    let first = orchestrator(
        Arc::new(JsonFileStore::new(&path)),
        vec![StubCaption::replying(CAPTION)],
        StubImages::new(vec![Reply::Url(IMAGE_URL)]),
    );
    assert!(first.trigger(&character(), &messages(), &commit).await.success);

    let reloaded = ProcessedLedger::new(Arc::new(JsonFileStore::new(&path)));
    reloaded.load("C1").await;
    assert!(reloaded.has("C1", "m42"));

    let images = StubImages::new(vec![Reply::Url("https://img/99.png")]);
    let second = orchestrator(
        Arc::new(JsonFileStore::new(&path)),
        vec![StubCaption::replying(CAPTION)],
        images.clone(),
    );
    let result = second.trigger(&character(), &messages(), &commit).await;
    assert_eq!(result.error.as_deref(), Some("Message already processed"));
    assert_eq!(images.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn preconditions_skip_without_touching_state() {
    let caption = StubCaption::replying(CAPTION);
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL)]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![caption.clone()],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    let mut no_background = character();
    no_background.background_image = Some("  ".to_string());
    let mut disabled = character();
    disabled.enable_auto_extra_background = false;
    let mut other_backend = character();
    if let Some(config) = other_backend.background_image_config.as_mut() {
        config.backend = Some(ImageBackend::Other);
    }

    let cases = [
        (no_background, "Missing character or background image"),
        (disabled, "Auto background generation disabled"),
        (other_backend, "Not using NovelAI for background generation"),
    ];
    for (candidate, expected) in cases {
        let result = orchestrator.trigger(&candidate, &messages(), &commit).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(expected));
    }

    assert_eq!(orchestrator.current_state("C1"), Default::default());
    assert_eq!(caption.calls(), 0);
    assert_eq!(images.calls(), 0);
    assert!(commit.commits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn abort_during_captioning_prevents_commit() {
    let caption = StubCaption::slow(CAPTION, Duration::from_secs(5));
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL)]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![caption.clone()],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    let character = character();
    let messages = messages();
    let (result, aborted) = tokio::join!(
        orchestrator.trigger(&character, &messages, &commit),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            orchestrator.abort_current_task("C1")
        }
    );

    assert!(aborted);
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Task aborted"));
    assert_eq!(caption.calls(), 1);
    assert_eq!(images.calls(), 0);
    assert!(commit.commits().is_empty());
    assert!(!orchestrator.ledger().has("C1", "m42"));

    let state = orchestrator.current_state("C1");
    assert!(!state.is_generating);
    assert!(state.aborted);
    assert_eq!(state.error.as_deref(), Some("Task aborted"));
}

#[tokio::test(start_paused = true)]
async fn abort_during_retry_delay_stops_before_second_attempt() {
    let images = StubImages::new(vec![Reply::RateLimited, Reply::Url(IMAGE_URL)]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    let character = character();
    let messages = messages();
    let (result, _) = tokio::join!(
        orchestrator.trigger(&character, &messages, &commit),
        async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            orchestrator.abort_current_task("C1")
        }
    );

    assert_eq!(result.error.as_deref(), Some("Task aborted"));
    assert_eq!(images.calls(), 1);
    assert!(commit.commits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_trigger_is_refused_while_generating() {
    let caption = StubCaption::slow(CAPTION, Duration::from_secs(3));
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL)]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![caption.clone()],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    let character = character();
    let messages = messages();
    let (first, second) = tokio::join!(
        orchestrator.trigger(&character, &messages, &commit),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            orchestrator.trigger(&character, &messages, &commit).await
        }
    );

    assert!(first.success);
    assert_eq!(second.error.as_deref(), Some("Generation already in progress"));
    assert_eq!(caption.calls(), 1);
    assert_eq!(images.calls(), 1);
    assert_eq!(commit.commits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_twice_fails_and_leaves_ledger_alone() {
    let images = StubImages::new(vec![
        Reply::RateLimited,
        Reply::RateLimited,
        Reply::Url(IMAGE_URL),
    ]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    let result = orchestrator.trigger(&character(), &messages(), &commit).await;

    assert!(!result.success);
    assert_eq!(images.calls(), 2);
    assert!(commit.commits().is_empty());
    assert!(!orchestrator.ledger().has("C1", "m42"));

    // The same turn may be retried later since it never succeeded.
    let retry = orchestrator.trigger(&character(), &messages(), &commit).await;
    assert!(retry.success, "{retry:?}");
    assert_eq!(images.calls(), 3);
}

#[tokio::test]
async fn failing_captioners_still_generate_without_scene() {
    let first = StubCaption::failing();
    let second = StubCaption::failing();
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL)]);
    let orchestrator = BackgroundOrchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(BrokenHistory),
        CaptionChain::new(vec![
            first.clone() as Arc<dyn CaptionProvider>,
            second.clone() as Arc<dyn CaptionProvider>,
        ]),
        images.clone(),
        EngineConfig::default(),
    );
    let commit = RecordingCommit::default();

    let result = orchestrator.trigger(&character(), &messages(), &commit).await;

    assert!(result.success);
    assert_eq!((first.calls(), second.calls()), (1, 1));
    let prompt = images.last_prompt().unwrap_or_default();
    assert!(prompt.ends_with("scenery, indoors"), "{prompt}");
}

#[tokio::test]
async fn commit_failure_is_reported_and_not_recorded() {
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        StubImages::new(vec![Reply::Url(IMAGE_URL)]),
    );
    let commit = RecordingCommit {
        fail: true,
        ..RecordingCommit::default()
    };

    let result = orchestrator.trigger(&character(), &messages(), &commit).await;

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|error| error.contains("read-only")));
    assert!(!orchestrator.ledger().has("C1", "m42"));

    let state = orchestrator.current_state("C1");
    assert!(!state.is_generating);
    assert_eq!(state.image, None);
    assert!(state
        .error
        .as_deref()
        .is_some_and(|error| error.contains("read-only")));
}

#[tokio::test(start_paused = true)]
async fn trigger_during_slow_commit_does_not_repeat_the_turn() {
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL), Reply::Url("https://img/dup.png")]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        images.clone(),
    );
    let commit = RecordingCommit {
        delay: Duration::from_secs(5),
        ..RecordingCommit::default()
    };

    let character = character();
    let messages = messages();
    let (first, second) = tokio::join!(
        orchestrator.trigger(&character, &messages, &commit),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            orchestrator.trigger(&character, &messages, &commit).await
        }
    );

    assert!(first.success, "{first:?}");
    assert_eq!(second.error.as_deref(), Some("Generation already in progress"));
    assert_eq!(images.calls(), 1);
    assert_eq!(
        commit.commits(),
        vec![("C1".to_string(), IMAGE_URL.to_string())]
    );

    let later = orchestrator.trigger(&character, &messages, &commit).await;
    assert_eq!(later.error.as_deref(), Some("Message already processed"));
    assert_eq!(images.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn image_landing_after_abort_is_discarded() {
    let images = StubImages::slow(vec![Reply::Url(IMAGE_URL)], Duration::from_secs(5));
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    let character = character();
    let messages = messages();
    let (result, aborted) = tokio::join!(
        orchestrator.trigger(&character, &messages, &commit),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            orchestrator.abort_current_task("C1")
        }
    );

    assert!(aborted);
    assert_eq!(result.error.as_deref(), Some("Task aborted"));
    assert_eq!(result.image_url, None);
    assert_eq!(images.calls(), 1);
    assert!(commit.commits().is_empty());
    assert!(!orchestrator.ledger().has("C1", "m42"));
    assert_eq!(orchestrator.current_state("C1").image, None);
}

#[tokio::test]
async fn events_journal_records_lifecycle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let events_path = dir.path().join("events.jsonl");
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        StubImages::new(vec![Reply::Url(IMAGE_URL)]),
    )
    .with_events(EventWriter::new(&events_path, "session-test"));
    let commit = RecordingCommit::default();

    orchestrator.trigger(&character(), &messages(), &commit).await;
    orchestrator.trigger(&character(), &messages(), &commit).await;

    let raw = std::fs::read_to_string(&events_path)?;
    let types: Vec<String> = raw
        .lines()
        .map(serde_json::from_str::<serde_json::Value>)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter_map(|event| event.get("type").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert_eq!(
        types,
        vec![
            "generation_started",
            "caption_resolved",
            "generation_succeeded",
            "generation_skipped",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn clear_processed_allows_regeneration() -> anyhow::Result<()> {
    let images = StubImages::new(vec![Reply::Url(IMAGE_URL), Reply::Url("https://img/43.png")]);
    let orchestrator = orchestrator(
        Arc::new(MemoryStore::new()),
        vec![StubCaption::replying(CAPTION)],
        images.clone(),
    );
    let commit = RecordingCommit::default();

    assert!(orchestrator.trigger(&character(), &messages(), &commit).await.success);
    assert!(orchestrator.clear_processed("C1").await);
    orchestrator.reset("C1");
    assert_eq!(orchestrator.current_state("C1"), Default::default());

    let again = orchestrator.trigger(&character(), &messages(), &commit).await;
    assert_eq!(again.image_url.as_deref(), Some("https://img/43.png"));
    assert_eq!(images.calls(), 2);
    Ok(())
}
