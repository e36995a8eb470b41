// Veera Core Engine — Turn Driver
// One turn = user input in, one settled model message out. The driver
// appends the user message and the in-progress placeholder, opens the
// remote stream, feeds the accumulator, keeps the store's raw text
// current, and hands cleaned display targets to the pacer. Terminal
// transitions (clean or failed) always let the pacer drain before the
// placeholder is settled and the session list is persisted.

use crate::atoms::constants::{REVEAL_INTERVAL_MS, STREAM_FAILURE_NOTICE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::chat::{derive_title, strip_markdown};
use crate::engine::pacer::{Pacer, RevealState, StopSignal};
use crate::engine::providers::RemoteClient;
use crate::engine::sessions::SessionStore;
use crate::engine::stream::StreamAccumulator;
use crate::engine::types::{ChatEvent, ChatSettings, ImageAttachment, Message, TurnPhase};
use futures::StreamExt;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

// ── Turn entry points ──────────────────────────────────────────────────────

/// Everything one turn needs from the embedder.
pub struct TurnInput {
    pub session_id: String,
    pub text: String,
    pub image: Option<ImageAttachment>,
    pub settings: ChatSettings,
}

/// Start a turn at the standard reveal cadence. Must be called within a
/// tokio runtime.
pub fn start_turn(
    store: Arc<SessionStore>,
    client: Arc<dyn RemoteClient>,
    input: TurnInput,
    events: UnboundedSender<ChatEvent>,
) -> EngineResult<TurnHandle> {
    start_turn_paced(
        store,
        client,
        input,
        events,
        Duration::from_millis(REVEAL_INTERVAL_MS),
    )
}

/// Start a turn with an explicit reveal interval.
///
/// Validates and mutates the session synchronously (user message +
/// placeholder appended, title derived for a fresh session, list saved),
/// emits the placeholder/thinking events, then spawns the streaming
/// driver and the reveal loop. Returns an error, with no session changes,
/// when the session is unknown or already has a turn in progress.
pub fn start_turn_paced(
    store: Arc<SessionStore>,
    client: Arc<dyn RemoteClient>,
    input: TurnInput,
    events: UnboundedSender<ChatEvent>,
    reveal_interval: Duration,
) -> EngineResult<TurnHandle> {
    let TurnInput { session_id, text, image, settings } = input;

    let placeholder = Message::placeholder();
    let message_id = placeholder.id.clone();
    // Admission, titling, and both appends are one atomic store
    // operation; racing starts cannot both pass the streaming check.
    // The returned history excludes the message being sent now.
    let history = store.begin_turn(
        &session_id,
        &derive_title(&text),
        Message::user(text.clone(), image.clone()),
        placeholder,
    )?;
    if let Err(e) = store.save_all() {
        error!("[turn] Could not persist sessions: {}", e);
    }

    info!(
        "[turn] Starting turn {} in session {} (model {})",
        message_id, session_id, settings.model
    );
    debug!("[turn] {} phase={:?}", message_id, TurnPhase::Pending);
    let _ = events.send(ChatEvent::Placeholder {
        session_id: session_id.clone(),
        message_id: message_id.clone(),
    });
    let _ = events.send(ChatEvent::Thinking {
        session_id: session_id.clone(),
        message_id: message_id.clone(),
    });

    let state = Arc::new(Mutex::new(RevealState::new()));
    let pacer = Pacer::spawn(
        session_id.clone(),
        message_id.clone(),
        state.clone(),
        reveal_interval,
        events.clone(),
    );
    let stop = pacer.stop_signal();

    let driver = Driver {
        store,
        client,
        session_id: session_id.clone(),
        message_id: message_id.clone(),
        history,
        text,
        image,
        settings,
        events,
        state,
    };
    let handle = tokio::spawn(driver.run(pacer));

    Ok(TurnHandle { session_id, message_id, driver: handle, stop })
}

// ── Turn handle ────────────────────────────────────────────────────────────

/// Handle to a running turn.
pub struct TurnHandle {
    session_id: String,
    message_id: String,
    driver: JoinHandle<()>,
    stop: StopSignal,
}

impl TurnHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Id of the in-progress model message this turn fills in.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Abort the turn: the reveal loop exits at its next tick and the
    /// driver is cancelled, so no further events or store writes happen.
    /// Idempotent. The placeholder is left as-is for the embedder.
    pub fn abort(&self) {
        self.stop.request();
        self.driver.abort();
    }

    /// Wait until the turn settles (completion or failure).
    pub async fn join(self) {
        let _ = self.driver.await;
    }
}

// ── Streaming driver ───────────────────────────────────────────────────────

struct Driver {
    store: Arc<SessionStore>,
    client: Arc<dyn RemoteClient>,
    session_id: String,
    message_id: String,
    history: Vec<Message>,
    text: String,
    image: Option<ImageAttachment>,
    settings: ChatSettings,
    events: UnboundedSender<ChatEvent>,
    state: Arc<Mutex<RevealState>>,
}

impl Driver {
    async fn run(self, pacer: Pacer) {
        debug!("[turn] {} phase={:?}", self.message_id, TurnPhase::Streaming);
        let opened = self
            .client
            .stream_chat(&self.history, &self.text, self.image.as_ref(), &self.settings)
            .await;
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                self.settle_failed(pacer, e).await;
                return;
            }
        };

        let mut accumulator = StreamAccumulator::new();
        let mut cited = 0usize;

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(ev) => ev,
                Err(e) => {
                    self.settle_failed(pacer, e).await;
                    return;
                }
            };

            let snapshot = accumulator.advance(event);
            let raw = snapshot.text.clone();
            let sources = snapshot.sources.clone();

            // Stored text stays raw; only display targets are cleaned.
            let cleaned = strip_markdown(&raw);
            let stored_sources = (!sources.is_empty()).then(|| sources.clone());
            self.store.update_message(&self.session_id, &self.message_id, |m| {
                m.set_text(raw);
                m.grounding_sources = stored_sources;
            });

            // Emit the replace under the same lock as the install; a tick
            // between the two would enqueue a reveal of the new target
            // ahead of the replace.
            {
                let mut reveal = self.state.lock();
                if reveal.install(cleaned) {
                    self.send(ChatEvent::Replace {
                        session_id: self.session_id.clone(),
                        message_id: self.message_id.clone(),
                        text: reveal.visible_text().to_string(),
                    });
                }
            }

            if sources.len() > cited {
                cited = sources.len();
                self.send(ChatEvent::Sources {
                    session_id: self.session_id.clone(),
                    message_id: self.message_id.clone(),
                    sources,
                });
            }
        }

        self.settle_clean(pacer).await;
    }

    /// Clean end of stream: flag finality, let the pacer reveal whatever
    /// is still buffered, then settle the placeholder and persist.
    async fn settle_clean(&self, pacer: Pacer) {
        debug!("[turn] {} phase={:?}", self.message_id, TurnPhase::Finalizing);
        self.state.lock().finalize();
        pacer.join().await;

        let final_visible = self.state.lock().visible_text().to_string();
        self.store.update_message(&self.session_id, &self.message_id, |m| {
            m.is_streaming = false;
        });
        if let Err(e) = self.store.save_all() {
            error!("[turn] Could not persist sessions: {}", e);
        }
        info!("[turn] {} phase={:?}", self.message_id, TurnPhase::Settled);
        self.send(ChatEvent::Complete {
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            text: final_visible,
        });
    }

    /// Failed stream: freeze what the viewer has seen, append the notice
    /// as the final target, and let the pacer type it out before the
    /// placeholder is settled. The stored text is the displayed text —
    /// revealed prefix plus notice — not the raw partial.
    async fn settle_failed(&self, pacer: Pacer, err: EngineError) {
        error!(
            "[turn] {} stream from {} failed: {}",
            self.message_id,
            self.client.name(),
            err
        );
        let final_text = failure_target(&mut self.state.lock());
        pacer.join().await;

        let stored = final_text.clone();
        self.store.update_message(&self.session_id, &self.message_id, |m| {
            m.set_text(stored);
            m.is_streaming = false;
        });
        if let Err(e) = self.store.save_all() {
            error!("[turn] Could not persist sessions: {}", e);
        }
        info!("[turn] {} phase={:?}", self.message_id, TurnPhase::Failed);
        self.send(ChatEvent::Failed {
            session_id: self.session_id.clone(),
            message_id: self.message_id.clone(),
            message: final_text,
        });
    }

    fn send(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

/// Final display target after a failure: the already-revealed prefix with
/// the notice appended directly. Installing it never rewrites the visible
/// prefix, so the notice simply continues at the reveal cadence.
fn failure_target(reveal: &mut RevealState) -> String {
    let target = format!("{}{}", reveal.visible_text(), STREAM_FAILURE_NOTICE);
    reveal.install(target.clone());
    reveal.finalize();
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pacer::Step;
    use crate::engine::providers::EventStream;
    use crate::engine::sessions::MemoryBlobStore;
    use crate::engine::types::{GroundingSource, StreamEvent};
    use async_trait::async_trait;

    struct ScriptedClient {
        items: Mutex<Option<Vec<EngineResult<StreamEvent>>>>,
        hang_after: bool,
    }

    impl ScriptedClient {
        fn new(items: Vec<EngineResult<StreamEvent>>) -> Self {
            ScriptedClient { items: Mutex::new(Some(items)), hang_after: false }
        }

        fn hanging(items: Vec<EngineResult<StreamEvent>>) -> Self {
            ScriptedClient { items: Mutex::new(Some(items)), hang_after: true }
        }
    }

    #[async_trait]
    impl RemoteClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_chat(
            &self,
            _history: &[Message],
            _input: &str,
            _image: Option<&ImageAttachment>,
            _settings: &ChatSettings,
        ) -> EngineResult<EventStream> {
            let items = self.items.lock().take().unwrap_or_default();
            if self.hang_after {
                Ok(Box::pin(futures::stream::iter(items).chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }

    fn test_setup(
        client: ScriptedClient,
    ) -> (
        Arc<SessionStore>,
        Arc<dyn RemoteClient>,
        String,
        tokio::sync::mpsc::UnboundedSender<ChatEvent>,
        tokio::sync::mpsc::UnboundedReceiver<ChatEvent>,
    ) {
        let store = Arc::new(SessionStore::new(Box::new(MemoryBlobStore::new())));
        let session = store.create_session("gemini-3-flash-preview");
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (store, Arc::new(client), session.id, tx, rx)
    }

    fn input_for(session_id: &str, text: &str) -> TurnInput {
        TurnInput {
            session_id: session_id.to_string(),
            text: text.to_string(),
            image: None,
            settings: ChatSettings::default(),
        }
    }

    #[test]
    fn test_refuses_unknown_session() {
        let (store, client, _, tx, _rx) = test_setup(ScriptedClient::new(vec![]));
        let err = start_turn(store, client, input_for("ghost", "hi"), tx);
        assert!(err.is_err());
    }

    #[test]
    fn test_refuses_concurrent_turn_in_session() {
        let (store, client, session_id, tx, _rx) = test_setup(ScriptedClient::new(vec![]));
        store
            .append_message(&session_id, Message::placeholder())
            .unwrap();
        let err = start_turn(store, client, input_for(&session_id, "hi"), tx);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_clean_turn_settles_message_and_title() {
        let (store, client, session_id, tx, mut rx) =
            test_setup(ScriptedClient::new(vec![Ok(StreamEvent::text("Hi"))]));

        let handle = start_turn_paced(
            store.clone(),
            client,
            input_for(&session_id, "grid status"),
            tx,
            Duration::from_millis(1),
        )
        .unwrap();
        let message_id = handle.message_id().to_string();
        handle.join().await;

        let session = store.get_session(&session_id).unwrap();
        assert_eq!(session.title, "grid status");
        assert_eq!(session.messages.len(), 2);
        let model_msg = &session.messages[1];
        assert_eq!(model_msg.id, message_id);
        assert_eq!(model_msg.text(), "Hi");
        assert!(!model_msg.is_streaming);

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(match ev {
                ChatEvent::Placeholder { .. } => "placeholder",
                ChatEvent::Thinking { .. } => "thinking",
                ChatEvent::Reveal { .. } => "reveal",
                ChatEvent::Replace { .. } => "replace",
                ChatEvent::Sources { .. } => "sources",
                ChatEvent::Complete { text, .. } => {
                    assert_eq!(text, "Hi");
                    "complete"
                }
                ChatEvent::Failed { .. } => "failed",
            });
        }
        assert_eq!(
            kinds,
            vec!["placeholder", "thinking", "reveal", "reveal", "complete"]
        );
    }

    #[tokio::test]
    async fn test_existing_session_keeps_its_title() {
        let (store, client, session_id, tx, _rx) =
            test_setup(ScriptedClient::new(vec![Ok(StreamEvent::text("ok"))]));
        store
            .append_message(&session_id, Message::user("earlier", None))
            .unwrap();

        let handle = start_turn_paced(
            store.clone(),
            client,
            input_for(&session_id, "later question"),
            tx,
            Duration::from_millis(1),
        )
        .unwrap();
        handle.join().await;

        let session = store.get_session(&session_id).unwrap();
        assert_eq!(session.title, "New Intelligence Task");
    }

    #[tokio::test]
    async fn test_failed_turn_stores_prefix_plus_notice() {
        let (store, client, session_id, tx, mut rx) = test_setup(ScriptedClient::new(vec![
            Ok(StreamEvent::text("Hello")),
            Err(EngineError::provider("scripted", "boom")),
        ]));

        let handle = start_turn_paced(
            store.clone(),
            client,
            input_for(&session_id, "hi"),
            tx,
            Duration::from_millis(1),
        )
        .unwrap();
        handle.join().await;

        let session = store.get_session(&session_id).unwrap();
        let model_msg = &session.messages[1];
        assert!(!model_msg.is_streaming);
        let prefix = model_msg
            .text()
            .strip_suffix(STREAM_FAILURE_NOTICE)
            .map(str::to_string);
        let prefix = prefix.unwrap();
        assert!("Hello".starts_with(&prefix));

        let mut failed_message = None;
        while let Ok(ev) = rx.try_recv() {
            if let ChatEvent::Failed { message, .. } = ev {
                failed_message = Some(message);
            }
        }
        assert_eq!(failed_message.unwrap(), model_msg.text());
    }

    #[tokio::test]
    async fn test_citations_flow_to_store_and_events() {
        let sources = vec![
            GroundingSource::new("A", "https://a.example"),
            GroundingSource::new("A", "https://a.example"),
        ];
        let (store, client, session_id, tx, mut rx) =
            test_setup(ScriptedClient::new(vec![Ok(StreamEvent::with_sources(
                "cited",
                sources,
            ))]));

        let handle = start_turn_paced(
            store.clone(),
            client,
            input_for(&session_id, "hi"),
            tx,
            Duration::from_millis(1),
        )
        .unwrap();
        handle.join().await;

        let session = store.get_session(&session_id).unwrap();
        let stored = session.messages[1].grounding_sources.clone().unwrap();
        assert_eq!(stored, vec![GroundingSource::new("A", "https://a.example")]);

        let mut sources_events = 0;
        while let Ok(ev) = rx.try_recv() {
            if let ChatEvent::Sources { sources, .. } = ev {
                sources_events += 1;
                assert_eq!(sources.len(), 1);
            }
        }
        assert_eq!(sources_events, 1);
    }

    #[tokio::test]
    async fn test_abort_stops_events_and_writes() {
        let (store, client, session_id, tx, mut rx) = test_setup(ScriptedClient::hanging(vec![
            Ok(StreamEvent::text("Hello there")),
        ]));

        let handle = start_turn_paced(
            store.clone(),
            client,
            input_for(&session_id, "hi"),
            tx,
            Duration::from_millis(5),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
        handle.abort();

        // Let any in-flight tick land, then drain; after that the channel
        // must stay silent.
        tokio::time::sleep(Duration::from_millis(30)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        // Never settled: the placeholder is still flagged in progress.
        let session = store.get_session(&session_id).unwrap();
        assert!(session.messages[1].is_streaming);
    }

    #[test]
    fn test_failure_target_preserves_revealed_prefix() {
        let mut reveal = RevealState::new();
        reveal.install("Hello".to_string());
        for _ in 0..3 {
            reveal.step();
        }
        assert_eq!(reveal.visible_text(), "Hel");

        let target = failure_target(&mut reveal);
        assert_eq!(target, format!("Hel{STREAM_FAILURE_NOTICE}"));
        assert_eq!(reveal.visible_text(), "Hel");

        // The notice is revealed at cadence, not swapped in wholesale.
        let mut typed = String::new();
        loop {
            match reveal.step() {
                Step::Reveal(chunk) => typed.push_str(&chunk),
                Step::Done => break,
                Step::Idle => unreachable!("finalized state never idles"),
            }
        }
        assert_eq!(typed, STREAM_FAILURE_NOTICE);
        assert_eq!(reveal.visible_text(), target);
    }
}
