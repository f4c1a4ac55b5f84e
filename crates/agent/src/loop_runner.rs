//! The assistant loop: one instance per active session, owning its history.
//!
//! `send_message` runs the bounded provider/tool loop as a spawned producer
//! writing to a capacity-one channel, so no event is produced ahead of the
//! consumer's demand. The history vector moves into the producer task for the
//! duration of the turn and is handed back through a oneshot when the turn
//! ends, keeping it exclusively owned at all times. Cancellation is
//! cooperative and observed at every suspension point: the provider call,
//! each received stream event, and each tool dispatch.

use std::mem;
use std::sync::Arc;

use mealmind_config::AssistantConfig;
use mealmind_core::error::AgentError;
use mealmind_core::message::{ContentBlock, Message};
use mealmind_core::provider::{CompletionProvider, CompletionRequest, StopReason, StreamEvent, ToolDefinition};
use mealmind_core::tool::ToolRegistry;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::StreamAggregator;
use crate::event::AgentEvent;
use crate::prompt::build_system_prompt;
use crate::rate_limit::RateLimiter;

/// Identity of the user this loop instance serves.
#[derive(Debug, Clone)]
pub struct CallerProfile {
    /// Stable identifier, used for rate limiting and session lookup
    pub user_id: String,
    /// Name as spoken in the system prompt
    pub display_name: String,
    /// Role as spoken in the system prompt (e.g. "practitioner")
    pub role: String,
}

/// How a producer turn ended, apart from hard errors.
enum Outcome {
    Completed,
    Cancelled,
}

/// One user's assistant loop.
///
/// Not shareable: concurrent `send_message` calls against one instance are
/// serialized by `&mut self`. The rate limiter and provider are the shared
/// pieces; each comes in as an `Arc`.
pub struct AssistantLoop {
    config: AssistantConfig,
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    rate_limiter: Arc<RateLimiter>,
    profile: CallerProfile,
    history: Vec<Message>,
    /// Hand-back channel for a history that is currently out on loan to a
    /// producer task.
    pending: Option<oneshot::Receiver<Vec<Message>>>,
}

impl AssistantLoop {
    pub fn new(
        config: AssistantConfig,
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        rate_limiter: Arc<RateLimiter>,
        profile: CallerProfile,
    ) -> Self {
        Self {
            config,
            provider,
            tools,
            rate_limiter,
            profile,
            history: Vec::new(),
            pending: None,
        }
    }

    /// Seed the in-memory history, typically from the session store before
    /// the first turn. Replaces whatever is held.
    pub async fn resume(&mut self, messages: Vec<Message>) {
        self.reclaim().await;
        self.history = messages;
    }

    /// The committed history, for persistence after a turn.
    pub async fn history(&mut self) -> &[Message] {
        self.reclaim().await;
        &self.history
    }

    /// Drop all in-memory history. Any in-flight turn's hand-back is
    /// discarded too.
    pub async fn clear_history(&mut self) {
        self.reclaim().await;
        self.history.clear();
        info!(user_id = %self.profile.user_id, "Cleared conversation history");
    }

    /// Run one turn. Events arrive on the returned channel in order; the
    /// channel closes after the terminal event (`Done` or `Error`), or
    /// without one if `cancel` fires first.
    pub async fn send_message(
        &mut self,
        text: impl Into<String>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<AgentEvent> {
        self.reclaim().await;

        if !self.config.has_api_key() {
            return Self::single_error(AgentError::NotConfigured.to_string());
        }

        let decision = self.rate_limiter.check_and_record(&self.profile.user_id);
        if !decision.allowed {
            let message = decision
                .message
                .unwrap_or_else(|| "Rate limit exceeded".to_string());
            debug!(user_id = %self.profile.user_id, "Rate limited");
            return Self::single_error(message);
        }

        self.history.push(Message::user(text.into()));

        let mut history = mem::take(&mut self.history);
        let (event_tx, event_rx) = mpsc::channel(1);
        let (history_tx, history_rx) = oneshot::channel();
        self.pending = Some(history_rx);

        let turn = Turn {
            provider: Arc::clone(&self.provider),
            tools: Arc::clone(&self.tools),
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            max_iterations: self.config.max_iterations,
            system: build_system_prompt(&self.profile),
            tool_definitions: self.tools.definitions(),
        };

        tokio::spawn(async move {
            match turn.run(&mut history, &event_tx, &cancel).await {
                Ok(Outcome::Completed) => {
                    let _ = event_tx.send(AgentEvent::Done).await;
                }
                Ok(Outcome::Cancelled) => {
                    debug!("Turn cancelled, history kept at last committed message");
                }
                Err(err) => {
                    warn!(error = %err, "Turn failed");
                    let _ = event_tx
                        .send(AgentEvent::Error { message: err.to_string() })
                        .await;
                }
            }
            let _ = history_tx.send(history);
        });

        event_rx
    }

    /// Take back the history from a finished (or cancelled) producer task.
    async fn reclaim(&mut self) {
        if let Some(rx) = self.pending.take() {
            if let Ok(history) = rx.await {
                self.history = history;
            }
        }
    }

    fn single_error(message: String) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let _ = tx.send(AgentEvent::Error { message }).await;
        });
        rx
    }
}

/// Everything one producer turn needs, moved into the spawned task.
struct Turn {
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    model: String,
    max_tokens: u32,
    max_iterations: u32,
    system: String,
    tool_definitions: Vec<ToolDefinition>,
}

impl Turn {
    /// The bounded provider/tool loop. Mutates `history` only with fully
    /// committed messages; a cancelled or failed iteration leaves no
    /// partial message behind.
    async fn run(
        &self,
        history: &mut Vec<Message>,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Outcome, AgentError> {
        for iteration in 0..self.max_iterations {
            debug!(iteration, "Issuing provider call");
            let request = CompletionRequest {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                system: self.system.clone(),
                messages: history.clone(),
                tools: self.tool_definitions.clone(),
            };

            let mut stream = tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                result = self.provider.stream(request) => result?,
            };

            let mut aggregator = StreamAggregator::new();
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                    item = stream.recv() => item,
                };
                let Some(item) = item else { break };
                let event = item?;
                let message_done = matches!(event, StreamEvent::MessageStop);
                if let Some(text) = aggregator.push(event)? {
                    if events.send(AgentEvent::TextFragment { text }).await.is_err() {
                        return Ok(Outcome::Cancelled);
                    }
                }
                if message_done {
                    break;
                }
            }

            let (blocks, stop_reason) = aggregator.finish()?;
            let tool_uses: Vec<(String, String, serde_json::Value)> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            if stop_reason != StopReason::ToolUse || tool_uses.is_empty() {
                history.push(Message::assistant_blocks(blocks));
                return Ok(Outcome::Completed);
            }

            // Dispatch in block order; the assistant message and its result
            // message commit together, so cancellation mid-dispatch never
            // leaves a tool use without its result in history.
            let mut results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in tool_uses {
                if events
                    .send(AgentEvent::ToolCall { name: name.clone() })
                    .await
                    .is_err()
                {
                    return Ok(Outcome::Cancelled);
                }
                let output = tokio::select! {
                    _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                    output = self.tools.dispatch(&name, input) => output,
                };
                results.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: output,
                });
            }
            history.push(Message::assistant_blocks(blocks));
            history.push(Message::user_blocks(results));
        }

        Err(AgentError::IterationLimit(self.max_iterations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mealmind_core::error::{ProviderError, ToolError};
    use mealmind_core::message::{MessageContent, Role};
    use mealmind_core::provider::{BlockKind, Delta, MessageDeltaBody};
    use mealmind_core::tool::Tool;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back one pre-written event script per provider call.
    struct ScriptedProvider {
        scripts: Mutex<Vec<Vec<StreamEvent>>>,
        calls: AtomicUsize,
        fail_with: Option<ProviderError>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(err: ProviderError) -> Self {
            Self {
                scripts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_with: Some(err),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                for event in script {
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    /// A provider whose stream stays open forever without producing events.
    struct StallingProvider {
        holders: Mutex<Vec<mpsc::Sender<Result<StreamEvent, ProviderError>>>>,
    }

    #[async_trait]
    impl CompletionProvider for StallingProvider {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
            let (tx, rx) = mpsc::channel(1);
            self.holders.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    /// Records dispatch order and echoes a fixed payload.
    struct RecordingTool {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "records invocations"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        async fn invoke(&self, _input: serde_json::Value) -> Result<String, ToolError> {
            self.log.lock().unwrap().push(self.name.to_string());
            Ok(format!("{{\"tool\": \"{}\"}}", self.name))
        }
    }

    fn config() -> AssistantConfig {
        let mut config = AssistantConfig::default();
        config.api_key = Some("test-key".into());
        config
    }

    fn profile() -> CallerProfile {
        CallerProfile {
            user_id: "user-1".into(),
            display_name: "Dr. Amara Osei".into(),
            role: "practitioner".into(),
        }
    }

    fn permissive_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(crate::rate_limit::RatePolicy::new(1000, 10_000)))
    }

    fn make_loop(provider: Arc<dyn CompletionProvider>, tools: ToolRegistry) -> AssistantLoop {
        AssistantLoop::new(config(), provider, Arc::new(tools), permissive_limiter(), profile())
    }

    async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn text_turn(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageStart,
            StreamEvent::BlockStart {
                index: 0,
                content_block: BlockKind::Text { text: String::new() },
            },
            StreamEvent::BlockDelta {
                index: 0,
                delta: Delta::Text { text: text.into() },
            },
            StreamEvent::BlockStop { index: 0 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody { stop_reason: Some("end_turn".into()) },
            },
            StreamEvent::MessageStop,
        ]
    }

    fn tool_turn(uses: &[(&str, &str)]) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::MessageStart];
        for (index, (id, name)) in uses.iter().enumerate() {
            events.push(StreamEvent::BlockStart {
                index,
                content_block: BlockKind::ToolUse {
                    id: (*id).into(),
                    name: (*name).into(),
                    input: json!({}),
                },
            });
            events.push(StreamEvent::BlockDelta {
                index,
                delta: Delta::InputJson { partial_json: "{}".into() },
            });
            events.push(StreamEvent::BlockStop { index });
        }
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody { stop_reason: Some("tool_use".into()) },
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    #[tokio::test]
    async fn missing_credential_emits_one_error_without_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let mut assistant = AssistantLoop::new(
            AssistantConfig::default(),
            provider.clone(),
            Arc::new(ToolRegistry::new()),
            permissive_limiter(),
            profile(),
        );

        let events = collect(assistant.send_message("hi", CancellationToken::new()).await).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Error { message } if message.contains("credential")));
        assert!(assistant.history().await.is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn rate_denial_emits_one_error_without_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("hello")]));
        let limiter = Arc::new(RateLimiter::new(crate::rate_limit::RatePolicy::new(1, 100)));
        let mut assistant = AssistantLoop::new(
            config(),
            provider.clone(),
            Arc::new(ToolRegistry::new()),
            limiter,
            profile(),
        );

        // First call consumes the whole minute quota
        collect(assistant.send_message("one", CancellationToken::new()).await).await;
        let before = assistant.history().await.len();

        let events = collect(assistant.send_message("two", CancellationToken::new()).await).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Error { message } if message.contains("per minute")));
        assert_eq!(assistant.history().await.len(), before);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn single_turn_streams_text_then_done() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("hello there")]));
        let mut assistant = make_loop(provider, ToolRegistry::new());

        let events = collect(assistant.send_message("hi", CancellationToken::new()).await).await;
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextFragment { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello there");
        assert_eq!(
            events.iter().filter(|e| matches!(e, AgentEvent::Done)).count(),
            1
        );
        assert!(matches!(events.last(), Some(AgentEvent::Done)));

        let history = assistant.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].display.as_deref(), Some("hello there"));
    }

    #[tokio::test]
    async fn tool_turn_dispatches_in_order_with_one_result_message() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(RecordingTool { name: "get_client", log: log.clone() }));
        tools.register(Box::new(RecordingTool { name: "list_appointments", log: log.clone() }));

        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_turn(&[("tu_1", "get_client"), ("tu_2", "list_appointments")]),
            text_turn("All set."),
        ]));
        let mut assistant = make_loop(provider.clone(), tools);

        let events = collect(assistant.send_message("check", CancellationToken::new()).await).await;
        let calls: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCall { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(calls, vec!["get_client", "list_appointments"]);
        assert_eq!(*log.lock().unwrap(), vec!["get_client", "list_appointments"]);
        assert_eq!(provider.call_count(), 2);

        // user, assistant(tool uses), user(both results), assistant(text)
        let history = assistant.history().await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[2].role, Role::User);
        match &history[2].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(
                    &blocks[0],
                    ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_1"
                ));
                assert!(matches!(
                    &blocks[1],
                    ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tu_2"
                ));
            }
            other => panic!("expected block content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn iteration_cap_bounds_provider_calls() {
        let scripts: Vec<_> = (0..20)
            .map(|_| tool_turn(&[("tu_x", "get_client")]))
            .collect();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(RecordingTool { name: "get_client", log }));

        let provider = Arc::new(ScriptedProvider::new(scripts));
        let mut assistant = make_loop(provider.clone(), tools);

        let events = collect(assistant.send_message("loop", CancellationToken::new()).await).await;
        assert_eq!(provider.call_count(), 10);
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            AgentEvent::Error { message } if message.contains("iteration limit")
        ));
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Done)));
    }

    #[tokio::test]
    async fn unknown_tool_feeds_error_payload_back_and_continues() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_turn(&[("tu_1", "no_such_tool")]),
            text_turn("Recovered."),
        ]));
        let mut assistant = make_loop(provider.clone(), ToolRegistry::new());

        let events = collect(assistant.send_message("go", CancellationToken::new()).await).await;
        assert!(matches!(events.last(), Some(AgentEvent::Done)));
        assert_eq!(provider.call_count(), 2);

        let history = assistant.history().await;
        match &history[2].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { content, .. } => {
                    assert!(content.contains("error"));
                }
                other => panic!("expected tool result, got {other:?}"),
            },
            other => panic!("expected block content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_failure_emits_one_error_keeping_committed_history() {
        let provider = Arc::new(ScriptedProvider::failing(ProviderError::Network(
            "connection refused".into(),
        )));
        let mut assistant = make_loop(provider, ToolRegistry::new());

        let events = collect(assistant.send_message("hi", CancellationToken::new()).await).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Error { .. }));

        // The user message was committed before the provider call failed
        let history = assistant.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn cancellation_stops_turn_and_keeps_committed_history() {
        let provider = Arc::new(StallingProvider { holders: Mutex::new(Vec::new()) });
        let mut assistant = make_loop(provider, ToolRegistry::new());

        let cancel = CancellationToken::new();
        let mut rx = assistant.send_message("hi", cancel.clone()).await;
        cancel.cancel();

        // Channel closes with no terminal event
        assert!(rx.recv().await.is_none());

        let history = assistant.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn clear_history_resets_state() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("a"), text_turn("b")]));
        let mut assistant = make_loop(provider, ToolRegistry::new());

        collect(assistant.send_message("one", CancellationToken::new()).await).await;
        assert!(!assistant.history().await.is_empty());

        assistant.clear_history().await;
        assert!(assistant.history().await.is_empty());

        collect(assistant.send_message("two", CancellationToken::new()).await).await;
        assert_eq!(assistant.history().await.len(), 2);
    }

    #[tokio::test]
    async fn resume_seeds_history_for_next_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_turn("welcome back")]));
        let mut assistant = make_loop(provider, ToolRegistry::new());

        assistant
            .resume(vec![Message::user("earlier question"), Message::assistant_blocks(vec![
                ContentBlock::Text { text: "earlier answer".into() },
            ])])
            .await;

        collect(assistant.send_message("next", CancellationToken::new()).await).await;
        assert_eq!(assistant.history().await.len(), 4);
    }
}
