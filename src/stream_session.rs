//! One request/response exchange.
//!
//! A [`StreamSession`] appends the user turn and an assistant placeholder,
//! opens the transport, feeds the body through a [`StreamChunkParser`] and
//! routes the decoded events: text into the placeholder, tool calls into a
//! per-session [`ToolUseDispatcher`]. Confirmation prompts run concurrently
//! with the stream so a slow user never stalls it.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::attachments::Attachment;
use crate::conversation_store::ConversationStore;
use crate::error::{FrameError, SessionError, StoreError, TransportError};
use crate::events::{
    ChatDonePayload, ChatErrorPayload, ChatUpdatePayload, ClientEvent, ContextRequestedPayload,
    EventSink, ToastPayload,
};
use crate::protocol::{
    ChatMessage, MessagePatch, MessageState, OutboundRequest, RequestContext, StreamEvent,
};
use crate::stream_parser::{StreamChunkParser, Utf8Decoder};
use crate::tool_dispatcher::{
    Action, ConfirmationFamily, ConfirmationPrompter, Dispatch, IntegrationQueue, SessionContext,
    ToolUseDispatcher,
};
use crate::transport::{ByteStream, ChatTransport};

pub const APOLOGY: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

/// Content of a message stopped before any text arrived
pub const STOPPED_MARKER: &str = "[stopped]";

/// What the user is sending
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub conversation_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub environment: Map<String, Value>,
}

impl Submission {
    pub fn new(conversation_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Cloneable handle that stops a running session
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub conversation_id: String,
    /// Final state of the assistant message
    pub message: ChatMessage,
    /// Actions performed, in the order they ran
    pub actions: Vec<Action>,
    pub parse_errors: Vec<FrameError>,
}

type ConfirmationFuture = BoxFuture<'static, (ConfirmationFamily, bool)>;

/// Per-exchange mutable state
struct Exchange {
    ctx: SessionContext,
    message: ChatMessage,
    text: String,
    dispatcher: ToolUseDispatcher,
    actions: Vec<Action>,
    settled: bool,
}

pub struct StreamSession {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    prompter: Arc<dyn ConfirmationPrompter>,
    integrations: Arc<IntegrationQueue>,
    events: EventSink,
    stop: StopHandle,
}

impl StreamSession {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        prompter: Arc<dyn ConfirmationPrompter>,
        integrations: Arc<IntegrationQueue>,
        events: EventSink,
    ) -> Self {
        Self {
            store,
            transport,
            prompter,
            integrations,
            events,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs the exchange to a terminal state.
    ///
    /// Only an overlapping submission is an error. Transport failures settle
    /// the assistant message with an apology instead.
    pub async fn submit(self, submission: Submission) -> Result<SessionOutcome, SessionError> {
        let conversation_id = submission.conversation_id.clone();
        if self.store.has_in_flight(&conversation_id) {
            return Err(StoreError::AssistantInFlight { conversation_id }.into());
        }

        let context = RequestContext::from_messages(&self.store.messages(&conversation_id));
        let context = submission
            .environment
            .into_iter()
            .fold(context, |ctx, (key, value)| ctx.with_environment(key, value));

        let user = ChatMessage::user(submission.prompt.clone())
            .with_attachments(submission.attachments.iter().map(Attachment::to_ref).collect());
        let user_id = user.id.clone();
        self.store.append(&conversation_id, user)?;

        let placeholder = ChatMessage::assistant_placeholder();
        if let Err(err) = self.store.append(&conversation_id, placeholder.clone()) {
            // Lost a race with another submission: undo the user turn
            self.store.delete(&conversation_id, &user_id);
            return Err(err.into());
        }

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %placeholder.id,
            attachments = submission.attachments.len(),
            "submitting prompt"
        );

        let mut ex = Exchange {
            ctx: SessionContext {
                conversation_id: conversation_id.clone(),
            },
            message: placeholder,
            text: String::new(),
            dispatcher: ToolUseDispatcher::new(),
            actions: Vec::new(),
            settled: false,
        };

        let request = OutboundRequest {
            prompt: submission.prompt,
            conversation_id: conversation_id.clone(),
            attachments: submission.attachments,
            context,
        };

        let opened = tokio::select! {
            _ = self.stop.token.cancelled() => None,
            res = self.transport.open(request) => Some(res),
        };
        let stream = match opened {
            None => {
                self.settle_stopped(&mut ex);
                return Ok(self.outcome(ex, Vec::new()));
            }
            Some(Err(err)) => {
                self.settle_failed(&mut ex, &err);
                return Ok(self.outcome(ex, Vec::new()));
            }
            Some(Ok(stream)) => stream,
        };

        let mut parser = StreamChunkParser::new(self.transport.wire_format());
        let mut decoder = Utf8Decoder::new();
        let mut stream: Option<ByteStream> = Some(stream);
        let mut confirmations: FuturesUnordered<ConfirmationFuture> = FuturesUnordered::new();

        loop {
            if stream.is_none() && confirmations.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.stop.token.cancelled() => {
                    // Dropping the body aborts the request
                    drop(stream.take());
                    let discarded = ex.dispatcher.discard_pending();
                    if discarded > 0 {
                        tracing::debug!(discarded, "discarded unconfirmed tool calls");
                    }
                    if !ex.settled {
                        self.settle_stopped(&mut ex);
                    }
                    break;
                }

                Some((family, granted)) = confirmations.next(), if !confirmations.is_empty() => {
                    tracing::debug!(?family, granted, "confirmation settled");
                    for action in ex.dispatcher.resolve(family, granted, &ex.ctx) {
                        self.perform(&mut ex, action);
                    }
                }

                chunk = next_chunk(&mut stream), if stream.is_some() => match chunk {
                    Some(Ok(bytes)) => {
                        let text = decoder.decode(&bytes);
                        let events = parser.feed(&text);
                        if self.apply_all(&mut ex, events, &mut confirmations) {
                            stream = None;
                        }
                    }
                    Some(Err(err)) => {
                        stream = None;
                        confirmations = FuturesUnordered::new();
                        self.settle_failed(&mut ex, &err);
                    }
                    None => {
                        stream = None;
                        let mut events = parser.feed(&decoder.finish());
                        events.extend(parser.finish());
                        if !self.apply_all(&mut ex, events, &mut confirmations) {
                            tracing::warn!(
                                conversation_id = %ex.ctx.conversation_id,
                                "stream closed without a done frame"
                            );
                            let patch = MessagePatch::default().with_state(MessageState::Complete);
                            self.settle(&mut ex, patch);
                        }
                    }
                },
            }
        }

        Ok(self.outcome(ex, parser.take_errors()))
    }

    /// Applies events in order. Returns true once `done` has been seen;
    /// anything after it is ignored.
    fn apply_all(
        &self,
        ex: &mut Exchange,
        events: Vec<StreamEvent>,
        confirmations: &mut FuturesUnordered<ConfirmationFuture>,
    ) -> bool {
        for event in events {
            if ex.settled {
                return true;
            }
            match event {
                StreamEvent::Text { content } => {
                    ex.text.push_str(&content);
                    let patch = MessagePatch::content(ex.text.clone());
                    self.patch(ex, patch);
                    self.events.emit(ClientEvent::ChatUpdate(ChatUpdatePayload {
                        conversation_id: ex.ctx.conversation_id.clone(),
                        message_id: ex.message.id.clone(),
                        delta: content,
                        content: ex.text.clone(),
                    }));
                }
                StreamEvent::ToolUse(tool) => match ex.dispatcher.handle(&tool, &ex.ctx) {
                    Dispatch::Ready(action) => self.perform(ex, action),
                    Dispatch::AwaitConfirmation(request) => {
                        let family = request.family;
                        self.events.emit(ClientEvent::RequestConfirmation(request.clone()));
                        let prompter = Arc::clone(&self.prompter);
                        confirmations.push(
                            async move { (family, prompter.confirm(request).await) }.boxed(),
                        );
                    }
                    Dispatch::Deferred => {
                        tracing::debug!(tool = %tool.name, "tool call waiting on confirmation");
                    }
                    Dispatch::Dropped => {}
                },
                StreamEvent::MessageDelta { .. } => {
                    tracing::debug!("ignoring message_delta frame");
                }
                StreamEvent::Error { message } => {
                    tracing::warn!(
                        conversation_id = %ex.ctx.conversation_id,
                        %message,
                        "backend reported an error"
                    );
                    self.events.emit(ClientEvent::Toast(ToastPayload {
                        conversation_id: ex.ctx.conversation_id.clone(),
                        message,
                    }));
                }
                StreamEvent::Done => {
                    self.settle(ex, MessagePatch::default().with_state(MessageState::Complete));
                }
            }
        }
        ex.settled
    }

    fn perform(&self, ex: &mut Exchange, action: Action) {
        match &action {
            Action::Integration(pending) => {
                tracing::info!(
                    integration = ?pending.integration,
                    id = %pending.id,
                    "queued integration request"
                );
                self.integrations.push(pending.clone());
                self.events.emit(ClientEvent::IntegrationPending(pending.clone()));
            }
            Action::ContextRequest {
                family,
                conversation_id,
                tool_name,
                input,
            } => {
                self.events.emit(ClientEvent::ContextRequested(ContextRequestedPayload {
                    family: *family,
                    conversation_id: conversation_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                }));
            }
        }
        ex.actions.push(action);
    }

    fn patch(&self, ex: &mut Exchange, patch: MessagePatch) {
        patch.apply_to(&mut ex.message);
        if !self
            .store
            .patch_last_matching(&ex.ctx.conversation_id, &ex.message.id, &patch)
        {
            tracing::debug!(message_id = %ex.message.id, "placeholder no longer last, patch skipped");
        }
    }

    fn settle(&self, ex: &mut Exchange, patch: MessagePatch) {
        self.patch(ex, patch);
        ex.settled = true;
        tracing::info!(
            conversation_id = %ex.ctx.conversation_id,
            state = ?ex.message.state,
            chars = ex.text.chars().count(),
            "assistant message settled"
        );
        self.events.emit(ClientEvent::ChatDone(ChatDonePayload {
            conversation_id: ex.ctx.conversation_id.clone(),
            message_id: ex.message.id.clone(),
            state: ex.message.state,
        }));
    }

    fn settle_failed(&self, ex: &mut Exchange, err: &TransportError) {
        tracing::error!(conversation_id = %ex.ctx.conversation_id, error = %err, "chat stream failed");
        self.events.emit(ClientEvent::ChatError(ChatErrorPayload {
            conversation_id: ex.ctx.conversation_id.clone(),
            error: err.to_string(),
        }));
        ex.dispatcher.discard_pending();
        self.settle(
            ex,
            MessagePatch::content(APOLOGY)
                .with_error(err.to_string())
                .with_state(MessageState::Failed),
        );
    }

    fn settle_stopped(&self, ex: &mut Exchange) {
        let content = if ex.text.is_empty() {
            STOPPED_MARKER.to_string()
        } else {
            ex.text.clone()
        };
        self.settle(
            ex,
            MessagePatch::content(content).with_state(MessageState::Cancelled),
        );
    }

    fn outcome(&self, ex: Exchange, parse_errors: Vec<FrameError>) -> SessionOutcome {
        SessionOutcome {
            conversation_id: ex.ctx.conversation_id,
            message: ex.message,
            actions: ex.actions,
            parse_errors,
        }
    }
}

async fn next_chunk(stream: &mut Option<ByteStream>) -> Option<Result<bytes::Bytes, TransportError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatRole;
    use crate::stream_parser::WireFormat;
    use crate::tool_dispatcher::ConfirmationRequest;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    struct FakeTransport {
        format: WireFormat,
        chunks: Vec<Vec<u8>>,
        hang_after: bool,
        fail_open: bool,
    }

    impl FakeTransport {
        fn json(chunks: &[&str]) -> Self {
            Self {
                format: WireFormat::JsonObjects,
                chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                hang_after: false,
                fail_open: false,
            }
        }
    }

    #[async_trait]
    impl ChatTransport for FakeTransport {
        fn wire_format(&self) -> WireFormat {
            self.format
        }

        async fn open(&self, _request: OutboundRequest) -> Result<ByteStream, TransportError> {
            if self.fail_open {
                return Err(TransportError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            let body = futures::stream::iter(
                self.chunks
                    .clone()
                    .into_iter()
                    .map(|c| Ok(Bytes::from(c))),
            );
            if self.hang_after {
                Ok(body.chain(futures::stream::pending()).boxed())
            } else {
                Ok(body.boxed())
            }
        }
    }

    struct CountingPrompter {
        answer: bool,
        asked: AtomicUsize,
    }

    #[async_trait]
    impl ConfirmationPrompter for CountingPrompter {
        async fn confirm(&self, _request: ConfirmationRequest) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    /// Holds the answer until the test sends it
    struct GatedPrompter {
        gate: Mutex<Option<oneshot::Receiver<bool>>>,
    }

    impl GatedPrompter {
        fn new() -> (Arc<Self>, oneshot::Sender<bool>) {
            let (tx, rx) = oneshot::channel();
            let prompter = Arc::new(Self {
                gate: Mutex::new(Some(rx)),
            });
            (prompter, tx)
        }
    }

    #[async_trait]
    impl ConfirmationPrompter for GatedPrompter {
        async fn confirm(&self, _request: ConfirmationRequest) -> bool {
            let gate = self.gate.lock().unwrap().take();
            match gate {
                Some(rx) => rx.await.unwrap_or(false),
                None => false,
            }
        }
    }

    struct Harness {
        store: Arc<ConversationStore>,
        integrations: Arc<IntegrationQueue>,
        prompter: Arc<CountingPrompter>,
        events: EventSink,
        rx: tokio::sync::mpsc::UnboundedReceiver<ClientEvent>,
    }

    impl Harness {
        fn new(answer: bool) -> Self {
            let (events, rx) = EventSink::channel();
            Self {
                store: Arc::new(ConversationStore::new()),
                integrations: Arc::new(IntegrationQueue::new()),
                prompter: Arc::new(CountingPrompter {
                    answer,
                    asked: AtomicUsize::new(0),
                }),
                events,
                rx,
            }
        }

        fn session(&self, transport: FakeTransport) -> StreamSession {
            self.session_with(transport, self.prompter.clone())
        }

        fn session_with(
            &self,
            transport: FakeTransport,
            prompter: Arc<dyn ConfirmationPrompter>,
        ) -> StreamSession {
            StreamSession::new(
                Arc::clone(&self.store),
                Arc::new(transport),
                prompter,
                Arc::clone(&self.integrations),
                self.events.clone(),
            )
        }

        fn drain(&mut self) -> Vec<ClientEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[tokio::test]
    async fn test_fragmented_text_settles_complete() {
        let h = Harness::new(true);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"te",
            "xt\",\"content\":\"Hel",
            "lo\"}",
            "{\"type\":\"done\"}",
        ]));

        let outcome = session.submit(Submission::new("c1", "hi")).await.unwrap();

        assert_eq!(outcome.message.content, "Hello");
        assert_eq!(outcome.message.state, MessageState::Complete);
        let messages = h.store.messages("c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[1].content, "Hello");
        assert!(!h.store.has_in_flight("c1"));
    }

    #[tokio::test]
    async fn test_text_deltas_concatenate() {
        let h = Harness::new(true);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"text\",\"content\":\"one \"}{\"type\":\"text\",\"content\":\"two\"}",
            "{\"type\":\"message_delta\",\"usage\":{}}{\"type\":\"done\"}",
        ]));

        let outcome = session.submit(Submission::new("c1", "count")).await.unwrap();
        assert_eq!(outcome.message.content, "one two");
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let h = Harness::new(true);
        let body = "{\"type\":\"text\",\"content\":\"caf\u{e9}\"}{\"type\":\"done\"}".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let transport = FakeTransport {
            format: WireFormat::JsonObjects,
            chunks: vec![body[..split].to_vec(), body[split..].to_vec()],
            hang_after: false,
            fail_open: false,
        };

        let outcome = h
            .session(transport)
            .submit(Submission::new("c1", "coffee"))
            .await
            .unwrap();
        assert_eq!(outcome.message.content, "café");
    }

    #[tokio::test]
    async fn test_transport_failure_settles_with_apology() {
        let mut h = Harness::new(true);
        let mut transport = FakeTransport::json(&[]);
        transport.fail_open = true;

        let outcome = h
            .session(transport)
            .submit(Submission::new("c1", "hi"))
            .await
            .unwrap();

        assert_eq!(outcome.message.content, APOLOGY);
        assert_eq!(outcome.message.state, MessageState::Failed);
        assert!(outcome.message.error.is_some());
        assert!(!h.store.has_in_flight("c1"));
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, ClientEvent::ChatError(_))));
    }

    #[tokio::test]
    async fn test_overlapping_submit_rejected() {
        let h = Harness::new(true);
        h.store
            .append("c1", ChatMessage::assistant_placeholder())
            .unwrap();

        let result = h
            .session(FakeTransport::json(&["{\"type\":\"done\"}"]))
            .submit(Submission::new("c1", "again"))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Store(StoreError::AssistantInFlight { .. }))
        ));
        assert_eq!(h.store.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_asked_once_and_replayed() {
        let h = Harness::new(true);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"tool_use\",\"name\":\"read_window\",\"input\":{\"window_id\":\"w1\"}}",
            "{\"type\":\"tool_use\",\"name\":\"read_window\",\"input\":{\"window_id\":\"w2\"}}",
            "{\"type\":\"text\",\"content\":\"ok\"}{\"type\":\"done\"}",
        ]));

        let outcome = session.submit(Submission::new("c1", "look")).await.unwrap();

        assert_eq!(h.prompter.asked.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.message.content, "ok");
    }

    #[tokio::test]
    async fn test_denied_confirmation_skips_action() {
        let h = Harness::new(false);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"tool_use\",\"name\":\"read_conversation\",\"input\":{\"conversation_id\":\"c0\"}}",
            "{\"type\":\"text\",\"content\":\"fine\"}{\"type\":\"done\"}",
        ]));

        let outcome = session.submit(Submission::new("c1", "peek")).await.unwrap();

        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.message.state, MessageState::Complete);
        assert_eq!(outcome.message.content, "fine");
    }

    #[tokio::test]
    async fn test_integration_queued_not_executed() {
        let mut h = Harness::new(true);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"tool_use\",\"name\":\"create_ticket\",\"input\":{\"title\":\"Bug\"}}",
            "{\"type\":\"tool_use\",\"name\":\"create_ticket\",\"input\":{}}",
            "{\"type\":\"done\"}",
        ]));

        let outcome = session.submit(Submission::new("c1", "file it")).await.unwrap();

        assert_eq!(outcome.actions.len(), 1);
        assert_eq!(h.integrations.len(), 1);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, ClientEvent::IntegrationPending(_))));
    }

    #[tokio::test]
    async fn test_error_frame_is_not_fatal() {
        let mut h = Harness::new(true);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"error\",\"content\":\"rate limited\"}",
            "{\"type\":\"text\",\"content\":\"still here\"}{\"type\":\"done\"}",
        ]));

        let outcome = session.submit(Submission::new("c1", "hi")).await.unwrap();

        assert_eq!(outcome.message.content, "still here");
        assert!(h.drain().iter().any(|e| matches!(e, ClientEvent::Toast(_))));
    }

    #[tokio::test]
    async fn test_stream_end_without_done_completes() {
        let h = Harness::new(true);
        let session = h.session(FakeTransport::json(&[
            "{\"type\":\"text\",\"content\":\"partial\"}",
            "{\"type\":\"te",
        ]));

        let outcome = session.submit(Submission::new("c1", "hi")).await.unwrap();

        assert_eq!(outcome.message.content, "partial");
        assert_eq!(outcome.message.state, MessageState::Complete);
        assert_eq!(outcome.parse_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_text_and_releases_lock() {
        let mut h = Harness::new(true);
        let mut transport = FakeTransport::json(&["{\"type\":\"text\",\"content\":\"Hal\"}"]);
        transport.hang_after = true;
        let session = h.session(transport);
        let stop = session.stop_handle();

        let task = tokio::spawn(session.submit(Submission::new("c1", "hi")));
        loop {
            match h.rx.recv().await {
                Some(ClientEvent::ChatUpdate(_)) => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        stop.request_stop();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.message.content, "Hal");
        assert_eq!(outcome.message.state, MessageState::Cancelled);
        assert!(!h.store.has_in_flight("c1"));
    }

    #[tokio::test]
    async fn test_stop_before_text_uses_marker() {
        let h = Harness::new(true);
        let mut transport = FakeTransport::json(&[]);
        transport.hang_after = true;
        let session = h.session(transport);
        session.stop_handle().request_stop();

        let outcome = session.submit(Submission::new("c1", "hi")).await.unwrap();
        assert_eq!(outcome.message.content, STOPPED_MARKER);
        assert_eq!(outcome.message.state, MessageState::Cancelled);
    }

    #[tokio::test]
    async fn test_user_turn_carries_attachment_refs() {
        let h = Harness::new(true);
        let submission = Submission::new("c1", "see file").with_attachments(vec![
            Attachment::TextFile {
                value: "notes.txt".to_string(),
            },
        ]);

        h.session(FakeTransport::json(&["{\"type\":\"done\"}"]))
            .submit(submission)
            .await
            .unwrap();

        let messages = h.store.messages("c1");
        assert_eq!(messages[0].attachments.len(), 1);
    }

    #[tokio::test]
    async fn test_text_settles_while_confirmation_pending() {
        let mut h = Harness::new(true);
        let (prompter, answer) = GatedPrompter::new();
        let session = h.session_with(
            FakeTransport::json(&[
                "{\"type\":\"tool_use\",\"name\":\"read_window\",\"input\":{\"window_id\":\"w1\"}}",
                "{\"type\":\"tool_use\",\"name\":\"read_window\",\"input\":{\"window_id\":\"w2\"}}",
                "{\"type\":\"text\",\"content\":\"working\"}",
                "{\"type\":\"done\"}",
            ]),
            prompter,
        );

        let task = tokio::spawn(session.submit(Submission::new("c1", "look")));
        let mut before_answer = Vec::new();
        loop {
            match h.rx.recv().await {
                Some(ClientEvent::ChatDone(done)) => {
                    assert_eq!(done.state, MessageState::Complete);
                    break;
                }
                Some(event) => before_answer.push(event),
                None => panic!("event channel closed"),
            }
        }

        let last = h.store.last_message("c1").unwrap();
        assert_eq!(last.content, "working");
        assert_eq!(last.state, MessageState::Complete);
        assert!(!h.store.has_in_flight("c1"));
        assert!(!task.is_finished());
        assert!(!before_answer
            .iter()
            .any(|e| matches!(e, ClientEvent::ContextRequested(_))));

        answer.send(true).unwrap();
        let outcome = task.await.unwrap().unwrap();

        assert_eq!(outcome.actions.len(), 2);
        assert_eq!(outcome.message.content, "working");
        let replayed = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::ContextRequested(_)))
            .count();
        assert_eq!(replayed, 2);
    }

    #[tokio::test]
    async fn test_stop_discards_calls_awaiting_confirmation() {
        let mut h = Harness::new(true);
        let (prompter, answer) = GatedPrompter::new();
        let mut transport = FakeTransport::json(&[
            "{\"type\":\"tool_use\",\"name\":\"read_window\",\"input\":{\"window_id\":\"w1\"}}",
            "{\"type\":\"text\",\"content\":\"Hal\"}",
        ]);
        transport.hang_after = true;
        let session = h.session_with(transport, prompter);
        let stop = session.stop_handle();

        let task = tokio::spawn(session.submit(Submission::new("c1", "look")));
        loop {
            match h.rx.recv().await {
                Some(ClientEvent::ChatUpdate(_)) => break,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        stop.request_stop();

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.actions.is_empty());
        assert_eq!(outcome.message.content, "Hal");
        assert_eq!(outcome.message.state, MessageState::Cancelled);
        assert!(!h.store.has_in_flight("c1"));

        // The prompt was abandoned, so a late answer goes nowhere
        assert!(answer.is_closed());
        assert!(!h
            .drain()
            .iter()
            .any(|e| matches!(e, ClientEvent::ContextRequested(_))));
    }
}
