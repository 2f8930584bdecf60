use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::attachments::{AddOutcome, Attachment, AttachmentSet};
use crate::config::ClientConfig;
use crate::conversation_store::ConversationStore;
use crate::error::{HistoryError, SessionError, StoreError};
use crate::events::EventSink;
use crate::external_events::{ExternalEventRouter, RouterCommand};
use crate::history_sync::{HistoryApi, HistorySyncEngine, HttpHistoryApi};
use crate::stream_session::{SessionOutcome, StopHandle, StreamSession, Submission};
use crate::tool_dispatcher::{ConfirmationPrompter, IntegrationQueue};
use crate::transport::{ChatTransport, HttpTransport};

/// Everything one client session shares, built once and passed around
pub struct ClientState {
    pub config: ClientConfig,
    pub store: Arc<ConversationStore>,
    pub integrations: Arc<IntegrationQueue>,
    pub history: HistorySyncEngine,
    pub router: ExternalEventRouter,
    attachments: Mutex<AttachmentSet>,
    transport: Arc<dyn ChatTransport>,
    prompter: Arc<dyn ConfirmationPrompter>,
    events: EventSink,
    active_streams: Mutex<HashMap<String, StopHandle>>,
}

impl ClientState {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn ChatTransport>,
        history_api: Arc<dyn HistoryApi>,
        prompter: Arc<dyn ConfirmationPrompter>,
        events: EventSink,
    ) -> Self {
        let store = Arc::new(ConversationStore::new());
        let history = HistorySyncEngine::new(
            history_api,
            Arc::clone(&store),
            events.clone(),
            config.history.settings(),
        );
        let router = ExternalEventRouter::new(Arc::clone(&store), config.idempotency_ttl());

        Self {
            config,
            store,
            integrations: Arc::new(IntegrationQueue::new()),
            history,
            router,
            attachments: Mutex::new(AttachmentSet::new()),
            transport,
            prompter,
            events,
            active_streams: Mutex::new(HashMap::new()),
        }
    }

    /// Wires the HTTP transport and history client from `config`
    pub fn from_config(
        config: ClientConfig,
        prompter: Arc<dyn ConfirmationPrompter>,
        events: EventSink,
    ) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let transport = Arc::new(HttpTransport::new(
            config.backend_url.clone(),
            http_client.clone(),
            config.api_key.clone(),
            config.wire_format,
            config.audio_char_budget,
        ));
        let history_api = Arc::new(HttpHistoryApi::new(
            config.backend_url.clone(),
            http_client,
            config.api_key.clone(),
        ));

        Ok(Self::new(config, transport, history_api, prompter, events))
    }

    fn attachments_lock(&self) -> MutexGuard<'_, AttachmentSet> {
        self.attachments.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn streams_lock(&self) -> MutexGuard<'_, HashMap<String, StopHandle>> {
        self.active_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_attachment(&self, attachment: Attachment) -> AddOutcome {
        self.attachments_lock().add(attachment)
    }

    pub fn remove_attachment(&self, attachment: &Attachment) -> bool {
        self.attachments_lock().remove(attachment)
    }

    pub fn clear_attachments(&self) {
        self.attachments_lock().clear();
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.attachments_lock().iter().cloned().collect()
    }

    /// Sends `prompt` with the current attachments. A new conversation id is
    /// minted when none is given.
    pub async fn send(
        &self,
        conversation_id: Option<&str>,
        prompt: &str,
    ) -> Result<SessionOutcome, SessionError> {
        let conversation_id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let session = StreamSession::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.prompter),
            Arc::clone(&self.integrations),
            self.events.clone(),
        );
        match self.streams_lock().entry(conversation_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(session.stop_handle());
            }
            Entry::Occupied(_) => {
                tracing::warn!(%conversation_id, "submission rejected, a stream is already running");
                return Err(StoreError::AssistantInFlight { conversation_id }.into());
            }
        }

        let attachments = self.attachments_lock().take();
        let mut environment = Map::new();
        environment.insert(
            "client_version".to_string(),
            Value::String(env!("CARGO_PKG_VERSION").to_string()),
        );
        let submission = Submission {
            conversation_id: conversation_id.clone(),
            prompt: prompt.to_string(),
            attachments: attachments.clone(),
            environment,
        };

        let result = session.submit(submission).await;
        self.streams_lock().remove(&conversation_id);

        match result {
            Ok(outcome) => {
                self.router.flush_parked(&conversation_id);
                self.history.track(&conversation_id);
                Ok(outcome)
            }
            Err(err) => {
                // Rejected before anything was sent: give the attachments back
                let mut set = self.attachments_lock();
                for attachment in attachments {
                    set.add(attachment);
                }
                Err(err)
            }
        }
    }

    /// Stops the stream running in `conversation_id`, if any
    pub fn stop(&self, conversation_id: &str) -> bool {
        match self.streams_lock().get(conversation_id) {
            Some(handle) => {
                handle.request_stop();
                true
            }
            None => false,
        }
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.streams_lock().contains_key(conversation_id)
    }

    pub fn close_conversation(&self, conversation_id: &str) {
        self.stop(conversation_id);
        self.router.discard_parked(conversation_id);
        self.store.clear(conversation_id);
    }

    pub fn close_other_conversations(&self, keep: &str) {
        let others: Vec<String> = self
            .streams_lock()
            .keys()
            .filter(|id| id.as_str() != keep)
            .cloned()
            .collect();
        for id in others {
            self.stop(&id);
        }
        self.router.discard_parked_except(keep);
        self.store.clear_all_except(keep);
    }

    /// Deletes on the server and drops everything held locally for it
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), HistoryError> {
        self.stop(conversation_id);
        self.history.delete_conversation(conversation_id).await?;
        self.router.discard_parked(conversation_id);
        Ok(())
    }

    /// Loads the server list and starts tracking local conversations it
    /// does not contain yet
    pub async fn sync_history(&self) -> Result<usize, HistoryError> {
        self.history.refresh_history().await?;
        Ok(self.history.reconcile(&self.store.ids()))
    }

    /// Routes a host message and runs any submission it asks for. Commands
    /// meant for the host are returned.
    pub async fn handle_host_message(&self, raw: &str) -> Vec<RouterCommand> {
        let mut for_host = Vec::new();
        for command in self.router.route_json(raw) {
            match command {
                RouterCommand::Submit {
                    conversation_id,
                    prompt,
                    delivery_id,
                } => {
                    self.router.take_draft();
                    if let Err(e) = self.send(conversation_id.as_deref(), &prompt).await {
                        tracing::warn!(error = %e, "host-triggered submission rejected");
                        if let Some(id) = delivery_id {
                            self.router.release(&id);
                        }
                    }
                }
                other => for_host.push(other),
            }
        }
        for_host
    }

    pub fn shutdown(&self) {
        for handle in self.streams_lock().values() {
            handle.request_stop();
        }
        self.history.shutdown();
    }
}
