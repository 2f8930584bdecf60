//! History Sync Engine
//!
//! Converges locally created conversations with the backend's durable
//! history. The server record (and its generated title) appears some time
//! after the first exchange, so every new conversation is polled under a
//! bounded exponential backoff until its title stops being the placeholder.
//!
//! Per-conversation lifecycle:
//!
//! ```text
//! LocalOnly -> FetchPending { attempt } -> Settled { title }
//!                      |
//!                      +-> Exhausted   (budget spent, stays local)
//! ```
//!
//! Each conversation retries on its own task, so a slow record never holds
//! up another.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::conversation_store::{ConversationStore, PLACEHOLDER_TITLE};
use crate::error::HistoryError;
use crate::events::{ClientEvent, EventSink, HistoryExhaustedPayload, HistorySettledPayload};
use crate::scheduler::{RetryPolicy, TaskScope};

/// One entry of the server's conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_conversations: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryListBody {
    Items(Vec<HistoryItem>),
    Wrapped {
        #[serde(alias = "conversations")]
        items: Vec<HistoryItem>,
    },
}

impl HistoryListBody {
    fn into_items(self) -> Vec<HistoryItem> {
        match self {
            HistoryListBody::Items(items) | HistoryListBody::Wrapped { items } => items,
        }
    }
}

#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// One page of the history list, zero-based
    async fn list(&self, page: u32, page_size: u32) -> Result<Vec<HistoryItem>, HistoryError>;

    /// `None` while the server has no record for `id`
    async fn get(&self, id: &str) -> Result<Option<HistoryItem>, HistoryError>;

    async fn delete(&self, id: &str) -> Result<(), HistoryError>;
}

pub struct HttpHistoryApi {
    base_url: String,
    http_client: reqwest::Client,
    api_key: String,
}

impl HttpHistoryApi {
    pub fn new(base_url: String, http_client: reqwest::Client, api_key: String) -> Self {
        Self {
            base_url,
            http_client,
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/conversations{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn list(&self, page: u32, page_size: u32) -> Result<Vec<HistoryItem>, HistoryError> {
        let response = self
            .authorized(self.http_client.get(self.url("")))
            .query(&[("page", page), ("page_size", page_size)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(HistoryError::Status {
                status: response.status().as_u16(),
            });
        }

        let text = response.text().await?;
        let body: HistoryListBody =
            serde_json::from_str(&text).map_err(|e| HistoryError::Decode(e.to_string()))?;
        Ok(body.into_items())
    }

    async fn get(&self, id: &str) -> Result<Option<HistoryItem>, HistoryError> {
        let response = self
            .authorized(self.http_client.get(self.url(&format!("/{id}"))))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(HistoryError::Status {
                status: response.status().as_u16(),
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| HistoryError::Decode(e.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), HistoryError> {
        let response = self
            .authorized(self.http_client.delete(self.url(&format!("/{id}"))))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(HistoryError::Status {
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    LocalOnly,
    FetchPending { attempt: u32 },
    Settled { title: String },
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub policy: RetryPolicy,
    pub placeholder_title: String,
    pub page_size: u32,
    /// Hard stop for backends that never return a short page
    pub max_pages: u32,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            placeholder_title: PLACEHOLDER_TITLE.to_string(),
            page_size: 50,
            max_pages: 20,
        }
    }
}

struct EngineInner {
    api: Arc<dyn HistoryApi>,
    store: Arc<ConversationStore>,
    events: EventSink,
    settings: HistorySettings,
    states: Mutex<HashMap<String, SyncState>>,
    synced: Mutex<HashMap<String, HistoryItem>>,
}

impl EngineInner {
    fn states(&self) -> MutexGuard<'_, HashMap<String, SyncState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn synced(&self) -> MutexGuard<'_, HashMap<String, HistoryItem>> {
        self.synced.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_placeholder(&self, title: &str) -> bool {
        let title = title.trim();
        title.is_empty() || title == self.settings.placeholder_title
    }

    fn set_state(&self, id: &str, state: SyncState) {
        self.states().insert(id.to_string(), state);
    }

    fn settle(&self, item: HistoryItem, attempts: u32) {
        tracing::info!(conversation_id = %item.id, title = %item.title, attempts, "history record settled");
        self.store.set_title(&item.id, &item.title);
        self.set_state(
            &item.id,
            SyncState::Settled {
                title: item.title.clone(),
            },
        );
        self.events.emit(ClientEvent::HistorySettled(HistorySettledPayload {
            conversation_id: item.id.clone(),
            title: item.title.clone(),
            attempts,
        }));
        self.synced().insert(item.id.clone(), item);
    }

    async fn poll_until_settled(self: Arc<Self>, id: String) {
        let policy = self.settings.policy;
        let mut attempt = 1;

        while let Some(delay) = policy.delay_for(attempt) {
            self.set_state(&id, SyncState::FetchPending { attempt });
            tokio::time::sleep(delay).await;

            match self.api.get(&id).await {
                Ok(Some(item)) if !self.is_placeholder(&item.title) => {
                    self.settle(item, attempt);
                    return;
                }
                Ok(Some(_)) => {
                    tracing::debug!(conversation_id = %id, attempt, "history title still placeholder");
                }
                Ok(None) => {
                    tracing::debug!(conversation_id = %id, attempt, "history record not created yet");
                }
                Err(e) => {
                    tracing::warn!(conversation_id = %id, attempt, error = %e, "history fetch failed");
                }
            }
            attempt += 1;
        }

        let attempts = attempt - 1;
        tracing::warn!(
            conversation_id = %id,
            attempts,
            "gave up waiting for history record, keeping placeholder title"
        );
        self.set_state(&id, SyncState::Exhausted);
        self.events.emit(ClientEvent::HistoryExhausted(HistoryExhaustedPayload {
            conversation_id: id,
            attempts,
        }));
    }
}

pub struct HistorySyncEngine {
    inner: Arc<EngineInner>,
    tasks: TaskScope,
}

impl HistorySyncEngine {
    pub fn new(
        api: Arc<dyn HistoryApi>,
        store: Arc<ConversationStore>,
        events: EventSink,
        settings: HistorySettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                api,
                store,
                events,
                settings,
                states: Mutex::new(HashMap::new()),
                synced: Mutex::new(HashMap::new()),
            }),
            tasks: TaskScope::new(),
        }
    }

    /// Starts polling for a conversation the synced list does not know yet.
    /// Returns false when it is already synced or already being tracked.
    pub fn track(&self, conversation_id: &str) -> bool {
        if self.inner.synced().contains_key(conversation_id) {
            return false;
        }
        if matches!(
            self.inner.states().get(conversation_id),
            Some(SyncState::FetchPending { .. } | SyncState::Settled { .. })
        ) {
            return false;
        }

        self.inner.set_state(conversation_id, SyncState::LocalOnly);
        let inner = Arc::clone(&self.inner);
        let spawned = self.tasks.spawn_keyed(
            conversation_id,
            inner.poll_until_settled(conversation_id.to_string()),
        );
        if spawned {
            tracing::debug!(%conversation_id, "tracking conversation for history sync");
        }
        spawned
    }

    /// Tracks every local id missing from the synced list. Returns how many
    /// started.
    pub fn reconcile(&self, local_ids: &[String]) -> usize {
        local_ids.iter().filter(|id| self.track(id)).count()
    }

    pub fn untrack(&self, conversation_id: &str) {
        self.tasks.cancel(conversation_id);
        self.inner.states().remove(conversation_id);
    }

    pub fn shutdown(&self) {
        let cancelled = self.tasks.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "history sync stopped");
        }
    }

    /// Resolves once every retry loop started so far has finished
    pub async fn wait_idle(&self) {
        self.tasks.join_all().await;
    }

    pub fn state(&self, conversation_id: &str) -> Option<SyncState> {
        self.inner.states().get(conversation_id).cloned()
    }

    /// Synced list, most recently updated first
    pub fn history(&self) -> Vec<HistoryItem> {
        let mut items: Vec<_> = self.inner.synced().values().cloned().collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items
    }

    /// Reloads the full list page by page. Paging stops on a short page, on
    /// a page holding only ids already seen, or after `max_pages`. Tracked
    /// conversations that now carry a real title settle immediately.
    pub async fn refresh_history(&self) -> Result<Vec<HistoryItem>, HistoryError> {
        let page_size = self.inner.settings.page_size.max(1);
        let max_pages = self.inner.settings.max_pages.max(1);
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut pages = 0;
        loop {
            let batch = self.inner.api.list(pages, page_size).await?;
            pages += 1;
            let short = batch.len() < page_size as usize;

            let fresh: Vec<_> = batch
                .into_iter()
                .filter(|item| seen.insert(item.id.clone()))
                .collect();
            if fresh.is_empty() && !short {
                tracing::warn!(page = pages - 1, "history page repeated earlier ids, paging stopped");
                break;
            }
            items.extend(fresh);
            if short {
                break;
            }
            if pages >= max_pages {
                tracing::warn!(max_pages, "history paging reached its page limit");
                break;
            }
        }
        tracing::info!(count = items.len(), pages, "history refreshed");

        let mut settled = Vec::new();
        {
            let states = self.inner.states();
            for item in &items {
                if matches!(
                    states.get(&item.id),
                    Some(SyncState::LocalOnly | SyncState::FetchPending { .. })
                ) && !self.inner.is_placeholder(&item.title)
                {
                    settled.push(item.clone());
                }
            }
        }
        for item in settled {
            self.tasks.cancel(&item.id);
            self.inner.settle(item, 0);
        }

        {
            let mut synced = self.inner.synced();
            synced.clear();
            for item in &items {
                if !self.inner.is_placeholder(&item.title) {
                    self.inner.store.set_title(&item.id, &item.title);
                }
                synced.insert(item.id.clone(), item.clone());
            }
        }

        Ok(self.history())
    }

    /// Deletes on the server, then forgets the conversation locally
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), HistoryError> {
        self.inner.api.delete(conversation_id).await?;
        self.untrack(conversation_id);
        self.inner.synced().remove(conversation_id);
        self.inner.store.clear(conversation_id);
        tracing::info!(%conversation_id, "conversation deleted");
        Ok(())
    }
}

impl Drop for HistorySyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
