//! Tool Use Dispatcher
//!
//! Turns `tool_use` events into actions. Context-elevation tools need the
//! user's consent, asked at most once per confirmation family per session;
//! events arriving while a decision is outstanding are deferred and replayed
//! (or dropped) when it settles. Integration tools never call the external
//! system here: they become [`PendingIntegration`] records for a downstream
//! executor to preview and run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::ToolInputError;
use crate::protocol::ToolUse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationFamily {
    /// Read the contents of another window
    WindowContext,
    /// Read another conversation's transcript
    ConversationContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integration {
    Ticket,
    Page,
    CalendarEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    ContextRequest(ConfirmationFamily),
    Integration(Integration),
}

struct ToolSpec {
    names: &'static [&'static str],
    kind: ToolKind,
    required: &'static [&'static str],
}

const TOOL_CATALOG: &[ToolSpec] = &[
    ToolSpec {
        names: &["read_window", "request_window_context"],
        kind: ToolKind::ContextRequest(ConfirmationFamily::WindowContext),
        required: &["window_id"],
    },
    ToolSpec {
        names: &["read_conversation", "request_conversation_context"],
        kind: ToolKind::ContextRequest(ConfirmationFamily::ConversationContext),
        required: &["conversation_id"],
    },
    ToolSpec {
        names: &["create_ticket"],
        kind: ToolKind::Integration(Integration::Ticket),
        required: &["title"],
    },
    ToolSpec {
        names: &["create_page"],
        kind: ToolKind::Integration(Integration::Page),
        required: &["title"],
    },
    ToolSpec {
        names: &["create_event"],
        kind: ToolKind::Integration(Integration::CalendarEvent),
        required: &["title", "start"],
    },
];

fn lookup(name: &str) -> Option<&'static ToolSpec> {
    TOOL_CATALOG
        .iter()
        .find(|spec| spec.names.iter().any(|n| *n == name))
}

fn validate(tool: &ToolUse) -> Result<ToolKind, ToolInputError> {
    let spec = lookup(&tool.name).ok_or_else(|| ToolInputError::UnknownTool(tool.name.clone()))?;
    let fields = tool.input.as_object().ok_or_else(|| ToolInputError::NotAnObject {
        tool: tool.name.clone(),
    })?;

    for &field in spec.required {
        let present = match fields.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(ToolInputError::MissingField {
                tool: tool.name.clone(),
                field,
            });
        }
    }
    Ok(spec.kind)
}

/// Consent state of one confirmation family within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Confirmation {
    #[default]
    NotAsked,
    Pending,
    Granted,
    Denied,
}

/// Integration call detected in the stream, waiting for an executor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingIntegration {
    pub id: String,
    pub integration: Integration,
    pub tool_name: String,
    pub conversation_id: String,
    pub input: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ContextRequest {
        family: ConfirmationFamily,
        conversation_id: String,
        tool_name: String,
        input: Value,
    },
    Integration(PendingIntegration),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmationRequest {
    pub family: ConfirmationFamily,
    pub conversation_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// UI hook that asks the user to allow a context-elevation request. May take
/// arbitrarily long; the stream keeps flowing meanwhile.
#[async_trait]
pub trait ConfirmationPrompter: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> bool;
}

/// Identity of the stream the dispatcher is serving
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Ready(Action),
    /// First request of its family: ask the user, then call `resolve`
    AwaitConfirmation(ConfirmationRequest),
    /// Queued behind an outstanding confirmation
    Deferred,
    Dropped,
}

#[derive(Default)]
pub struct ToolUseDispatcher {
    confirmations: HashMap<ConfirmationFamily, Confirmation>,
    deferred: Vec<(ConfirmationFamily, ToolUse)>,
}

impl ToolUseDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmation(&self, family: ConfirmationFamily) -> Confirmation {
        self.confirmations.get(&family).copied().unwrap_or_default()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Never fails: malformed or unknown tool calls are logged and dropped.
    pub fn handle(&mut self, tool: &ToolUse, session: &SessionContext) -> Dispatch {
        let kind = match validate(tool) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::warn!(error = %err, "dropping tool invocation");
                return Dispatch::Dropped;
            }
        };

        let family = match kind {
            ToolKind::Integration(integration) => {
                return Dispatch::Ready(Action::Integration(PendingIntegration {
                    id: Uuid::new_v4().to_string(),
                    integration,
                    tool_name: tool.name.clone(),
                    conversation_id: session.conversation_id.clone(),
                    input: tool.input.clone(),
                    created_at: Utc::now(),
                }));
            }
            ToolKind::ContextRequest(family) => family,
        };

        match self.confirmation(family) {
            Confirmation::NotAsked => {
                self.confirmations.insert(family, Confirmation::Pending);
                self.deferred.push((family, tool.clone()));
                Dispatch::AwaitConfirmation(ConfirmationRequest {
                    family,
                    conversation_id: session.conversation_id.clone(),
                    tool_name: tool.name.clone(),
                    input: tool.input.clone(),
                })
            }
            Confirmation::Pending => {
                self.deferred.push((family, tool.clone()));
                Dispatch::Deferred
            }
            Confirmation::Granted => Dispatch::Ready(context_action(family, tool, session)),
            Confirmation::Denied => {
                tracing::debug!(tool = %tool.name, "context request denied earlier, skipping");
                Dispatch::Dropped
            }
        }
    }

    /// Settles a pending family and returns the deferred actions to run, in
    /// arrival order. Empty when denied.
    pub fn resolve(
        &mut self,
        family: ConfirmationFamily,
        granted: bool,
        session: &SessionContext,
    ) -> Vec<Action> {
        if self.confirmation(family) != Confirmation::Pending {
            return Vec::new();
        }
        self.confirmations.insert(
            family,
            if granted {
                Confirmation::Granted
            } else {
                Confirmation::Denied
            },
        );

        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|(f, _)| *f == family);
        self.deferred = rest;

        if !granted {
            tracing::debug!(?family, dropped = ready.len(), "confirmation denied");
            return Vec::new();
        }
        ready
            .iter()
            .map(|(f, tool)| context_action(*f, tool, session))
            .collect()
    }

    /// Drops every deferred invocation without running it. Returns how many
    /// were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.deferred.len();
        self.deferred.clear();
        for state in self.confirmations.values_mut() {
            if *state == Confirmation::Pending {
                *state = Confirmation::NotAsked;
            }
        }
        discarded
    }
}

fn context_action(family: ConfirmationFamily, tool: &ToolUse, session: &SessionContext) -> Action {
    Action::ContextRequest {
        family,
        conversation_id: session.conversation_id.clone(),
        tool_name: tool.name.clone(),
        input: tool.input.clone(),
    }
}

/// Integration requests awaiting an external executor
#[derive(Default)]
pub struct IntegrationQueue {
    pending: Mutex<VecDeque<PendingIntegration>>,
}

impl IntegrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingIntegration>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, integration: PendingIntegration) {
        self.lock().push_back(integration);
    }

    pub fn drain(&self) -> Vec<PendingIntegration> {
        self.lock().drain(..).collect()
    }

    pub fn take_for(&self, conversation_id: &str) -> Vec<PendingIntegration> {
        let mut pending = self.lock();
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut *pending)
            .into_iter()
            .partition(|p| p.conversation_id == conversation_id);
        *pending = kept;
        taken.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> SessionContext {
        SessionContext {
            conversation_id: "c1".to_string(),
        }
    }

    fn tool(name: &str, input: Value) -> ToolUse {
        ToolUse {
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn test_confirmation_asked_once_per_family() {
        let mut dispatcher = ToolUseDispatcher::new();
        let read = tool("read_window", json!({"window_id": "w1"}));

        assert!(matches!(
            dispatcher.handle(&read, &ctx()),
            Dispatch::AwaitConfirmation(_)
        ));
        assert_eq!(dispatcher.handle(&read, &ctx()), Dispatch::Deferred);
        assert_eq!(
            dispatcher.confirmation(ConfirmationFamily::WindowContext),
            Confirmation::Pending
        );

        let replayed = dispatcher.resolve(ConfirmationFamily::WindowContext, true, &ctx());
        assert_eq!(replayed.len(), 2);

        // Settled: later calls run without another prompt
        assert!(matches!(
            dispatcher.handle(&read, &ctx()),
            Dispatch::Ready(Action::ContextRequest { .. })
        ));
    }

    #[test]
    fn test_aliases_share_a_family() {
        let mut dispatcher = ToolUseDispatcher::new();
        dispatcher.handle(&tool("read_window", json!({"window_id": "w1"})), &ctx());
        assert_eq!(
            dispatcher.handle(
                &tool("request_window_context", json!({"window_id": "w2"})),
                &ctx()
            ),
            Dispatch::Deferred
        );
    }

    #[test]
    fn test_denied_family_is_skipped_silently() {
        let mut dispatcher = ToolUseDispatcher::new();
        let read = tool("read_conversation", json!({"conversation_id": "other"}));
        dispatcher.handle(&read, &ctx());
        dispatcher.handle(&read, &ctx());

        assert!(dispatcher
            .resolve(ConfirmationFamily::ConversationContext, false, &ctx())
            .is_empty());
        assert_eq!(dispatcher.deferred_len(), 0);
        assert_eq!(dispatcher.handle(&read, &ctx()), Dispatch::Dropped);
    }

    #[test]
    fn test_families_are_independent() {
        let mut dispatcher = ToolUseDispatcher::new();
        dispatcher.handle(&tool("read_window", json!({"window_id": "w"})), &ctx());
        let other = dispatcher.handle(
            &tool("read_conversation", json!({"conversation_id": "x"})),
            &ctx(),
        );
        assert!(matches!(other, Dispatch::AwaitConfirmation(_)));

        let actions = dispatcher.resolve(ConfirmationFamily::WindowContext, true, &ctx());
        assert_eq!(actions.len(), 1);
        assert_eq!(dispatcher.deferred_len(), 1);
    }

    #[test]
    fn test_resolve_without_pending_is_ignored() {
        let mut dispatcher = ToolUseDispatcher::new();
        assert!(dispatcher
            .resolve(ConfirmationFamily::WindowContext, true, &ctx())
            .is_empty());
        assert_eq!(
            dispatcher.confirmation(ConfirmationFamily::WindowContext),
            Confirmation::NotAsked
        );
    }

    #[test]
    fn test_integration_becomes_pending_record() {
        let mut dispatcher = ToolUseDispatcher::new();
        let dispatch = dispatcher.handle(
            &tool("create_event", json!({"title": "Standup", "start": "2026-10-20T09:00:00Z"})),
            &ctx(),
        );
        match dispatch {
            Dispatch::Ready(Action::Integration(pending)) => {
                assert_eq!(pending.integration, Integration::CalendarEvent);
                assert_eq!(pending.conversation_id, "c1");
                assert_eq!(pending.input["title"], "Standup");
            }
            other => panic!("expected integration, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_input_dropped() {
        let mut dispatcher = ToolUseDispatcher::new();
        for bad in [
            tool("create_event", json!({"title": "No start"})),
            tool("create_ticket", json!({"title": "  "})),
            tool("read_window", json!("w1")),
            tool("launch_rockets", json!({})),
        ] {
            assert_eq!(dispatcher.handle(&bad, &ctx()), Dispatch::Dropped);
        }
        assert_eq!(
            dispatcher.confirmation(ConfirmationFamily::WindowContext),
            Confirmation::NotAsked
        );
    }

    #[test]
    fn test_discard_pending() {
        let mut dispatcher = ToolUseDispatcher::new();
        let read = tool("read_window", json!({"window_id": "w"}));
        dispatcher.handle(&read, &ctx());
        dispatcher.handle(&read, &ctx());

        assert_eq!(dispatcher.discard_pending(), 2);
        assert!(dispatcher
            .resolve(ConfirmationFamily::WindowContext, true, &ctx())
            .is_empty());
    }

    #[test]
    fn test_integration_queue_take_for() {
        let queue = IntegrationQueue::new();
        let mut dispatcher = ToolUseDispatcher::new();
        for conversation in ["c1", "c2", "c1"] {
            let session = SessionContext {
                conversation_id: conversation.to_string(),
            };
            if let Dispatch::Ready(Action::Integration(p)) =
                dispatcher.handle(&tool("create_page", json!({"title": "Notes"})), &session)
            {
                queue.push(p);
            }
        }

        assert_eq!(queue.take_for("c1").len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
