//! Context items attached to the next outgoing message.
//!
//! The set is bounded by [`MAX_ATTACHMENTS`] and deduplicated with a
//! type-specific equality: content-bearing attachments compare by value,
//! conversation attachments by id and value. The live conversation
//! attachment is special: there is at most one, and adding a new one always
//! overwrites it in place.

use serde::{Deserialize, Serialize};

pub const MAX_ATTACHMENTS: usize = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        value: String,
    },
    Pdf {
        value: String,
    },
    Audio {
        value: String,
    },
    Clipboard {
        value: String,
    },
    Spreadsheet {
        value: String,
    },
    TextFile {
        value: String,
    },
    Conversation {
        id: String,
        value: String,
        /// Transcript of the conversation currently streaming in this client
        #[serde(default)]
        live: bool,
    },
    WindowContext {
        value: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Pdf,
    Audio,
    Clipboard,
    Spreadsheet,
    TextFile,
    Conversation,
    WindowContext,
}

/// Lightweight record of an attachment kept on the sent message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub kind: AttachmentKind,
    pub label: String,
}

const LABEL_CHARS: usize = 40;

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        match self {
            Attachment::Image { .. } => AttachmentKind::Image,
            Attachment::Pdf { .. } => AttachmentKind::Pdf,
            Attachment::Audio { .. } => AttachmentKind::Audio,
            Attachment::Clipboard { .. } => AttachmentKind::Clipboard,
            Attachment::Spreadsheet { .. } => AttachmentKind::Spreadsheet,
            Attachment::TextFile { .. } => AttachmentKind::TextFile,
            Attachment::Conversation { .. } => AttachmentKind::Conversation,
            Attachment::WindowContext { .. } => AttachmentKind::WindowContext,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Attachment::Image { value }
            | Attachment::Pdf { value }
            | Attachment::Audio { value }
            | Attachment::Clipboard { value }
            | Attachment::Spreadsheet { value }
            | Attachment::TextFile { value }
            | Attachment::Conversation { value, .. }
            | Attachment::WindowContext { value } => value,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Attachment::Conversation { live: true, .. })
    }

    /// Dedup equality
    pub fn same_as(&self, other: &Attachment) -> bool {
        match (self, other) {
            (Attachment::Image { value: a }, Attachment::Image { value: b })
            | (Attachment::Pdf { value: a }, Attachment::Pdf { value: b })
            | (Attachment::Audio { value: a }, Attachment::Audio { value: b })
            | (Attachment::Clipboard { value: a }, Attachment::Clipboard { value: b })
            | (Attachment::Spreadsheet { value: a }, Attachment::Spreadsheet { value: b })
            | (Attachment::TextFile { value: a }, Attachment::TextFile { value: b })
            | (Attachment::WindowContext { value: a }, Attachment::WindowContext { value: b }) => {
                a == b
            }
            (
                Attachment::Conversation {
                    id: id_a,
                    value: value_a,
                    ..
                },
                Attachment::Conversation {
                    id: id_b,
                    value: value_b,
                    ..
                },
            ) => id_a == id_b && value_a == value_b,
            _ => false,
        }
    }

    pub fn to_ref(&self) -> AttachmentRef {
        let label = match self {
            Attachment::Conversation { id, .. } => id.clone(),
            other => other.value().chars().take(LABEL_CHARS).collect(),
        };
        AttachmentRef {
            kind: self.kind(),
            label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// An equal entry was overwritten in its existing slot
    Replaced,
    LiveReplaced,
    AtCapacity,
}

#[derive(Debug, Clone)]
pub struct AttachmentSet {
    items: Vec<Attachment>,
    capacity: usize,
}

impl Default for AttachmentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ATTACHMENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity,
        }
    }

    /// Bounded insert with dedup. Never fails: overflow is a no-op.
    pub fn add(&mut self, attachment: Attachment) -> AddOutcome {
        if attachment.is_live() {
            if let Some(slot) = self.items.iter_mut().find(|a| a.is_live()) {
                *slot = attachment;
                return AddOutcome::LiveReplaced;
            }
        } else if let Some(slot) = self
            .items
            .iter_mut()
            .find(|a| !a.is_live() && a.same_as(&attachment))
        {
            *slot = attachment;
            return AddOutcome::Replaced;
        }

        if self.items.len() >= self.capacity {
            tracing::debug!(kind = ?attachment.kind(), "attachment set full, ignoring");
            return AddOutcome::AtCapacity;
        }

        self.items.push(attachment);
        AddOutcome::Inserted
    }

    /// Removes the entry matching `attachment`. A live attachment matches
    /// the live slot whatever its current transcript.
    pub fn remove(&mut self, attachment: &Attachment) -> bool {
        let position = if attachment.is_live() {
            self.items.iter().position(|a| a.is_live())
        } else {
            self.items
                .iter()
                .position(|a| !a.is_live() && a.same_as(attachment))
        };

        match position {
            Some(idx) => {
                self.items.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Empties the set, handing the attachments to the outgoing message
    pub fn take(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(value: &str) -> Attachment {
        Attachment::Image {
            value: value.to_string(),
        }
    }

    fn conversation(id: &str, value: &str, live: bool) -> Attachment {
        Attachment::Conversation {
            id: id.to_string(),
            value: value.to_string(),
            live,
        }
    }

    #[test]
    fn test_duplicate_add_keeps_size_and_position() {
        let mut set = AttachmentSet::new();
        set.add(image("a.png"));
        set.add(Attachment::Pdf {
            value: "doc.pdf".to_string(),
        });

        assert_eq!(set.add(image("a.png")), AddOutcome::Replaced);
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().next(), Some(&image("a.png")));
    }

    #[test]
    fn test_same_value_different_kind_is_distinct() {
        let mut set = AttachmentSet::new();
        set.add(image("x"));
        set.add(Attachment::Clipboard {
            value: "x".to_string(),
        });
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capacity_keeps_first_entries() {
        let mut set = AttachmentSet::new();
        for i in 0..=MAX_ATTACHMENTS {
            set.add(image(&format!("img-{i}")));
        }

        assert_eq!(set.len(), MAX_ATTACHMENTS);
        let values: Vec<_> = set.iter().map(|a| a.value().to_string()).collect();
        let expected: Vec<_> = (0..MAX_ATTACHMENTS).map(|i| format!("img-{i}")).collect();
        assert_eq!(values, expected);
        assert_eq!(set.add(image("one-more")), AddOutcome::AtCapacity);
    }

    #[test]
    fn test_conversation_equality_needs_id_and_value() {
        let mut set = AttachmentSet::new();
        set.add(conversation("c1", "transcript", false));
        set.add(conversation("c2", "transcript", false));
        set.add(conversation("c1", "other", false));
        assert_eq!(set.len(), 3);

        assert_eq!(
            set.add(conversation("c1", "transcript", false)),
            AddOutcome::Replaced
        );
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_live_conversation_overwrites_its_slot() {
        let mut set = AttachmentSet::new();
        set.add(image("a"));
        set.add(conversation("live", "turn 1", true));
        set.add(image("b"));

        let outcome = set.add(conversation("live", "turn 1 turn 2", true));
        assert_eq!(outcome, AddOutcome::LiveReplaced);
        assert_eq!(set.len(), 3);
        let second = set.iter().nth(1).unwrap();
        assert_eq!(second.value(), "turn 1 turn 2");
    }

    #[test]
    fn test_live_replacement_ignores_capacity() {
        let mut set = AttachmentSet::with_capacity(2);
        set.add(conversation("live", "v1", true));
        set.add(image("a"));
        assert_eq!(
            set.add(conversation("live", "v2", true)),
            AddOutcome::LiveReplaced
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_uses_type_specific_equality() {
        let mut set = AttachmentSet::new();
        set.add(image("a"));
        set.add(conversation("c1", "t", false));
        set.add(conversation("live", "moving", true));

        assert!(!set.remove(&conversation("c1", "different", false)));
        assert!(set.remove(&conversation("c1", "t", false)));
        assert!(set.remove(&conversation("live", "anything", true)));
        assert!(set.remove(&image("a")));
        assert!(set.is_empty());
    }

    #[test]
    fn test_take_drains_set() {
        let mut set = AttachmentSet::new();
        set.add(image("a"));
        let taken = set.take();
        assert_eq!(taken.len(), 1);
        assert!(set.is_empty());
    }
}
