use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Delivery log entry
#[derive(Clone)]
struct SeenEntry {
    event_type: String,
    expires_at: Instant,
}

/// Outcome of recording a host event delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    First,
    /// Seen before within the TTL
    Duplicate { event_type: String },
}

/// Host event ids delivered recently, with TTL
pub struct DeliveryLog {
    seen: Mutex<HashMap<String, SeenEntry>>,
    ttl: Duration,
}

impl DeliveryLog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SeenEntry>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `id` and reports whether it was already seen. Check and insert
    /// happen under one lock so two concurrent deliveries cannot both win.
    pub fn record(&self, id: &str, event_type: &str) -> Delivery {
        let mut seen = self.lock();

        // Clean up expired entries while we're here
        let now = Instant::now();
        seen.retain(|_, entry| entry.expires_at > now);

        if let Some(entry) = seen.get(id) {
            return Delivery::Duplicate {
                event_type: entry.event_type.clone(),
            };
        }

        seen.insert(
            id.to_string(),
            SeenEntry {
                event_type: event_type.to_string(),
                expires_at: now + self.ttl,
            },
        );
        Delivery::First
    }

    /// Lets `id` through again, e.g. after its handler failed
    pub fn forget(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }
}
