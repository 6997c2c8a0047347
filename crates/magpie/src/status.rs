//! Saved statuses, in-memory model.
//!
//! A saved status pairs a primitive (available, away, ...) with an
//! optional title and message. The store tracks the current and
//! idle-away statuses; persistence lives with the embedder.

use std::sync::Mutex;

/// The coarse status categories protocols understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub enum StatusPrimitive {
    /// Signed off.
    Offline,
    /// Present and reachable.
    Available,
    /// Present but not paying attention.
    Away,
    /// Do not disturb.
    Busy,
    /// Online but invisible to others.
    Invisible,
}

impl StatusPrimitive {
    /// The protocol-level token for this primitive.
    ///
    /// SIMPLE only distinguishes available from busy, so everything
    /// that is not plain availability maps to `busy`.
    pub fn as_protocol_token(self) -> &'static str {
        match self {
            StatusPrimitive::Available => "available",
            _ => "busy",
        }
    }
}

/// One saved status.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "output", derive(serde::Serialize))]
pub struct SavedStatus {
    /// Title, unique within the store. Transient statuses have none.
    pub title: Option<String>,
    /// The status category.
    pub primitive: StatusPrimitive,
    /// Free-form status message.
    pub message: Option<String>,
}

impl SavedStatus {
    /// A transient (untitled) status.
    pub fn transient(primitive: StatusPrimitive, message: Option<String>) -> Self {
        Self {
            title: None,
            primitive,
            message,
        }
    }
}

/// The process-wide saved status store.
pub struct SavedStatuses {
    inner: Mutex<Inner>,
}

struct Inner {
    saved: Vec<SavedStatus>,
    current: SavedStatus,
    idleaway: Option<SavedStatus>,
}

impl SavedStatuses {
    /// A store whose current status is plain availability.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                saved: Vec::new(),
                current: SavedStatus::transient(StatusPrimitive::Available, None),
                idleaway: None,
            }),
        }
    }

    /// Save a titled status, replacing one with the same title.
    pub fn save(&self, status: SavedStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(title) = &status.title {
            inner.saved.retain(|s| s.title.as_deref() != Some(title));
        }
        inner.saved.push(status);
    }

    /// Find a saved status by title.
    pub fn find(&self, title: &str) -> Option<SavedStatus> {
        self.inner
            .lock()
            .unwrap()
            .saved
            .iter()
            .find(|s| s.title.as_deref() == Some(title))
            .cloned()
    }

    /// Remove a saved status by title.
    pub fn remove(&self, title: &str) {
        self.inner
            .lock()
            .unwrap()
            .saved
            .retain(|s| s.title.as_deref() != Some(title));
    }

    /// The status currently in use.
    pub fn current(&self) -> SavedStatus {
        self.inner.lock().unwrap().current.clone()
    }

    /// Switch the current status.
    pub fn set_current(&self, status: SavedStatus) {
        self.inner.lock().unwrap().current = status;
    }

    /// The status used while idle, when one is configured.
    pub fn idleaway(&self) -> Option<SavedStatus> {
        self.inner.lock().unwrap().idleaway.clone()
    }

    /// Configure (or clear) the idle-away status.
    pub fn set_idleaway(&self, status: Option<SavedStatus>) {
        self.inner.lock().unwrap().idleaway = status;
    }

    /// Every saved status, in save order.
    pub fn all(&self) -> Vec<SavedStatus> {
        self.inner.lock().unwrap().saved.clone()
    }
}

impl Default for SavedStatuses {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_replaces_same_title() {
        let store = SavedStatuses::new();
        store.save(SavedStatus {
            title: Some("work".into()),
            primitive: StatusPrimitive::Busy,
            message: Some("heads down".into()),
        });
        store.save(SavedStatus {
            title: Some("work".into()),
            primitive: StatusPrimitive::Away,
            message: None,
        });

        assert_eq!(store.all().len(), 1);
        assert_eq!(store.find("work").unwrap().primitive, StatusPrimitive::Away);
    }

    #[test]
    fn test_current_defaults_to_available() {
        let store = SavedStatuses::new();
        assert_eq!(store.current().primitive, StatusPrimitive::Available);
        assert_eq!(store.current().primitive.as_protocol_token(), "available");
        assert_eq!(StatusPrimitive::Away.as_protocol_token(), "busy");
    }
}
