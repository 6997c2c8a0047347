//! Buddy and watcher bookkeeping plus PIDF bodies for SIMPLE.

use tokio::time::Instant;

use crate::codec::XmlNode;

/// PIDF namespace.
const NS_PIDF: &str = "urn:ietf:params:xml:ns:pidf";

/// A SIP dialog identity: call id plus the two tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    /// `Call-ID` shared by the dialog.
    pub call_id: String,
    /// Our tag (`To`/`From` depending on direction).
    pub our_tag: String,
    /// The peer's tag.
    pub their_tag: String,
}

/// A buddy whose presence we subscribe to.
#[derive(Debug, Clone)]
pub struct Buddy {
    /// Buddy URI (`sip:alice@example`).
    pub name: String,
    /// When the next SUBSCRIBE is due.
    pub resubscribe_at: Instant,
}

/// A remote entity subscribed to our presence.
#[derive(Debug, Clone)]
pub struct Watcher {
    /// Watcher URI.
    pub name: String,
    /// Dialog the subscription lives in.
    pub dialog: Dialog,
    /// When the subscription lapses unless refreshed.
    pub expires_at: Instant,
}

/// Insertion-ordered buddy table.
#[derive(Debug, Default)]
pub struct BuddyTable {
    entries: Vec<Buddy>,
}

impl BuddyTable {
    /// Add a buddy due for immediate subscription. Adding a name twice
    /// is a no-op.
    pub fn add(&mut self, name: &str) {
        if self.find(name).is_some() {
            return;
        }
        self.entries.push(Buddy {
            name: name.to_owned(),
            resubscribe_at: Instant::now(),
        });
    }

    /// Remove a buddy.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|b| b.name != name);
    }

    /// Find a buddy by name.
    pub fn find(&self, name: &str) -> Option<&Buddy> {
        self.entries.iter().find(|b| b.name == name)
    }

    /// Names of buddies whose subscription is due.
    pub fn due(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|b| b.resubscribe_at <= now)
            .map(|b| b.name.clone())
            .collect()
    }

    /// Push a buddy's renewal out to `at`.
    pub fn set_resubscribe(&mut self, name: &str, at: Instant) {
        if let Some(buddy) = self.entries.iter_mut().find(|b| b.name == name) {
            buddy.resubscribe_at = at;
        }
    }

    /// Number of buddies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Insertion-ordered watcher table. NOTIFYs fire in this order.
#[derive(Debug, Default)]
pub struct WatcherTable {
    entries: Vec<Watcher>,
}

impl WatcherTable {
    /// Find a watcher by name.
    pub fn find(&self, name: &str) -> Option<&Watcher> {
        self.entries.iter().find(|w| w.name == name)
    }

    /// Create a watcher. The caller has already checked `find`.
    pub fn create(&mut self, name: &str, dialog: Dialog, expires_at: Instant) -> &Watcher {
        self.entries.push(Watcher {
            name: name.to_owned(),
            dialog,
            expires_at,
        });
        self.entries.last().expect("just pushed")
    }

    /// Refresh a watcher's expiry, returning whether it existed.
    pub fn refresh(&mut self, name: &str, expires_at: Instant) -> bool {
        match self.entries.iter_mut().find(|w| w.name == name) {
            Some(watcher) => {
                watcher.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    /// Remove a watcher by name.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|w| w.name != name);
    }

    /// Drop lapsed watchers.
    pub fn reap(&mut self, now: Instant) {
        self.entries.retain(|w| w.expires_at > now);
    }

    /// Snapshot in insertion order.
    pub fn all(&self) -> Vec<Watcher> {
        self.entries.clone()
    }

    /// Number of watchers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Generate our PIDF document: `<presence>` with one tuple whose
/// `<basic>` is always `open` and whose `im:im` carries the finer
/// status string.
pub fn gen_pidf(username: &str, servername: &str, status: &str) -> String {
    let mut presence = XmlNode::new("presence").with_namespace(NS_PIDF);
    presence.set_attr("xmlns:im", "urn:ietf:params:xml:ns:pidf:im");
    presence.set_attr("entity", format!("sip:{username}@{servername}"));

    let mut tuple = XmlNode::new("tuple");
    tuple.set_attr("id", "bs35r9f");
    let mut status_node = XmlNode::new("status");
    let mut basic = XmlNode::new("basic");
    basic.add_text("open");
    let mut im = XmlNode::new("im:im");
    im.add_text(status);
    status_node.add_child(basic);
    status_node.add_child(im);
    tuple.add_child(status_node);
    presence.add_child(tuple);

    let mut doc = presence;
    doc.declaration = Some("<?xml version=\"1.0\" encoding=\"UTF-8\"?>".to_owned());
    doc.to_string()
}

/// Read `tuple > status > basic` out of a PIDF body. `open` means
/// available, anything else (or nothing parseable) means offline.
pub fn parse_pidf_open(body: &str) -> Option<bool> {
    let doc = XmlNode::parse(body.trim()).ok()?;
    let basic = doc.child("tuple")?.child("status")?.child("basic")?;
    Some(basic.text().contains("open"))
}

/// Build the `isComposing` body for typing notifications.
pub fn gen_iscomposing(active: bool) -> String {
    let mut doc = XmlNode::new("isComposing").with_namespace("urn:ietf:params:xml:ns:im-iscomposing");
    doc.set_attr("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance");
    doc.set_attr(
        "xsi:schemaLocation",
        "urn:ietf:params:xml:ns:im-composing iscomposing.xsd",
    );

    let mut state = XmlNode::new("state");
    state.add_text(if active { "active" } else { "idle" });
    let mut contenttype = XmlNode::new("contenttype");
    contenttype.add_text("text/plain");
    let mut refresh = XmlNode::new("refresh");
    refresh.add_text("60");
    doc.add_child(state);
    doc.add_child(contenttype);
    doc.add_child(refresh);

    doc.declaration = Some("<?xml version=\"1.0\" encoding=\"UTF-8\"?>".to_owned());
    doc.to_string()
}

/// Read the `<state>` of an `isComposing` body: `Some(true)` for
/// active, `Some(false)` otherwise, `None` when unparseable.
pub fn parse_iscomposing_active(body: &str) -> Option<bool> {
    let doc = XmlNode::parse(body.trim()).ok()?;
    let state = doc.child("state")?;
    Some(state.text().contains("active"))
}
