use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;

/// Upper bound on in-flight commands per client before new commands are
/// refused with a backlog error.
pub const PENDING_CAP: usize = 10_000;

/// Upper bound on buffered events per session awaiting a socket bind.
pub const EVENT_BUFFER_CAP: usize = 1024;

/// An outbound instruction for a socket writer task.
#[derive(Debug, Clone)]
pub enum SocketOut {
    /// A text frame to deliver.
    Frame(String),
    /// Close the socket with the given code and reason.
    Close { code: u16, reason: String },
}

/// Which socket of a client a frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketRoute {
    /// The fabricated browser-level socket (`/cdp`).
    Root,
    /// A per-session socket (`/cdp/{sessionId}`).
    Session(String),
}

/// Outcome of delivering an event toward a client.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Written to a bound socket queue.
    Sent,
    /// Stored in the per-session buffer.
    Buffered,
    /// Buffered, displacing the oldest entry.
    BufferedDroppingOldest,
}

/// Relay-side state for one connected client process.
///
/// Owned exclusively by the hub task; socket pumps interact with it only
/// through hub messages.
#[derive(Debug)]
pub struct ClientSession {
    root_tx: mpsc::UnboundedSender<SocketOut>,
    session_sockets: HashMap<String, mpsc::UnboundedSender<SocketOut>>,
    /// Sessions this client drives over the root socket (non-flat mode).
    legacy_sessions: HashSet<String>,
    /// Events for advertised sessions with no bound socket yet.
    buffers: HashMap<String, VecDeque<String>>,
    /// Extension-visible ids of this client's in-flight commands.
    pending: HashSet<u64>,
    /// Whether the client asked for target discovery events.
    discover: bool,
}

impl ClientSession {
    #[must_use]
    pub fn new(root_tx: mpsc::UnboundedSender<SocketOut>) -> Self {
        Self {
            root_tx,
            session_sockets: HashMap::new(),
            legacy_sessions: HashSet::new(),
            buffers: HashMap::new(),
            pending: HashSet::new(),
            discover: false,
        }
    }

    /// Queue a frame on the root socket.
    pub fn send_root(&self, frame: String) {
        let _ = self.root_tx.send(SocketOut::Frame(frame));
    }

    /// Queue a frame on the socket identified by `route`.
    pub fn send_on(&self, route: &SocketRoute, frame: String) {
        match route {
            SocketRoute::Root => self.send_root(frame),
            SocketRoute::Session(sid) => {
                if let Some(tx) = self.session_sockets.get(sid) {
                    let _ = tx.send(SocketOut::Frame(frame));
                } else {
                    // Socket went away between command and response; the
                    // client is the retry authority.
                    tracing::debug!(session = %sid, "response dropped: session socket gone");
                }
            }
        }
    }

    /// Bind a per-session socket and drain any buffered events into it, in
    /// arrival order.
    pub fn bind_session_socket(
        &mut self,
        session_id: &str,
        tx: mpsc::UnboundedSender<SocketOut>,
    ) {
        if let Some(buffered) = self.buffers.remove(session_id) {
            for frame in buffered {
                let _ = tx.send(SocketOut::Frame(frame));
            }
        }
        self.session_sockets.insert(session_id.to_owned(), tx);
    }

    /// Drop the binding for a per-session socket (client closed it).
    pub fn unbind_session_socket(&mut self, session_id: &str) {
        self.session_sockets.remove(session_id);
    }

    /// Deliver a session-scoped event: bound socket first, root for legacy
    /// sessions, otherwise the bounded buffer.
    pub fn deliver_event(&mut self, session_id: &str, frame: String) -> Delivery {
        if let Some(tx) = self.session_sockets.get(session_id) {
            let _ = tx.send(SocketOut::Frame(frame));
            return Delivery::Sent;
        }
        if self.legacy_sessions.contains(session_id) {
            self.send_root(frame);
            return Delivery::Sent;
        }
        let buffer = self.buffers.entry(session_id.to_owned()).or_default();
        if buffer.len() >= EVENT_BUFFER_CAP {
            tracing::warn!(
                session = %session_id,
                "event buffer full, dropping oldest buffered event"
            );
            buffer.pop_front();
            buffer.push_back(frame);
            Delivery::BufferedDroppingOldest
        } else {
            buffer.push_back(frame);
            Delivery::Buffered
        }
    }

    /// Mark a session as driven over the root socket (non-flat mode) and
    /// release anything buffered for it onto the root socket.
    pub fn mark_legacy(&mut self, session_id: &str) {
        if self.legacy_sessions.insert(session_id.to_owned()) {
            if let Some(buffered) = self.buffers.remove(session_id) {
                for frame in buffered {
                    self.send_root(frame);
                }
            }
        }
    }

    /// Forget a session entirely: close its socket gracefully, drop buffers
    /// and the legacy mark. Returns true if a socket was closed.
    pub fn drop_session(&mut self, session_id: &str, close_code: u16) -> bool {
        self.buffers.remove(session_id);
        self.legacy_sessions.remove(session_id);
        if let Some(tx) = self.session_sockets.remove(session_id) {
            let _ = tx.send(SocketOut::Close {
                code: close_code,
                reason: String::new(),
            });
            true
        } else {
            false
        }
    }

    /// Send a close instruction to every socket of this client.
    pub fn close_all(&self, code: u16, reason: &str) {
        let _ = self.root_tx.send(SocketOut::Close {
            code,
            reason: reason.to_owned(),
        });
        for tx in self.session_sockets.values() {
            let _ = tx.send(SocketOut::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    /// Track a newly allocated in-flight command id.
    ///
    /// Returns false (and records nothing) when the backlog cap is reached.
    pub fn track_pending(&mut self, ext_id: u64) -> bool {
        if self.pending.len() >= PENDING_CAP {
            return false;
        }
        self.pending.insert(ext_id);
        true
    }

    /// Forget a completed command id.
    pub fn complete_pending(&mut self, ext_id: u64) {
        self.pending.remove(&ext_id);
    }

    /// Drain all in-flight ids (client gone, or extension invalidated).
    pub fn take_pending(&mut self) -> Vec<u64> {
        self.pending.drain().collect()
    }

    pub fn set_discover(&mut self, discover: bool) {
        self.discover = discover;
    }

    #[must_use]
    pub fn discover(&self) -> bool {
        self.discover
    }

    #[must_use]
    pub fn has_session_socket(&self, session_id: &str) -> bool {
        self.session_sockets.contains_key(session_id)
    }
}
