use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// One tab the bridge holds a debugger attachment for.
#[derive(Debug, Clone)]
pub struct TabRecord {
    /// Bridge-assigned numeric tab id (the recording pipeline's key).
    pub tab_id: u64,
    /// The synthesized session id (`pw-tab-N`), stable for this attachment.
    pub session_id: String,
    /// Chrome's target id for the tab.
    pub target_id: String,
    /// Most recently observed target info.
    pub target_info: Value,
    /// Cached `Runtime.executionContextCreated` params, keyed by context id.
    contexts: BTreeMap<i64, Value>,
}

impl TabRecord {
    #[must_use]
    pub fn new(tab_id: u64, session_id: String, target_id: String, target_info: Value) -> Self {
        Self {
            tab_id,
            session_id,
            target_id,
            target_info,
            contexts: BTreeMap::new(),
        }
    }
}

/// The bridge's registry of attached tabs and session id allocation.
///
/// Session ids are monotonic for the lifetime of the bridge process and
/// never reused; every re-attachment (including reconnect replays) gets a
/// fresh one.
#[derive(Debug, Default)]
pub struct TabRegistry {
    tabs: HashMap<u64, TabRecord>,
    by_session: HashMap<String, u64>,
    next_session: u64,
    next_tab: u64,
}

impl TabRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tabs: HashMap::new(),
            by_session: HashMap::new(),
            next_session: 1,
            next_tab: 1,
        }
    }

    /// Allocate the next numeric tab id.
    pub fn allocate_tab_id(&mut self) -> u64 {
        let id = self.next_tab;
        self.next_tab += 1;
        id
    }

    /// Allocate the next synthesized session id.
    pub fn allocate_session_id(&mut self) -> String {
        let id = self.next_session;
        self.next_session += 1;
        format!("pw-tab-{id}")
    }

    /// Record a freshly attached tab.
    pub fn insert(&mut self, record: TabRecord) {
        self.by_session
            .insert(record.session_id.clone(), record.tab_id);
        self.tabs.insert(record.tab_id, record);
    }

    /// Remove a tab by its numeric id, returning its record.
    pub fn remove(&mut self, tab_id: u64) -> Option<TabRecord> {
        let record = self.tabs.remove(&tab_id)?;
        self.by_session.remove(&record.session_id);
        Some(record)
    }

    #[must_use]
    pub fn get(&self, tab_id: u64) -> Option<&TabRecord> {
        self.tabs.get(&tab_id)
    }

    #[must_use]
    pub fn get_by_session(&self, session_id: &str) -> Option<&TabRecord> {
        self.by_session
            .get(session_id)
            .and_then(|tab_id| self.tabs.get(tab_id))
    }

    #[must_use]
    pub fn get_by_target(&self, target_id: &str) -> Option<&TabRecord> {
        self.tabs.values().find(|t| t.target_id == target_id)
    }

    /// Any attached tab, for routing browser-level queries.
    #[must_use]
    pub fn any(&self) -> Option<&TabRecord> {
        self.tabs.values().min_by_key(|t| t.tab_id)
    }

    /// Drain every record (bridge disconnecting).
    pub fn clear(&mut self) -> Vec<TabRecord> {
        self.by_session.clear();
        let mut records: Vec<TabRecord> = self.tabs.drain().map(|(_, record)| record).collect();
        records.sort_by_key(|t| t.tab_id);
        records
    }

    /// Update the cached target info for a tab.
    pub fn update_target_info(&mut self, tab_id: u64, target_info: Value) {
        if let Some(record) = self.tabs.get_mut(&tab_id) {
            record.target_info = target_info;
        }
    }

    /// Feed an execution-context event into the per-tab cache. Returns true
    /// when the event was one of the three context-lifecycle methods.
    pub fn observe_context_event(&mut self, tab_id: u64, method: &str, params: &Value) -> bool {
        let Some(record) = self.tabs.get_mut(&tab_id) else {
            return false;
        };
        match method {
            "Runtime.executionContextCreated" => {
                if let Some(id) = params
                    .get("context")
                    .and_then(|c| c.get("id"))
                    .and_then(Value::as_i64)
                {
                    record.contexts.insert(id, params.clone());
                }
                true
            }
            "Runtime.executionContextDestroyed" => {
                if let Some(id) = params.get("executionContextId").and_then(Value::as_i64) {
                    record.contexts.remove(&id);
                }
                true
            }
            "Runtime.executionContextsCleared" => {
                record.contexts.clear();
                true
            }
            _ => false,
        }
    }

    /// Snapshot the cached `executionContextCreated` params for a tab, in
    /// context-id order.
    #[must_use]
    pub fn contexts(&self, tab_id: u64) -> Vec<Value> {
        self.tabs
            .get(&tab_id)
            .map(|record| record.contexts.values().cloned().collect())
            .unwrap_or_default()
    }
}
