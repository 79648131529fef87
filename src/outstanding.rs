use std::sync::Arc;

use agent_protocol::message::CimRequest;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::aggregator::ResponseAggregator;

/// One request in flight to an agent.
#[derive(Debug, Clone)]
pub struct OutstandingEntry {
    /// The caller's message id, restored on the response.
    pub original_id: String,
    pub request: Arc<CimRequest>,
    pub aggregator: Option<Arc<ResponseAggregator>>,
}

/// In-flight requests of one agent, keyed by the locally generated id that
/// was sent on the wire.
#[derive(Debug, Default)]
pub struct OutstandingRequestTable {
    entries: DashMap<String, OutstandingEntry>,
}

impl OutstandingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` and leaves the table untouched if `id` is taken.
    pub fn insert(&self, id: String, entry: OutstandingEntry) -> bool {
        match self.entries.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Looks up an entry without removing it, for intermediate chunks.
    pub fn get(&self, id: &str) -> Option<OutstandingEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<OutstandingEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    /// Removes and returns every entry matching `predicate`.
    pub fn remove_where<P>(&self, mut predicate: P) -> Vec<OutstandingEntry>
    where
        P: FnMut(&OutstandingEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|_, entry| {
            if predicate(entry) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn drain(&self) -> Vec<OutstandingEntry> {
        self.remove_where(|_| true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_protocol::message::RequestBody;
    use serde_json::json;

    fn entry(id: &str) -> OutstandingEntry {
        OutstandingEntry {
            original_id: id.to_string(),
            request: Arc::new(CimRequest::operation(id, "op", json!(null))),
            aggregator: None,
        }
    }

    #[test]
    fn one_live_entry_per_id() {
        let table = OutstandingRequestTable::new();
        assert!(table.insert("a".into(), entry("1")));
        assert!(!table.insert("a".into(), entry("2")));
        assert_eq!(table.get("a").unwrap().original_id, "1");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn get_keeps_remove_takes() {
        let table = OutstandingRequestTable::new();
        table.insert("a".into(), entry("1"));
        assert!(table.get("a").is_some());
        assert!(table.remove("a").is_some());
        assert!(table.remove("a").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn remove_where_only_takes_matches() {
        let table = OutstandingRequestTable::new();
        table.insert("a".into(), entry("keep"));
        table.insert("b".into(), entry("drop"));
        table.insert(
            "c".into(),
            OutstandingEntry {
                original_id: "stop".into(),
                request: Arc::new(CimRequest::new("stop", RequestBody::StopAllProviders)),
                aggregator: Some(Arc::new(ResponseAggregator::new(2))),
            },
        );

        let removed = table.remove_where(|e| e.original_id == "drop");
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 2);

        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
