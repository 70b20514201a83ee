//! # Topology Store
//!
//! Authoritative record of which exchanges, queues and bindings have been declared, and
//! with which attributes. Declarations are idempotent: re-declaring with identical
//! attributes succeeds as [`DeclareOutcome::AlreadyDeclared`], re-declaring with different
//! attributes fails with a topology conflict.
//!
//! The store is in-process bookkeeping only. Network declarations are driven by the
//! management core, which rolls a record back with the `forget_*` methods when the broker
//! refuses it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use super::types::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::error::{BrokerError, BrokerResult};

/// Result of an idempotent declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// New record; the caller must declare it on the broker
    Created,
    /// Identical record already present
    AlreadyDeclared,
}

impl DeclareOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Point-in-time copy of the whole topology
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopologySnapshot {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

#[derive(Debug, Default)]
struct TopologyState {
    exchanges: BTreeMap<String, ExchangeSpec>,
    queues: BTreeMap<String, QueueSpec>,
    bindings: Vec<BindingSpec>,
}

/// Thread-safe declared-topology registry
#[derive(Debug, Default)]
pub struct TopologyStore {
    state: Mutex<TopologyState>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<DeclareOutcome> {
        validate_name("exchangeName", name)?;
        let mut state = self.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind == kind && existing.durable == durable => {
                Ok(DeclareOutcome::AlreadyDeclared)
            }
            Some(existing) => Err(BrokerError::topology_conflict(
                "exchange",
                name,
                format!(
                    "already declared as {} (durable={}), requested {} (durable={})",
                    existing.kind, existing.durable, kind, durable
                ),
            )),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeSpec::new(name, kind, durable));
                Ok(DeclareOutcome::Created)
            }
        }
    }

    pub fn declare_queue(&self, name: &str, durable: bool) -> BrokerResult<DeclareOutcome> {
        validate_name("queueName", name)?;
        let mut state = self.state.lock();
        match state.queues.get(name) {
            Some(existing) if existing.durable == durable => Ok(DeclareOutcome::AlreadyDeclared),
            Some(existing) => Err(BrokerError::topology_conflict(
                "queue",
                name,
                format!(
                    "already declared with durable={}, requested durable={}",
                    existing.durable, durable
                ),
            )),
            None => {
                state
                    .queues
                    .insert(name.to_string(), QueueSpec::new(name, durable));
                Ok(DeclareOutcome::Created)
            }
        }
    }

    /// Record a binding; queue and exchange must already be declared
    pub fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<DeclareOutcome> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::not_found("queue", queue));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::not_found("exchange", exchange));
        }

        let binding = BindingSpec::new(queue, exchange, routing_key);
        if state.bindings.contains(&binding) {
            return Ok(DeclareOutcome::AlreadyDeclared);
        }
        state.bindings.push(binding);
        Ok(DeclareOutcome::Created)
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn list_exchanges(&self) -> Vec<ExchangeSpec> {
        self.state.lock().exchanges.values().cloned().collect()
    }

    pub fn list_queues(&self) -> Vec<QueueSpec> {
        self.state.lock().queues.values().cloned().collect()
    }

    pub fn list_bindings(&self) -> Vec<BindingSpec> {
        self.state.lock().bindings.clone()
    }

    /// Roll back an exchange record; bindings to it go too
    pub fn forget_exchange(&self, name: &str) {
        let mut state = self.state.lock();
        state.exchanges.remove(name);
        state.bindings.retain(|b| b.exchange != name);
    }

    /// Roll back a queue record; bindings from it go too
    pub fn forget_queue(&self, name: &str) {
        let mut state = self.state.lock();
        state.queues.remove(name);
        state.bindings.retain(|b| b.queue != name);
    }

    pub fn forget_binding(&self, binding: &BindingSpec) {
        self.state.lock().bindings.retain(|b| b != binding);
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock();
        TopologySnapshot {
            exchanges: state.exchanges.values().cloned().collect(),
            queues: state.queues.values().cloned().collect(),
            bindings: state.bindings.clone(),
        }
    }
}

fn validate_name(field: &str, name: &str) -> BrokerResult<()> {
    if name.trim().is_empty() {
        return Err(BrokerError::validation(field, "name must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_redeclare_is_idempotent() {
        let store = TopologyStore::new();
        assert_eq!(
            store.declare_exchange("orders", ExchangeKind::Topic, true).unwrap(),
            DeclareOutcome::Created
        );
        assert_eq!(
            store.declare_exchange("orders", ExchangeKind::Topic, true).unwrap(),
            DeclareOutcome::AlreadyDeclared
        );
        assert_eq!(store.list_exchanges().len(), 1);
    }

    #[test]
    fn test_conflicting_attributes_rejected() {
        let store = TopologyStore::new();
        store.declare_exchange("orders", ExchangeKind::Topic, true).unwrap();
        store.declare_queue("work", true).unwrap();

        assert!(matches!(
            store.declare_exchange("orders", ExchangeKind::Direct, true),
            Err(BrokerError::TopologyConflict { .. })
        ));
        assert!(matches!(
            store.declare_queue("work", false),
            Err(BrokerError::TopologyConflict { .. })
        ));
        assert_eq!(store.exchange("orders").unwrap().kind, ExchangeKind::Topic);
    }

    #[test]
    fn test_bind_requires_declared_resources() {
        let store = TopologyStore::new();
        store.declare_queue("work", true).unwrap();

        assert!(matches!(
            store.bind("work", "orders", "#"),
            Err(BrokerError::NotFound { .. })
        ));
        assert!(matches!(
            store.bind("ghost", "orders", "#"),
            Err(BrokerError::NotFound { .. })
        ));

        store.declare_exchange("orders", ExchangeKind::Topic, true).unwrap();
        assert!(store.bind("work", "orders", "#").unwrap().is_created());
        assert!(!store.bind("work", "orders", "#").unwrap().is_created());
        assert_eq!(store.list_bindings().len(), 1);
    }

    #[test]
    fn test_empty_names_rejected() {
        let store = TopologyStore::new();
        assert!(matches!(
            store.declare_queue("  ", true),
            Err(BrokerError::Validation { .. })
        ));
    }

    #[test]
    fn test_forget_cascades_to_bindings() {
        let store = TopologyStore::new();
        store.declare_exchange("orders", ExchangeKind::Topic, true).unwrap();
        store.declare_queue("work", true).unwrap();
        store.bind("work", "orders", "#").unwrap();

        store.forget_exchange("orders");
        assert!(store.list_bindings().is_empty());
        assert!(store.has_queue("work"));

        let snapshot = store.snapshot();
        assert!(snapshot.exchanges.is_empty());
        assert_eq!(snapshot.queues.len(), 1);
    }

    #[test]
    fn test_concurrent_declares_create_once() {
        let store = Arc::new(TopologyStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.declare_queue("shared", true).unwrap())
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(DeclareOutcome::is_created)
            .count();
        assert_eq!(created, 1);
    }
}
