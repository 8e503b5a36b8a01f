// src/broker/exchange.rs

//! Exchange router.
//!
//! Maps a (exchange, routing key) pair to the set of destination queue
//! names. The router knows nothing about queue contents; the broker
//! intersects its answer with the queues that actually exist, which is
//! also what gives the default exchange its "route to the queue named by
//! the key, if any" behavior.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{Error, ExchangeKind, Result};

/// Routing table: declared exchanges plus their bindings.
///
/// The empty-named default exchange is standing; it exists from
/// construction and cannot be re-declared as another kind.
pub(crate) struct Router {
    // ---
    exchanges: HashMap<Arc<str>, ExchangeKind>,

    /// Per-exchange set of (queue, binding key) pairs. A `HashSet` makes
    /// duplicate binding declarations idempotent.
    bindings: HashMap<Arc<str>, HashSet<(Arc<str>, Arc<str>)>>,
}

impl Router {
    // ---
    pub fn new() -> Self {
        // ---
        let mut exchanges = HashMap::new();
        exchanges.insert(Arc::from(""), ExchangeKind::DirectDefault);
        Self {
            exchanges,
            bindings: HashMap::new(),
        }
    }

    /// Declare an exchange; idempotent for a matching kind.
    pub fn declare(&mut self, name: &str, kind: ExchangeKind) -> Result<()> {
        // ---
        match self.exchanges.get(name) {
            Some(existing) if *existing == kind => Ok(()),
            Some(_) => Err(Error::ExchangeDeclareConflict(name.to_string())),
            None => {
                self.exchanges.insert(Arc::from(name), kind);
                Ok(())
            }
        }
    }

    /// Record a binding; duplicates have no additional effect.
    pub fn bind(&mut self, exchange: &str, queue: Arc<str>, binding_key: &str) -> Result<()> {
        // ---
        if !self.exchanges.contains_key(exchange) {
            return Err(Error::ExchangeNotFound(exchange.to_string()));
        }
        self.bindings
            .entry(Arc::from(exchange))
            .or_default()
            .insert((queue, Arc::from(binding_key)));
        Ok(())
    }

    /// Drop every binding that targets `queue` (the queue is gone).
    pub fn unbind_queue(&mut self, queue: &str) {
        // ---
        for bindings in self.bindings.values_mut() {
            bindings.retain(|(q, _)| &**q != queue);
        }
    }

    /// Compute the candidate destination queues for a publish.
    ///
    /// Candidates still have to exist in the queue store to receive the
    /// message; a candidate without a live queue is dropped silently by
    /// the caller. Each queue appears at most once however many bindings
    /// it matched.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<str>>> {
        // ---
        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let targets = match kind {
            ExchangeKind::DirectDefault => vec![Arc::from(routing_key)],
            ExchangeKind::Fanout => {
                // ---
                let mut seen = HashSet::new();
                self.bindings
                    .get(exchange)
                    .into_iter()
                    .flatten()
                    .filter(|(q, _)| seen.insert(q.clone()))
                    .map(|(q, _)| q.clone())
                    .collect()
            }
            ExchangeKind::DirectKeyed => {
                // ---
                let mut seen = HashSet::new();
                self.bindings
                    .get(exchange)
                    .into_iter()
                    .flatten()
                    .filter(|(_, key)| &**key == routing_key)
                    .filter(|(q, _)| seen.insert(q.clone()))
                    .map(|(q, _)| q.clone())
                    .collect()
            }
        };

        Ok(targets)
    }
}
