use crate::pmode::types::{ReceivingPMode, SendingPMode};
use crate::model::Mep;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of every loaded PMode. Readers keep the `Arc` for the length of
/// a pipeline run, so a concurrent reload never changes what they see.
#[derive(Debug, Default)]
pub struct PModeSnapshot {
    sending: HashMap<String, Arc<SendingPMode>>,
    receiving: Vec<Arc<ReceivingPMode>>,
    generation: u64,
}

impl PModeSnapshot {
    pub fn new(sending: Vec<SendingPMode>, receiving: Vec<ReceivingPMode>) -> Self {
        Self {
            sending: sending
                .into_iter()
                .map(|pmode| (pmode.id.clone(), Arc::new(pmode)))
                .collect(),
            receiving: receiving.into_iter().map(Arc::new).collect(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sending_pmode(&self, id: &str) -> Option<Arc<SendingPMode>> {
        self.sending.get(id).cloned()
    }

    pub fn sending_pmodes(&self) -> impl Iterator<Item = &Arc<SendingPMode>> {
        self.sending.values()
    }

    pub fn receiving_pmodes(&self) -> &[Arc<ReceivingPMode>] {
        &self.receiving
    }

    pub fn receiving_pmode(&self, id: &str) -> Option<Arc<ReceivingPMode>> {
        self.receiving.iter().find(|pmode| pmode.id == id).cloned()
    }

    /// Sending PModes that publish messages on `mpc` for pull.
    pub fn pull_pmodes_for_mpc<'a>(
        &'a self,
        mpc: &'a str,
    ) -> impl Iterator<Item = &'a Arc<SendingPMode>> + 'a {
        self.sending.values().filter(move |pmode| {
            pmode.mep_binding == Mep::Pull && pmode.message_packaging.mpc.as_deref() == Some(mpc)
        })
    }

    pub fn len(&self) -> usize {
        self.sending.len() + self.receiving.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-writer holder of the current snapshot.
#[derive(Debug, Default)]
pub struct PModeStore {
    current: RwLock<Arc<PModeSnapshot>>,
}

impl PModeStore {
    pub fn new(snapshot: PModeSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<PModeSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps in a new snapshot wholesale; returns its generation.
    pub fn replace(&self, mut snapshot: PModeSnapshot) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.generation = guard.generation + 1;
        let generation = snapshot.generation;
        *guard = Arc::new(snapshot);
        generation
    }

    pub fn get_sending_pmode(&self, id: &str) -> Option<Arc<SendingPMode>> {
        self.snapshot().sending_pmode(id)
    }

    pub fn get_receiving_pmodes(&self) -> Vec<Arc<ReceivingPMode>> {
        self.snapshot().receiving_pmodes().to_vec()
    }
}
