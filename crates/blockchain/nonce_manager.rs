//! Per-sender nonce reservation.
//!
//! Concurrent transaction submissions from the same sender race for the next
//! nonce. The manager serializes them: one reservation per address at a
//! time, with the nonce snapshot taken under the address lock and the lock
//! released on every exit path through the reservation guard.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use ethereum_types::Address;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct SenderNonces {
    /// Next nonce to hand out; advances past committed nonces.
    current_nonce: u64,
    /// Nonce observed on an externally received transaction, promoted into
    /// `used_nonces` by the next commit.
    reserved_nonce: Option<u64>,
    used_nonces: BTreeSet<u64>,
}

/// Serializes nonce allocation per sender address.
///
/// Cheaply cloneable (Arc-backed). Pass clones to spawned tasks.
#[derive(Debug, Clone, Default)]
pub struct NonceManager {
    senders: Arc<Mutex<HashMap<Address, Arc<AsyncMutex<SenderNonces>>>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_entry(&self, address: Address) -> Arc<AsyncMutex<SenderNonces>> {
        let mut senders = match self.senders.lock() {
            Ok(senders) => senders,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders.entry(address).or_default().clone()
    }

    /// Reserves the next nonce for `address`. Suspends while another
    /// reservation for the same address is outstanding.
    ///
    /// The returned handle must be resolved with
    /// [`commit`](NonceReservation::commit) or
    /// [`rollback`](NonceReservation::rollback); dropping it without either
    /// behaves as a rollback.
    pub async fn reserve(&self, address: Address) -> NonceReservation {
        let entry = self.sender_entry(address);
        let guard = entry.lock_owned().await;
        let nonce = guard.current_nonce;
        NonceReservation {
            nonce,
            committed: false,
            guard,
        }
    }

    /// Records the nonce of a transaction observed for `address` (for
    /// example one received over the network) so the next commit promotes
    /// it into the used set. Suspends while a reservation holds the lock.
    pub async fn tx_with_nonce_received(&self, address: Address, nonce: u64) {
        let entry = self.sender_entry(address);
        let mut state = entry.lock().await;
        state.reserved_nonce = Some(nonce);
    }
}

/// Exclusive hold on one sender's nonce state.
#[derive(Debug)]
pub struct NonceReservation {
    nonce: u64,
    committed: bool,
    guard: OwnedMutexGuard<SenderNonces>,
}

impl NonceReservation {
    /// The nonce allocated to this reservation.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Records the nonce actually placed in the submitted transaction, when
    /// it differs from the allocated one.
    pub fn tx_with_nonce_received(&mut self, nonce: u64) {
        self.guard.reserved_nonce = Some(nonce);
    }

    /// Marks the allocated nonce (and any explicitly recorded one) as used
    /// and advances the sender's nonce past the contiguous used prefix,
    /// then releases the lock.
    pub fn commit(mut self) {
        let state = &mut *self.guard;
        state.used_nonces.insert(self.nonce);
        if let Some(reserved) = state.reserved_nonce.take() {
            state.used_nonces.insert(reserved);
        }
        while state.used_nonces.remove(&state.current_nonce) {
            state.current_nonce += 1;
        }
        self.committed = true;
    }

    /// Releases the lock without advancing the nonce.
    pub fn rollback(self) {
        // Drop clears the pending reserved nonce.
    }
}

impl Drop for NonceReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.guard.reserved_nonce = None;
        }
    }
}
