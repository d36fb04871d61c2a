//! Worker process admission control
//!
//! Bidder and seller worklets run in a bounded pool of worker processes,
//! with a separate limit per role. A process is keyed by the origin whose
//! scripts it runs; requests for an origin that already has a live process
//! share it without consuming capacity.
//!
//! Requests that cannot be served queue FIFO per role. A slot is held by a
//! [`SlotHandle`] and released when the handle drops, on every exit path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use auction_types::Origin;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Which kind of worklet a process hosts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Bidder,
    Seller,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bidder => write!(f, "bidder"),
            Self::Seller => write!(f, "seller"),
        }
    }
}

struct Waiter {
    ticket: u64,
    key: Origin,
    tx: oneshot::Sender<SlotHandle>,
}

struct RoleState {
    limit: usize,
    /// Live processes and the number of handles sharing each.
    live: HashMap<Origin, usize>,
    queue: VecDeque<Waiter>,
}

impl RoleState {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            live: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn can_grant(&self, key: &Origin) -> bool {
        self.live.contains_key(key) || self.live.len() < self.limit
    }

    fn take(&mut self, key: &Origin) {
        *self.live.entry(key.clone()).or_insert(0) += 1;
    }

    /// Pop every waiter that can now be served, in queue order. The head is
    /// served first; once a key is live, later waiters for it share.
    fn drain_grantable(&mut self) -> Vec<Waiter> {
        let mut granted = Vec::new();
        while let Some(front) = self.queue.front() {
            if !self.can_grant(&front.key) {
                break;
            }
            if let Some(waiter) = self.queue.pop_front() {
                self.take(&waiter.key);
                granted.push(waiter);
            }
        }
        if !granted.is_empty() {
            let live = &self.live;
            let (sharing, rest): (VecDeque<Waiter>, VecDeque<Waiter>) = self
                .queue
                .drain(..)
                .partition(|w| live.contains_key(&w.key));
            self.queue = rest;
            for waiter in sharing {
                self.take(&waiter.key);
                granted.push(waiter);
            }
        }
        granted
    }
}

struct PoolState {
    bidder: RoleState,
    seller: RoleState,
    next_ticket: u64,
}

impl PoolState {
    fn role(&mut self, role: WorkerRole) -> &mut RoleState {
        match role {
            WorkerRole::Bidder => &mut self.bidder,
            WorkerRole::Seller => &mut self.seller,
        }
    }

    fn role_ref(&self, role: WorkerRole) -> &RoleState {
        match role {
            WorkerRole::Bidder => &self.bidder,
            WorkerRole::Seller => &self.seller,
        }
    }
}

type SharedState = Arc<Mutex<PoolState>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded pool of worker process slots
#[derive(Clone)]
pub struct ProcessSlotPool {
    state: SharedState,
}

impl ProcessSlotPool {
    pub fn new(max_bidder_processes: usize, max_seller_processes: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                bidder: RoleState::new(max_bidder_processes),
                seller: RoleState::new(max_seller_processes),
                next_ticket: 0,
            })),
        }
    }

    /// Ask for a slot. Never fails: either granted now or queued.
    pub fn request(&self, role: WorkerRole, key: Origin) -> SlotRequest {
        let mut state = lock(&self.state);
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let role_state = state.role(role);
        let shares = role_state.live.contains_key(&key);
        if shares || (role_state.queue.is_empty() && role_state.live.len() < role_state.limit) {
            role_state.take(&key);
            trace!(%role, origin = %key, shared = shares, "process slot granted");
            return SlotRequest::Granted(SlotHandle {
                state: Arc::clone(&self.state),
                role,
                key,
            });
        }

        let (tx, rx) = oneshot::channel();
        role_state.queue.push_back(Waiter {
            ticket,
            key: key.clone(),
            tx,
        });
        debug!(
            %role,
            origin = %key,
            queued = role_state.queue.len(),
            "process slot queued"
        );
        SlotRequest::Queued(PendingSlot {
            state: Arc::clone(&self.state),
            role,
            ticket,
            rx,
        })
    }

    /// Request a slot and wait until it is granted.
    pub async fn acquire(&self, role: WorkerRole, key: Origin) -> Option<SlotHandle> {
        match self.request(role, key) {
            SlotRequest::Granted(handle) => Some(handle),
            SlotRequest::Queued(pending) => pending.wait().await,
        }
    }

    /// Number of live processes for `role`.
    pub fn in_use(&self, role: WorkerRole) -> usize {
        lock(&self.state).role_ref(role).live.len()
    }

    /// Number of requests waiting for `role`.
    pub fn queued(&self, role: WorkerRole) -> usize {
        lock(&self.state).role_ref(role).queue.len()
    }
}

/// Outcome of [`ProcessSlotPool::request`]
pub enum SlotRequest {
    Granted(SlotHandle),
    Queued(PendingSlot),
}

/// A granted process slot. Dropping it releases the slot.
pub struct SlotHandle {
    state: SharedState,
    role: WorkerRole,
    key: Origin,
}

impl SlotHandle {
    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn key(&self) -> &Origin {
        &self.key
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("role", &self.role)
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let granted = {
            let mut state = lock(&self.state);
            let role_state = state.role(self.role);
            if let Some(count) = role_state.live.get_mut(&self.key) {
                *count -= 1;
                if *count == 0 {
                    role_state.live.remove(&self.key);
                }
            }
            role_state.drain_grantable()
        };
        trace!(role = %self.role, origin = %self.key, "process slot released");

        // Handles are sent with the lock released; a waiter that has gone
        // away hands its handle back and it releases in turn.
        for waiter in granted {
            let handle = SlotHandle {
                state: Arc::clone(&self.state),
                role: self.role,
                key: waiter.key,
            };
            let _ = waiter.tx.send(handle);
        }
    }
}

/// A queued slot request. Dropping it leaves the queue.
pub struct PendingSlot {
    state: SharedState,
    role: WorkerRole,
    ticket: u64,
    rx: oneshot::Receiver<SlotHandle>,
}

impl PendingSlot {
    /// Wait for the grant. `None` only if the grant was lost.
    pub async fn wait(mut self) -> Option<SlotHandle> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let ticket = self.ticket;
        state.role(self.role).queue.retain(|w| w.ticket != ticket);
    }
}
