//! Per-guild readiness gates.
//!
//! A gate is a one-shot latch: waiters suspend until the guild's initial data
//! (and member chunks, when configured) has arrived. Once open it stays open;
//! a fresh gate is only created by a later guild create after the old one was
//! removed.
//!
//! Removing a guild closes its gate, which releases every waiter. A wait
//! never hangs on a guild that is gone.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::Snowflake;

/// State of a [`ReadinessGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Ready,
    /// The guild went away before the gate was signalled.
    Closed,
}

/// How a wait on a gate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ready,
    Closed,
}

/// One-shot readiness latch for one guild.
#[derive(Debug)]
pub struct ReadinessGate {
    guild_id: Snowflake,
    tx: watch::Sender<GateState>,
}

impl ReadinessGate {
    pub fn new(guild_id: Snowflake) -> Self {
        let (tx, _) = watch::channel(GateState::Pending);
        Self { guild_id, tx }
    }

    pub fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == GateState::Ready
    }

    /// Open the gate. Idempotent; a closed gate stays closed.
    pub fn signal(&self) {
        let changed = self.tx.send_if_modified(|state| match state {
            GateState::Pending => {
                *state = GateState::Ready;
                true
            }
            GateState::Ready | GateState::Closed => false,
        });
        if changed {
            debug!(guild_id = %self.guild_id, "guild ready");
        }
    }

    /// Release all waiters without marking the guild ready.
    pub fn close(&self) {
        let changed = self.tx.send_if_modified(|state| match state {
            GateState::Pending => {
                *state = GateState::Closed;
                true
            }
            GateState::Ready | GateState::Closed => false,
        });
        if changed {
            debug!(guild_id = %self.guild_id, "guild gate closed before ready");
        }
    }

    /// Suspend until the gate is signalled or closed. Returns immediately if
    /// either already happened. Dropping the future cancels the wait.
    pub async fn wait(&self) -> GateOutcome {
        let mut rx = self.tx.subscribe();
        Self::wait_on(&mut rx).await
    }

    /// A wait that does not borrow the gate, for spawning.
    pub fn waiter(&self) -> impl Future<Output = GateOutcome> + Send + 'static + use<> {
        let mut rx = self.tx.subscribe();
        async move { Self::wait_on(&mut rx).await }
    }

    async fn wait_on(rx: &mut watch::Receiver<GateState>) -> GateOutcome {
        match rx.wait_for(|state| *state != GateState::Pending).await {
            Ok(state) if *state == GateState::Ready => GateOutcome::Ready,
            Ok(_) => GateOutcome::Closed,
            // Sender dropped: the gate is gone, fail open.
            Err(_) => GateOutcome::Closed,
        }
    }
}

/// The live gates, one per known guild.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: DashMap<Snowflake, Arc<ReadinessGate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guild's gate, creating a pending one if there is none.
    pub fn get_or_create(&self, guild_id: Snowflake) -> Arc<ReadinessGate> {
        self.gates
            .entry(guild_id)
            .or_insert_with(|| {
                trace!(guild_id = %guild_id, "gate created");
                Arc::new(ReadinessGate::new(guild_id))
            })
            .value()
            .clone()
    }

    pub fn get(&self, guild_id: Snowflake) -> Option<Arc<ReadinessGate>> {
        self.gates.get(&guild_id).map(|g| Arc::clone(g.value()))
    }

    /// Signal the guild's gate, if it has one.
    pub fn signal(&self, guild_id: Snowflake) -> bool {
        match self.get(guild_id) {
            Some(gate) => {
                gate.signal();
                true
            }
            None => {
                trace!(guild_id = %guild_id, "signal for guild without a gate");
                false
            }
        }
    }

    /// Remove the guild's gate and release its waiters.
    pub fn remove(&self, guild_id: Snowflake) {
        if let Some((_, gate)) = self.gates.remove(&guild_id) {
            gate.close();
        }
    }

    /// Close every gate. Used on shutdown.
    pub fn close_all(&self) {
        for gate in self.gates.iter() {
            gate.close();
        }
        self.gates.clear();
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
