use tokio::sync::{Mutex, Notify};

struct Generation {
    arrived: usize,
    generation: u64,
}

/// An async barrier for a fixed number of parties.
///
/// Each party calls [`Rendezvous::arrive`]; all of them are released once the
/// last one arrives, and the barrier resets for the next round. Exactly one
/// party per round (the last to arrive) is told it was the leader.
pub struct Rendezvous {
    parties: usize,
    state: Mutex<Generation>,
    released: Notify,
}

impl Rendezvous {
    /// A barrier for `parties` participants. Zero is treated as one.
    pub fn new(parties: usize) -> Self {
        Self {
            parties: parties.max(1),
            state: Mutex::new(Generation { arrived: 0, generation: 0 }),
            released: Notify::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Wait until every party has arrived. Returns true for the leader.
    pub async fn arrive(&self) -> bool {
        let generation = {
            let mut state = self.state.lock().await;
            state.arrived += 1;
            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation += 1;
                self.released.notify_waiters();
                return true;
            }
            state.generation
        };

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // register before checking, so a release in between is not missed
            released.as_mut().enable();
            if self.state.lock().await.generation != generation {
                return false;
            }
            released.await;
        }
    }
}
