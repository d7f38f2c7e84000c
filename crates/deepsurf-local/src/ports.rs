//! Ephemeral port checkout for browser sessions.

use deepsurf_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const RANDOM_DRAWS: usize = 100;

struct PortState {
    used: HashSet<u16>,
    rng: StdRng,
}

/// Hands out ports from an inclusive range, never the same one twice while it is held.
///
/// Every operation runs under one mutex. Allocation tries a bounded number of random draws and
/// then scans the whole range, so it only fails when every port is taken.
pub struct PortAllocator {
    start: u16,
    end: u16,
    state: Mutex<PortState>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        Self::with_rng(start, end, StdRng::from_entropy())
    }

    /// Deterministic draws, for tests.
    pub fn with_seed(start: u16, end: u16, seed: u64) -> Result<Self> {
        Self::with_rng(start, end, StdRng::seed_from_u64(seed))
    }

    fn with_rng(start: u16, end: u16, rng: StdRng) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidArgs(format!(
                "port range start {start} is above end {end}"
            )));
        }
        Ok(Self {
            start,
            end,
            state: Mutex::new(PortState {
                used: HashSet::new(),
                rng,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortState> {
        // The state is a plain set; a panic elsewhere cannot leave it half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn in_use(&self) -> usize {
        self.lock().used.len()
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.lock().used.contains(&port)
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut st = self.lock();
        if st.used.len() >= self.capacity() {
            return Err(Error::Exhausted(format!(
                "all {} ports in {}-{} are in use",
                self.capacity(),
                self.start,
                self.end
            )));
        }

        for _ in 0..RANDOM_DRAWS {
            let p = st.rng.gen_range(self.start..=self.end);
            if st.used.insert(p) {
                tracing::debug!(port = p, "port allocated");
                return Ok(p);
            }
        }

        for p in self.start..=self.end {
            if st.used.insert(p) {
                tracing::debug!(port = p, "port allocated by scan");
                return Ok(p);
            }
        }

        Err(Error::Exhausted(format!(
            "no free port in {}-{}",
            self.start, self.end
        )))
    }

    /// Allocate a port that goes back to the range when the reservation is dropped, unless it
    /// was handed on with [`PortReservation::into_port`].
    pub fn reserve(self: &Arc<Self>) -> Result<PortReservation> {
        let port = self.allocate()?;
        Ok(PortReservation {
            ports: self.clone(),
            port,
            armed: true,
        })
    }

    /// Returns whether the port was held. Releasing an untracked port is a logged no-op.
    pub fn release(&self, port: u16) -> bool {
        let removed = self.lock().used.remove(&port);
        if removed {
            tracing::debug!(port, "port released");
        } else {
            tracing::warn!(port, "release of a port that was not allocated");
        }
        removed
    }
}

/// An allocated port not yet owned by a worker.
#[derive(Debug)]
pub struct PortReservation {
    ports: Arc<PortAllocator>,
    port: u16,
    armed: bool,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Hand the port to a new owner, who must release it.
    pub fn into_port(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.armed {
            self.ports.release(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fills_the_whole_range_then_exhausts() {
        let a = PortAllocator::with_seed(9000, 9009, 7).unwrap();
        let mut got: Vec<u16> = (0..10).map(|_| a.allocate().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (9000..=9009).collect::<Vec<_>>());
        assert!(matches!(a.allocate(), Err(Error::Exhausted(_))));

        assert!(a.release(9004));
        assert_eq!(a.allocate().unwrap(), 9004);
    }

    #[test]
    fn releasing_unknown_port_is_a_noop() {
        let a = PortAllocator::with_seed(9000, 9001, 1).unwrap();
        assert!(!a.release(12345));
        let p = a.allocate().unwrap();
        assert!(a.release(p));
        assert!(!a.release(p));
        assert_eq!(a.in_use(), 0);
    }

    #[test]
    fn dropped_reservation_returns_its_port() {
        let a = Arc::new(PortAllocator::with_seed(9000, 9001, 2).unwrap());
        let r = a.reserve().unwrap();
        assert!(a.is_held(r.port()));
        drop(r);
        assert_eq!(a.in_use(), 0);

        let kept = a.reserve().unwrap().into_port();
        assert!(a.is_held(kept));
        assert!(a.release(kept));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(PortAllocator::new(10, 9).is_err());
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let a = Arc::new(PortAllocator::new(20_000, 20_199).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let a = a.clone();
                std::thread::spawn(move || (0..50).map(|_| a.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
        assert!(a.allocate().is_err());
    }

    proptest! {
        #[test]
        fn held_ports_are_never_handed_out_twice(
            seed in any::<u64>(),
            ops in proptest::collection::vec(any::<(bool, u8)>(), 1..200),
        ) {
            let a = PortAllocator::with_seed(30_000, 30_015, seed).unwrap();
            let mut held: Vec<u16> = Vec::new();
            for (alloc, pick) in ops {
                if alloc || held.is_empty() {
                    match a.allocate() {
                        Ok(p) => {
                            prop_assert!(!held.contains(&p));
                            prop_assert!((30_000..=30_015).contains(&p));
                            held.push(p);
                        }
                        Err(_) => prop_assert_eq!(held.len(), 16),
                    }
                } else {
                    let p = held.swap_remove(pick as usize % held.len());
                    prop_assert!(a.release(p));
                }
                prop_assert_eq!(a.in_use(), held.len());
            }
        }
    }
}
