use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Clock;

/// Bit layout: 42 bits of epoch milliseconds, 14 machine bits, 8 sequence
/// bits. 256 ids per millisecond per instance; the generator spins to the
/// next millisecond when the sequence wraps.
const MACHINE_BITS: u32 = 14;
const SEQUENCE_BITS: u32 = 8;
const MACHINE_MASK: u64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Per-instance id generator for backends that require non-zero message ids.
///
/// Ids are time-ordered and embed a machine discriminator hashed from the
/// hostname and process id, so independent producers in a cluster draw from
/// disjoint ranges with negligible collision probability.
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    machine: u64,
    state: Mutex<IdState>,
}

struct IdState {
    last_ms: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_machine_id(clock, machine_id())
    }

    pub fn with_machine_id(clock: Arc<dyn Clock>, machine: u64) -> Self {
        Self {
            clock,
            machine: machine & MACHINE_MASK,
            state: Mutex::new(IdState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now = self.clock.now_ms();
        // Clock went backwards: keep issuing from the highest millisecond
        // seen so ids stay unique and ordered.
        if now < state.last_ms {
            now = state.last_ms;
        }
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                now = state.last_ms + 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        pack(now, self.machine, state.sequence)
    }
}

fn pack(millis: u64, machine: u64, sequence: u64) -> u64 {
    (millis << (MACHINE_BITS + SEQUENCE_BITS)) | (machine << SEQUENCE_BITS) | sequence
}

fn machine_id() -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Ok(host) = std::env::var("HOSTNAME") {
        host.hash(&mut hasher);
    }
    std::process::id().hash(&mut hasher);
    hasher.finish() & MACHINE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;

    fn generator(clock: ManualClock) -> IdGenerator {
        IdGenerator::with_machine_id(Arc::new(clock), 0x2A)
    }

    #[test]
    fn ids_are_unique_within_a_millisecond() {
        let idgen = generator(ManualClock::new(1_000));
        let mut seen = HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(idgen.next_id()));
        }
    }

    #[test]
    fn ids_are_time_ordered() {
        let clock = ManualClock::new(1_000);
        let idgen = generator(clock.clone());
        let first = idgen.next_id();
        clock.advance(1);
        let second = idgen.next_id();
        assert!(second > first);
    }

    #[test]
    fn sequence_overflow_rolls_into_next_millisecond() {
        let idgen = generator(ManualClock::new(1_000));
        let mut last = 0;
        // 300 > 256 ids in one frozen millisecond; all must stay increasing.
        for _ in 0..300 {
            let id = idgen.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn clock_rollback_does_not_reissue_ids() {
        let clock = ManualClock::new(5_000);
        let idgen = generator(clock.clone());
        let before = idgen.next_id();
        clock.set(1_000);
        let after = idgen.next_id();
        assert!(after > before);
    }

    #[test]
    fn machine_bits_are_embedded() {
        let idgen = generator(ManualClock::new(1_000));
        let id = idgen.next_id();
        assert_eq!((id >> SEQUENCE_BITS) & MACHINE_MASK, 0x2A);
    }
}
