//! Snowflake-style id generation.
//!
//! One id keys a whole saga (purchase, order, and payment rows share it),
//! so ids must be unique across the fleet and roughly time-ordered. The
//! layout is 41 bits of milliseconds since a fixed epoch, 10 bits of
//! machine id, and a 12-bit per-millisecond sequence.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// 2024-01-01T00:00:00Z in unix milliseconds.
const EPOCH_MILLIS: u64 = 1_704_067_200_000;
const MACHINE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Seam for id generation so tests can pin ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// Clock-and-sequence generator.
pub struct SnowflakeGenerator {
    machine_id: u64,
    state: Mutex<State>,
}

struct State {
    last_millis: u64,
    sequence: u64,
}

impl SnowflakeGenerator {
    pub fn new(machine_id: u16) -> Self {
        Self {
            machine_id: u64::from(machine_id) & ((1 << MACHINE_BITS) - 1),
            state: Mutex::new(State {
                last_millis: 0,
                sequence: 0,
            }),
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
            - EPOCH_MILLIS
    }
}

impl IdGenerator for SnowflakeGenerator {
    fn next_id(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        let mut now = Self::now_millis();
        // Never hand out ids for an earlier millisecond than the last one.
        if now < state.last_millis {
            now = state.last_millis;
        }
        if now == state.last_millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; move on.
                now = state.last_millis + 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_millis = now;
        (now << (MACHINE_BITS + SEQUENCE_BITS)) | (self.machine_id << SEQUENCE_BITS) | state.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_strictly_increase() {
        let generator = SnowflakeGenerator::new(1);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let generator = Arc::new(SnowflakeGenerator::new(1));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let generator = Arc::clone(&generator);
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| generator.next_id()).collect::<Vec<u64>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
    }

    #[test]
    fn test_machine_id_is_embedded() {
        let generator = SnowflakeGenerator::new(7);
        let id = generator.next_id();
        assert_eq!((id >> SEQUENCE_BITS) & ((1 << MACHINE_BITS) - 1), 7);
    }
}
