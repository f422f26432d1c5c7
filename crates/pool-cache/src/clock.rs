//! Time and chain progress as observed by the cache. Both are polled by every
//! scheduling pass, never pushed.

use {
    crate::current_block::CurrentBlockStream,
    std::time::Instant,
};

pub trait Clock: Send + Sync {
    /// Current wall clock time.
    fn now(&self) -> Instant;

    /// Latest block number observed on the chain. Never decreases.
    fn block_number(&self) -> u64;
}

/// Clock backed by the system time and a block stream.
pub struct ChainClock {
    blocks: CurrentBlockStream,
}

impl ChainClock {
    pub fn new(blocks: CurrentBlockStream) -> Self {
        Self { blocks }
    }
}

impl Clock for ChainClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn block_number(&self) -> u64 {
        self.blocks.borrow().number
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use manual::ManualClock;

#[cfg(any(test, feature = "test-util"))]
mod manual {
    use {
        super::Clock,
        std::{
            sync::{
                Mutex,
                atomic::{AtomicU64, Ordering},
            },
            time::{Duration, Instant},
        },
    };

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<Instant>,
        block: AtomicU64,
    }

    impl ManualClock {
        pub fn new(block: u64) -> Self {
            Self {
                now: Mutex::new(Instant::now()),
                block: AtomicU64::new(block),
            }
        }

        pub fn advance(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }

        pub fn set_block(&self, block: u64) {
            self.block.store(block, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }

        fn block_number(&self) -> u64 {
            self.block.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::current_block::{BlockInfo, mock_single_block},
        std::time::Duration,
    };

    #[test]
    fn chain_clock_reads_block_stream() {
        let clock = ChainClock::new(mock_single_block(BlockInfo {
            number: 42,
            ..Default::default()
        }));
        assert_eq!(clock.block_number(), 42);
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(1);
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        clock.set_block(2);
        assert_eq!(clock.now() - start, Duration::from_millis(1500));
        assert_eq!(clock.block_number(), 2);
    }
}
