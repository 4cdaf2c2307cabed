//! Read/write split shared by connection sets and routed statements
//!
//! [`Replicated`] holds one primary and an ordered list of replicas of any
//! target type; [`RoundRobin`] picks the replica for each read. A connection
//! set and every statement prepared from it share one `RoundRobin`, so reads
//! through either form a single rotation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared round-robin replica selector
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    /// Start the rotation at the first replica
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the rotation at an arbitrary position
    pub fn starting_at(position: u64) -> Self {
        Self {
            counter: AtomicU64::new(position),
        }
    }

    /// Claim the next slot among `n` targets.
    ///
    /// Every call advances the counter exactly once, so concurrent callers
    /// never observe the same slot for the same counter value. Returns 0
    /// when `n` is 0. The window spanning the `u64` wrap is uneven unless
    /// `n` is a power of two.
    #[inline]
    pub fn next(&self, n: usize) -> usize {
        let ticket = self.counter.fetch_add(1, Ordering::Relaxed);
        if n == 0 {
            0
        } else {
            (ticket % n as u64) as usize
        }
    }

    /// Number of selections made so far (plus the starting position)
    pub fn position(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// A primary and its replicas
#[derive(Debug, Clone)]
pub struct Replicated<T> {
    primary: T,
    replicas: Vec<T>,
}

impl<T> Replicated<T> {
    /// Group a primary with its replicas
    pub fn new(primary: T, replicas: Vec<T>) -> Self {
        Self { primary, replicas }
    }

    /// Build from an ordered list whose first element is the primary
    pub fn from_vec(mut targets: Vec<T>) -> Option<Self> {
        if targets.is_empty() {
            return None;
        }
        let replicas = targets.split_off(1);
        let primary = targets.pop()?;
        Some(Self { primary, replicas })
    }

    /// Target for writes
    #[inline]
    pub fn read_write(&self) -> &T {
        &self.primary
    }

    /// Target for reads: the next replica in rotation, or the primary when
    /// there are none.
    pub fn read_only(&self, selector: &RoundRobin) -> &T {
        if self.replicas.is_empty() {
            return &self.primary;
        }
        &self.replicas[selector.next(self.replicas.len())]
    }

    /// Replicas in configured order
    pub fn replicas(&self) -> &[T] {
        &self.replicas
    }

    /// Number of replicas
    #[inline]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Number of targets (primary included)
    #[inline]
    pub fn len(&self) -> usize {
        1 + self.replicas.len()
    }

    /// Always false; a primary is always present
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Target by fan-out index (0 is the primary)
    pub fn get(&self, index: usize) -> Option<&T> {
        match index {
            0 => Some(&self.primary),
            i => self.replicas.get(i - 1),
        }
    }

    /// All targets, primary first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    /// Apply `f` to every target in order, primary first
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        self.iter().for_each(&mut f);
    }
}

/// Anything that splits traffic between a write target and read targets
pub trait ReadWriteSplit {
    /// What a read or write is routed to
    type Target: ?Sized;

    /// Target for writes
    fn read_write(&self) -> &Self::Target;

    /// Target for reads
    fn read_only(&self) -> &Self::Target;
}
