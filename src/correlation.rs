//! Correlation identifiers linking a request to its reply.
//!
//! A [`CorrelationId`] is an opaque 128-bit token. It is rendered on the wire as a hyphenated UUID string so that
//! repliers written against other client libraries can echo it back unchanged.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use uuid::Uuid;

/// 128-bit identifier carried in both request and reply metadata.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(u128);

impl CorrelationId {
    /// Creates a correlation id from a raw u128.
    pub const fn from_u128(value: u128) -> Self {
        CorrelationId(value)
    }

    /// Returns the raw u128 value.
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Generates a random (UUID v4) correlation id.
    pub fn random() -> Self {
        CorrelationId(Uuid::new_v4().as_u128())
    }

    /// Parses a correlation id from raw header or key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok()?.trim().parse().ok()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_u128(self.0).hyphenated(), f)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(|uuid| CorrelationId(uuid.as_u128()))
    }
}

/// Produces correlation ids for outbound requests.
///
/// Implementations must never return an id that is still in flight.
pub trait CorrelationIdGenerator: Send + Sync + 'static {
    /// Returns the next correlation id.
    fn generate(&self) -> CorrelationId;
}

/// Generates random UUID v4 correlation ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomIdGenerator;

impl CorrelationIdGenerator for RandomIdGenerator {
    fn generate(&self) -> CorrelationId {
        CorrelationId::random()
    }
}

/// Generates ids from a per-process seed and a monotonic counter.
///
/// Composition: `[seed:64 | counter:64]`, where the seed mixes the creation time with a random nonce. Ids are
/// unique for the lifetime of the generator and cheap to produce.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    /// Creates a generator with a fresh time-and-nonce seed.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self::with_seed(now ^ rand::random::<u64>())
    }

    /// Creates a generator with an explicit seed, useful for deterministic tests.
    pub fn with_seed(seed: u64) -> Self {
        SequentialIdGenerator {
            seed,
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdGenerator for SequentialIdGenerator {
    fn generate(&self) -> CorrelationId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        CorrelationId(((self.seed as u128) << 64) | n as u128)
    }
}
