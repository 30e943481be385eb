//! Time-sortable stream identifiers.
//!
//! A [`StreamId`] is a 128-bit value rendered in the familiar hyphenated UUID
//! form with version nibble `7`. The top 48 bits carry the Unix-millisecond
//! timestamp and the next bits a 32-bit per-process monotonic sequence, so
//! ids generated by one process sort in creation order even within the same
//! millisecond. The remaining bits are random.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Unique identifier of one stream session.
///
/// # Example
///
/// ```
/// use streamguard::stream_id::StreamId;
///
/// let a = StreamId::generate();
/// let b = StreamId::generate();
/// assert!(a < b);
/// assert_eq!(a.to_string().as_bytes()[14], b'7'); // version nibble
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a fresh id for the current instant.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self::from_parts(millis, seq)
    }

    /// Assemble an id from an explicit timestamp and sequence number.
    ///
    /// Byte layout (big-endian, so lexicographic order equals creation order):
    ///
    /// ```text
    /// bytes 0..6   48-bit Unix milliseconds
    /// bytes 6..8   version nibble 7, then sequence bits 31..20
    /// byte  8      variant bits 10, then sequence bits 19..14
    /// byte  9      sequence bits 13..6
    /// byte 10      sequence bits 5..0, then 2 random bits
    /// bytes 11..16 random
    /// ```
    pub fn from_parts(unix_millis: u64, sequence: u32) -> Self {
        let mut bytes = [0u8; 16];

        bytes[0] = (unix_millis >> 40) as u8;
        bytes[1] = (unix_millis >> 32) as u8;
        bytes[2] = (unix_millis >> 24) as u8;
        bytes[3] = (unix_millis >> 16) as u8;
        bytes[4] = (unix_millis >> 8) as u8;
        bytes[5] = unix_millis as u8;

        bytes[6] = 0x70 | ((sequence >> 28) & 0x0F) as u8;
        bytes[7] = (sequence >> 20) as u8;
        bytes[8] = 0x80 | ((sequence >> 14) & 0x3F) as u8;
        bytes[9] = (sequence >> 6) as u8;
        bytes[10] = ((sequence & 0x3F) as u8) << 2 | (fastrand::u8(..) & 0x03);

        for b in &mut bytes[11..16] {
            *b = fastrand::u8(..);
        }

        StreamId(Uuid::from_bytes(bytes))
    }

    /// The embedded Unix-millisecond timestamp.
    pub fn unix_millis(&self) -> u64 {
        let b = self.0.as_bytes();
        ((b[0] as u64) << 40)
            | ((b[1] as u64) << 32)
            | ((b[2] as u64) << 24)
            | ((b[3] as u64) << 16)
            | ((b[4] as u64) << 8)
            | (b[5] as u64)
    }

    /// The underlying UUID value.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for StreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(StreamId(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_monotonic() {
        let mut previous = StreamId::generate();
        for _ in 0..1000 {
            let next = StreamId::generate();
            assert!(next > previous, "{} !> {}", next, previous);
            previous = next;
        }
    }

    #[test]
    fn test_version_and_variant_nibbles() {
        let id = StreamId::generate().to_string();
        let chars: Vec<char> = id.chars().collect();
        assert_eq!(chars[14], '7');
        assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'), "variant {}", chars[19]);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let id = StreamId::from_parts(1_700_000_000_123, 42);
        assert_eq!(id.unix_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_sequence_orders_within_millisecond() {
        let a = StreamId::from_parts(1_700_000_000_000, 1);
        let b = StreamId::from_parts(1_700_000_000_000, 2);
        let c = StreamId::from_parts(1_700_000_000_000, u32::MAX);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_timestamp_dominates_sequence() {
        let early = StreamId::from_parts(1_700_000_000_000, u32::MAX);
        let late = StreamId::from_parts(1_700_000_000_001, 0);
        assert!(early < late);
    }

    #[test]
    fn test_display_parse_round_trip() {
        let id = StreamId::generate();
        let parsed: StreamId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_hyphenated_shape() {
        let s = StreamId::generate().to_string();
        assert_eq!(s.len(), 36);
        let hyphens: Vec<usize> = s
            .char_indices()
            .filter(|(_, c)| *c == '-')
            .map(|(i, _)| i)
            .collect();
        assert_eq!(hyphens, vec![8, 13, 18, 23]);
    }
}
