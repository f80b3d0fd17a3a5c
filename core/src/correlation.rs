//! Correlation identifiers for requests and their default reply topics.

use rand::Rng;

/// Produces opaque identifiers linking a request to its reply.
///
/// Uniqueness, not unpredictability, is the requirement.
pub trait CorrelationIdGenerator: Send + Sync {
    fn create(&self) -> String;
}

const HEX: &[u8; 16] = b"0123456789abcdef";

const fn build_lut() -> [[u8; 2]; 256] {
    let mut lut = [[0u8; 2]; 256];
    let mut i = 0;
    while i < 256 {
        lut[i] = [HEX[i >> 4], HEX[i & 0x0f]];
        i += 1;
    }
    lut
}

// Byte -> two lowercase hex digits
static LUT: [[u8; 2]; 256] = build_lut();

/// RFC 4122 version 4 style identifiers from 128 random bits.
///
/// # Examples
///
/// ```
/// use courier_core::{CorrelationIdGenerator, UuidGenerator};
///
/// let id = UuidGenerator::new().create();
/// assert_eq!(id.len(), 36);
/// assert_eq!(&id[14..15], "4");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl UuidGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl CorrelationIdGenerator for UuidGenerator {
    fn create(&self) -> String {
        let mut bytes: [u8; 16] = rand::thread_rng().gen();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        let mut out = Vec::with_capacity(36);
        for (i, b) in bytes.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                out.push(b'-');
            }
            out.extend_from_slice(&LUT[*b as usize]);
        }
        // Only ASCII hex digits and dashes were written
        String::from_utf8(out).unwrap_or_default()
    }
}
