//! Xbox 360 CPUKey value type.
//!
//! A CPUKey is the 16-byte per-device identifier burned into a console's
//! CPU fuses. Two structural checks separate real key material from
//! arbitrary bytes: the 106 data bits carry a fixed Hamming weight of
//! 0x35, and the remaining 22 bits are ECD (Error Correction & Detection)
//! check bits that must be a fixed point of [`compute_ecd`]. Both checks
//! are reproduced bit-for-bit so keys accepted here interoperate with
//! existing key material and tooling.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Size of a CPUKey in bytes.
pub const CPUKEY_LEN: usize = 16;

/// Length of a CPUKey rendered as hex.
pub const CPUKEY_HEX_LEN: usize = 32;

/// Polynomial constant of the ECD update. Interoperability constant, not a knob.
const ECD_POLY: u32 = 0x360325;

/// Required Hamming weight over the 106 data bits.
const DATA_WEIGHT: u32 = 0x35;

/// Clears the 22 ECD bits (bits 106..127) from the big-endian low word.
const ECD_MASK: u64 = 0xFFFF_FFFF_FF03_0000;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a byte sequence or hex string is not a CPUKey.
///
/// The kinds split into two families: malformed input that could never be a
/// key (wrong shape), and well-formed 16-byte values that fail the
/// structural checks (wrong content).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuKeyError {
    #[error("input is empty")]
    Empty,

    #[error("unexpected input length {0}")]
    Length(usize),

    #[error("input contains a non-hex digit")]
    NonHex,

    #[error("all bytes are zero")]
    AllZero,

    #[error("Hamming weight of the data bits is not 0x35")]
    HammingWeight,

    #[error("ECD check bits do not match")]
    Ecd,
}

impl CpuKeyError {
    /// Input has the wrong shape — empty, wrong length, non-hex, or all zero.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::Empty | Self::Length(_) | Self::NonHex | Self::AllZero
        )
    }

    /// Well-formed 16 bytes that fail the Hamming-weight or ECD check.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::HammingWeight | Self::Ecd)
    }
}

// ── CpuKey ────────────────────────────────────────────────────────────────────

/// An immutable, validated 16-byte CPUKey.
///
/// Every value constructed through [`CpuKey::from_bytes`],
/// [`CpuKey::from_hex`], or [`CpuKey::random`] satisfies the structural
/// checks. The one exception is [`CpuKey::EMPTY`], the all-zero sentinel
/// standing for "unset / known-invalid but not malformed".
///
/// Equality, ordering, and hashing are all byte-wise; ordering is
/// lexicographic over the 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuKey([u8; CPUKEY_LEN]);

impl CpuKey {
    /// The all-zero sentinel. Fails validation deliberately.
    pub const EMPTY: CpuKey = CpuKey([0u8; CPUKEY_LEN]);

    /// Construct from a byte sequence, validating the structural checks.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CpuKeyError> {
        if bytes.is_empty() {
            return Err(CpuKeyError::Empty);
        }
        if bytes.len() != CPUKEY_LEN {
            return Err(CpuKeyError::Length(bytes.len()));
        }
        let mut buf = [0u8; CPUKEY_LEN];
        buf.copy_from_slice(bytes);
        validate(&buf)?;
        Ok(CpuKey(buf))
    }

    /// Construct from a 32-digit hex string, either case.
    pub fn from_hex(s: &str) -> Result<Self, CpuKeyError> {
        if s.is_empty() {
            return Err(CpuKeyError::Empty);
        }
        if s.len() != CPUKEY_HEX_LEN {
            return Err(CpuKeyError::Length(s.len()));
        }
        let mut buf = [0u8; CPUKEY_LEN];
        hex::decode_to_slice(s, &mut buf).map_err(|_| CpuKeyError::NonHex)?;
        validate(&buf)?;
        Ok(CpuKey(buf))
    }

    /// Non-throwing parse with a three-way outcome:
    ///
    /// - a valid key parses to `Some(key)`;
    /// - a well-formed but structurally invalid key (Hamming weight or ECD)
    ///   parses to `Some(CpuKey::EMPTY)` — known-invalid, not malformed;
    /// - malformed input parses to `None`.
    pub fn try_parse(s: &str) -> Option<Self> {
        match Self::from_hex(s) {
            Ok(key) => Some(key),
            Err(e) if e.is_invalid() => Some(CpuKey::EMPTY),
            Err(_) => None,
        }
    }

    /// Generate a random valid CPUKey.
    ///
    /// Draws 16 bytes from a CSPRNG until the data bits carry the required
    /// Hamming weight, then writes the ECD bits in place. The rejection
    /// loop runs until it succeeds; there is no attempt cap.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; CPUKEY_LEN];
        loop {
            rng.fill_bytes(&mut buf);
            if data_weight(&buf) == DATA_WEIGHT {
                break;
            }
        }
        compute_ecd(&mut buf);
        CpuKey(buf)
    }

    /// Whether this is the all-zero sentinel.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; CPUKEY_LEN]
    }

    /// Whether the bytes satisfy the structural checks.
    ///
    /// False only for [`CpuKey::EMPTY`]; every other constructed value is valid.
    pub fn is_valid(&self) -> bool {
        validate(&self.0).is_ok()
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; CPUKEY_LEN] {
        &self.0
    }

    /// Uppercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// SHA-1 digest of the 16 bytes.
    ///
    /// Key databases index on this digest rather than the key itself.
    pub fn digest(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(self.0);
        hasher.finalize().into()
    }
}

impl Default for CpuKey {
    fn default() -> Self {
        CpuKey::EMPTY
    }
}

impl fmt::Display for CpuKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CpuKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuKey({})", self.to_hex())
    }
}

impl FromStr for CpuKey {
    type Err = CpuKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CpuKey::from_hex(s)
    }
}

impl TryFrom<&[u8]> for CpuKey {
    type Error = CpuKeyError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        CpuKey::from_bytes(bytes)
    }
}

// Interop equality: a key compares equal to its hex spelling (either case)
// and to a byte sequence with the same bytes.

impl PartialEq<str> for CpuKey {
    fn eq(&self, other: &str) -> bool {
        other.len() == CPUKEY_HEX_LEN && other.eq_ignore_ascii_case(&self.to_hex())
    }
}

impl PartialEq<&str> for CpuKey {
    fn eq(&self, other: &&str) -> bool {
        *self == **other
    }
}

impl PartialEq<[u8; CPUKEY_LEN]> for CpuKey {
    fn eq(&self, other: &[u8; CPUKEY_LEN]) -> bool {
        self.0 == *other
    }
}

impl PartialEq<[u8]> for CpuKey {
    fn eq(&self, other: &[u8]) -> bool {
        self.0[..] == *other
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

fn validate(bytes: &[u8; CPUKEY_LEN]) -> Result<(), CpuKeyError> {
    if bytes.iter().all(|&b| b == 0) {
        return Err(CpuKeyError::AllZero);
    }
    if data_weight(bytes) != DATA_WEIGHT {
        return Err(CpuKeyError::HammingWeight);
    }
    let mut copy = *bytes;
    compute_ecd(&mut copy);
    if copy != *bytes {
        return Err(CpuKeyError::Ecd);
    }
    Ok(())
}

/// Hamming weight of the 106 data bits.
///
/// The key's bit numbering is big-endian, so each 8-byte half is read as a
/// big-endian word before masking out the ECD bits and popcounting.
fn data_weight(bytes: &[u8; CPUKEY_LEN]) -> u32 {
    let mut hi = [0u8; 8];
    let mut lo = [0u8; 8];
    hi.copy_from_slice(&bytes[..8]);
    lo.copy_from_slice(&bytes[8..]);
    u64::from_be_bytes(hi).count_ones() + (u64::from_be_bytes(lo) & ECD_MASK).count_ones()
}

/// Recompute the 22 ECD check bits (bits 106..127) in place.
///
/// Bit `i` lives at byte `i >> 3`, bit `i & 7`. The first 106 iterations
/// fold the data bits through an LFSR-like accumulator keyed by
/// [`ECD_POLY`]; the remainder rewrite the check bits to whatever makes the
/// fold self-consistent. A valid key is a fixed point of this function.
/// The final iteration flips bit 7 of byte 0xF when the parity accumulator
/// disagrees, regardless of the preceding check-bit writes.
fn compute_ecd(data: &mut [u8; CPUKEY_LEN]) {
    let mut acc1: u32 = 0;
    let mut acc2: u32 = 0;
    for i in 0..128 {
        let bit = u32::from((data[i >> 3] >> (i & 7)) & 1);
        if i < 0x6A {
            acc1 ^= bit;
            if acc1 & 1 != 0 {
                acc1 ^= ECD_POLY;
            }
            acc2 ^= bit;
        } else if i < 0x7F {
            if bit != acc1 & 1 {
                data[i >> 3] ^= 1 << (i & 7);
            }
            acc2 ^= acc1 & 1;
        } else if bit != acc2 {
            data[0xF] ^= 0x80;
        }
        acc1 >>= 1;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
