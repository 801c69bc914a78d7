//! Constant-time comparisons.
//!
//! Signatures and challenge responses are secret-dependent and must never be
//! compared with `==`.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `true` if slices are equal, `false` otherwise.
/// Execution time depends only on slice length, not content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 32-byte tag comparison.
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}

/// Timing-safe comparison of two hex-encoded tags.
///
/// Both sides are decoded first so that case differences in the encoding do
/// not leak through an early mismatch. Malformed hex compares unequal.
#[must_use]
pub fn verify_hex(expected: &[u8], candidate_hex: &str) -> bool {
    match hex::decode(candidate_hex.trim()) {
        Ok(candidate) => ct_eq(expected, &candidate),
        Err(_) => false,
    }
}
