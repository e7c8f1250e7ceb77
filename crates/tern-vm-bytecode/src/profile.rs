//! Per-codeword profiling bytes
//!
//! One byte per code word, allocated on first use. For an opcode word the
//! byte is a saturating slow-case counter; for a register operand word it
//! accumulates the value-type bits observed there; for the cache operand of
//! a named get it holds [`GET_FAILED_INLINE`] / [`GET_CACHE_HIT`] flags.

use parking_lot::RwLock;

/// A named get at this site missed its inline cache at least once
pub const GET_FAILED_INLINE: u8 = 1;

/// A named get at this site hit its inline cache at least once
pub const GET_CACHE_HIT: u8 = 2;

/// Lazily allocated profile bytes for a [`crate::StaticCode`]
#[derive(Debug, Default)]
pub struct ProfileData {
    bytes: RwLock<Option<Box<[u8]>>>,
}

impl ProfileData {
    fn update(&self, len: usize, index: usize, f: impl FnOnce(&mut u8)) {
        let mut guard = self.bytes.write();
        let bytes = guard.get_or_insert_with(|| vec![0u8; len].into_boxed_slice());
        if let Some(byte) = bytes.get_mut(index) {
            f(byte);
        }
    }

    /// Add `weight` to the slow-case counter at an opcode word
    pub fn record_slow_case(&self, len: usize, index: usize, weight: u8) {
        self.update(len, index, |byte| *byte = byte.saturating_add(weight));
    }

    /// Merge observed value-type bits into a register operand word
    pub fn record_type(&self, len: usize, index: usize, type_bits: u8) {
        self.update(len, index, |byte| *byte |= type_bits);
    }

    /// Set a flag on a site
    pub fn set_flag(&self, len: usize, index: usize, flag: u8) {
        self.update(len, index, |byte| *byte |= flag);
    }

    /// Byte at `index`, zero when nothing was recorded
    pub fn get(&self, index: usize) -> u8 {
        self.bytes
            .read()
            .as_ref()
            .and_then(|bytes| bytes.get(index).copied())
            .unwrap_or(0)
    }

    /// Whether any byte has been recorded
    pub fn is_allocated(&self) -> bool {
        self.bytes.read().is_some()
    }

    /// Copy of all bytes, for a native code generator
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.bytes.read().as_ref().map(|bytes| bytes.to_vec())
    }

    /// Drop all recorded data
    pub fn reset(&self) {
        *self.bytes.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_saturate_and_flags_merge() {
        let profile = ProfileData::default();
        assert!(!profile.is_allocated());
        profile.record_slow_case(4, 0, 200);
        profile.record_slow_case(4, 0, 200);
        profile.record_type(4, 1, 0x08);
        profile.record_type(4, 1, 0x10);
        profile.set_flag(4, 3, GET_CACHE_HIT);
        assert_eq!(profile.get(0), u8::MAX);
        assert_eq!(profile.get(1), 0x18);
        assert_eq!(profile.get(3), GET_CACHE_HIT);
        assert_eq!(profile.get(99), 0);
        profile.reset();
        assert!(profile.snapshot().is_none());
    }
}
