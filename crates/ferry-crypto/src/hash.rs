//! BLAKE3 hashing and key derivation.
//!
//! Provides:
//! - One-shot and incremental hashing (file integrity, transcripts)
//! - HKDF-style extract/expand built on keyed BLAKE3
//! - Context-specific KDF for fixed-purpose derivations

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher.
///
/// Used for whole-file digests that are built chunk by chunk and for
/// handshake transcripts built field by field.
#[derive(Clone)]
pub struct IncrementalHasher {
    hasher: blake3::Hasher,
    total_len: u64,
}

impl IncrementalHasher {
    /// Create a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            total_len: 0,
        }
    }

    /// Update with more data.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.total_len += data.len() as u64;
    }

    /// Update with a length-prefixed field so adjacent fields cannot be
    /// shifted into one another.
    pub fn update_field(&mut self, data: &[u8]) {
        self.update(&(data.len() as u64).to_le_bytes());
        self.update(data);
    }

    /// Get total bytes hashed so far.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Finalize and return the hash.
    #[must_use]
    pub fn finalize(&self) -> HashOutput {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let kdf = Kdf::new("ferry.triple.message-key.v1");
    /// let key = kdf.derive_key(&material);
    /// ```
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output of any length from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);
        hasher.finalize_xof().fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }
}

/// HKDF-Extract: Extract a pseudorandom key from input key material.
///
/// Corresponds to HKDF-Extract from RFC 5869, but using BLAKE3.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        hash(ikm)
    } else {
        let salt_hash = hash(salt);
        let mut hasher = blake3::Hasher::new_keyed(&salt_hash);
        hasher.update(ikm);
        *hasher.finalize().as_bytes()
    }
}

/// HKDF-Expand: Expand a pseudorandom key into arbitrary-length output.
///
/// Corresponds to HKDF-Expand from RFC 5869, but using BLAKE3.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);
    hasher.finalize_xof().fill(output);
}

/// HKDF: Combined extract-then-expand.
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], output: &mut [u8]) {
    let mut prk = hkdf_extract(salt, ikm);
    hkdf_expand(&prk, info, output);
    crate::wipe::secure_wipe(&mut prk);
}

/// Expand a 32-byte key under a label.
#[must_use]
pub fn expand_32(prk: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    hkdf_expand(prk, info, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_basic() {
        let hash1 = hash(b"hello world");
        let hash2 = hash(b"hello world");
        assert_eq!(hash1, hash2);
        assert_ne!(hash1, [0u8; 32]);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = IncrementalHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), hash(b"hello world"));
        assert_eq!(hasher.total_len(), 11);
    }

    #[test]
    fn test_update_field_is_unambiguous() {
        let mut a = IncrementalHasher::new();
        a.update_field(b"ab");
        a.update_field(b"c");

        let mut b = IncrementalHasher::new();
        b.update_field(b"a");
        b.update_field(b"bc");

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_kdf_context_separation() {
        let ikm = b"input key material";
        let k1 = Kdf::new("ferry.test.one").derive_key(ikm);
        let k2 = Kdf::new("ferry.test.two").derive_key(ikm);
        assert_eq!(k1, Kdf::new("ferry.test.one").derive_key(ikm));
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_hkdf_salt_and_info_matter() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        let mut c = [0u8; 64];
        hkdf(b"salt", b"ikm", b"info", &mut a);
        hkdf(b"other salt", b"ikm", b"info", &mut b);
        hkdf(b"salt", b"ikm", b"other info", &mut c);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hkdf_expand_prefix_consistency() {
        let prk = hkdf_extract(b"salt", b"ikm");
        let mut short = [0u8; 32];
        let mut long = [0u8; 64];
        hkdf_expand(&prk, b"label", &mut short);
        hkdf_expand(&prk, b"label", &mut long);
        assert_eq!(short, long[..32]);
        assert_eq!(expand_32(&prk, b"label"), short);
    }
}
