//! Random token generation for content keys and modification keys.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Characters a token may contain.
pub const CHARACTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of the modification keys issued for `Allow-Modification` uploads.
pub const AUTH_KEY_LENGTH: usize = 32;

/// Randomly generates tokens for new content uploads.
///
/// The generator is seeded from the operating system's entropy source, so
/// tokens are not guessable from previous outputs.
pub struct TokenGenerator {
    length: usize,
    rng: Mutex<StdRng>,
}

impl TokenGenerator {
    /// Create a generator producing tokens of `length` characters.
    ///
    /// Panics if `length < 2`.
    pub fn new(length: usize) -> Self {
        assert!(length >= 2, "token length must be at least 2");
        Self {
            length,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Generate a fresh random token.
    pub fn generate(&self) -> String {
        let mut rng = self.rng.lock().expect("rng mutex poisoned");
        (0..self.length)
            .map(|_| CHARACTERS[rng.gen_range(0..CHARACTERS.len())] as char)
            .collect()
    }
}

/// Whether `key` has the shape of a generated token: non-empty, ASCII
/// alphanumeric only. Request handlers use this to validate `/{id}` paths
/// before touching storage.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric())
}
