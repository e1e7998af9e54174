//! Request identifiers.
//!
//! Every invocation of an operation is tagged with a [`RequestId`] generated
//! once, up front. The id is carried by each lifecycle event of that
//! invocation and by the handle returned to the caller, which is how
//! consumers correlate the two.
//!
//! The only invariant is uniqueness across invocations. Ids carry no ordering
//! information.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// URL-safe alphabet used by [`NanoIdGenerator`]
const URL_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Default id length (126 bits of entropy)
pub const DEFAULT_ID_LENGTH: usize = 21;

/// Opaque identifier of a single invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing string as a request id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Source of request ids
///
/// Implementations must return a fresh id on every call. Closures
/// `Fn() -> RequestId` implement this trait, so a generator can be supplied
/// inline:
///
/// ```
/// use composable_ops_core::request_id::{IdGenerator, RequestId};
///
/// let fixed = || RequestId::new("only-one");
/// assert_eq!(fixed.generate().as_str(), "only-one");
/// ```
pub trait IdGenerator: Send + Sync {
    /// Produce the next request id
    fn generate(&self) -> RequestId;
}

impl<F> IdGenerator for F
where
    F: Fn() -> RequestId + Send + Sync,
{
    fn generate(&self) -> RequestId {
        self()
    }
}

/// Random, URL-safe id generator
///
/// Draws each character uniformly from a 64-symbol alphabet using the
/// thread-local RNG. With the default length of 21 the collision probability
/// is negligible for any realistic number of invocations.
#[derive(Debug, Clone, Copy)]
pub struct NanoIdGenerator {
    length: usize,
}

impl NanoIdGenerator {
    /// Create a generator producing ids of [`DEFAULT_ID_LENGTH`] characters
    #[must_use]
    pub const fn new() -> Self {
        Self {
            length: DEFAULT_ID_LENGTH,
        }
    }

    /// Set the id length
    #[must_use]
    pub const fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Configured id length
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }
}

impl Default for NanoIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for NanoIdGenerator {
    fn generate(&self) -> RequestId {
        let mut rng = rand::thread_rng();
        let id = (0..self.length)
            .map(|_| char::from(URL_ALPHABET[rng.gen_range(0..URL_ALPHABET.len())]))
            .collect::<String>();
        RequestId(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn nano_ids_have_configured_length_and_alphabet() {
        let generator = NanoIdGenerator::new();
        let id = generator.generate();

        assert_eq!(id.as_str().len(), DEFAULT_ID_LENGTH);
        assert!(id.as_str().bytes().all(|b| URL_ALPHABET.contains(&b)));

        let short = NanoIdGenerator::new().with_length(8).generate();
        assert_eq!(short.as_str().len(), 8);
    }

    #[test]
    fn closures_are_generators() {
        let generator = || RequestId::from("fixed");
        assert_eq!(generator.generate(), RequestId::new("fixed"));
    }

    #[test]
    fn request_id_serializes_as_plain_string() {
        let id = RequestId::new("abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    proptest! {
        #[test]
        fn generated_ids_do_not_collide(count in 1usize..500) {
            let generator = NanoIdGenerator::new();
            let ids: HashSet<RequestId> = (0..count).map(|_| generator.generate()).collect();
            prop_assert_eq!(ids.len(), count);
        }
    }
}
