//! Namespaced cache keys.
//!
//! The cache holds two disjoint key spaces. Public keys are the ones callers
//! pass to [`Cache::get`](crate::Cache::get) and friends. Internal keys are
//! reserved for collaborating subsystems that cache derived artifacts next to
//! user data without any chance of colliding with a user key.
//!
//! Ordering is total: every public key compares greater than every internal
//! key, and keys in the same namespace compare by the ordinal byte order of
//! their text.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use std::sync::Arc;

/// A key in either the public or the internal namespace.
///
/// Cloning is cheap: the text is reference counted so the same key can be
/// shared by the hash table, the indices and enumerators.
///
/// # Examples
///
/// ```
/// use adaptive_cache::CacheKey;
///
/// let user = CacheKey::public("a");
/// let derived = CacheKey::internal("z");
/// assert!(user > derived);
/// assert_ne!(CacheKey::public("k"), CacheKey::internal("k"));
/// ```
#[derive(Clone)]
pub struct CacheKey {
    text: Arc<str>,
    is_public: bool,
}

impl CacheKey {
    /// Creates a key in the public namespace.
    pub fn public(text: impl Into<Arc<str>>) -> Self {
        Self {
            text: text.into(),
            is_public: true,
        }
    }

    /// Creates a key in the internal namespace.
    pub fn internal(text: impl Into<Arc<str>>) -> Self {
        Self {
            text: text.into(),
            is_public: false,
        }
    }

    /// Returns the key text.
    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns `true` for keys in the public namespace.
    #[inline]
    pub fn is_public(&self) -> bool {
        self.is_public
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.is_public == other.is_public && self.text == other.text
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.is_public.hash(state);
        self.text.hash(state);
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.is_public
            .cmp(&other.is_public)
            .then_with(|| self.text.as_bytes().cmp(other.text.as_bytes()))
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("text", &self.text())
            .field("is_public", &self.is_public)
            .finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_public {
            f.write_str(&self.text)
        } else {
            write!(f, "<internal>{}", self.text)
        }
    }
}
