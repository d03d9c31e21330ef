//! Content encodings
//!
//! Compression codecs are supplied by the application. The transport
//! only needs a name to negotiate with and a byte-to-byte transform in
//! each direction.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

/// The name of the no-op content coding
pub const IDENTITY: &str = "identity";

/// A content coding negotiated by name
pub trait Encoding: Send + Sync {
    /// Token used in `Content-Encoding` / `Accept-Encoding`
    fn name(&self) -> &str;

    /// Compress an outbound body
    fn encode(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompress an inbound body
    fn decode(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    fn is_identity(&self) -> bool {
        self.name().eq_ignore_ascii_case(IDENTITY)
    }
}

/// Encodings known locally, keyed by lowercase name
#[derive(Clone, Default)]
pub struct EncodingMap {
    map: HashMap<String, Arc<dyn Encoding>>,
}

impl EncodingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an encoding, returning the one it replaced
    pub fn insert(&mut self, encoding: Arc<dyn Encoding>) -> Option<Arc<dyn Encoding>> {
        self.map
            .insert(encoding.name().to_ascii_lowercase(), encoding)
    }

    /// Look up an encoding by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<Arc<dyn Encoding>> {
        self.map.get(&name.trim().to_ascii_lowercase()).cloned()
    }

    /// Registered names, lowercase, in no particular order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for EncodingMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.map.keys().collect();
        names.sort();
        f.debug_struct("EncodingMap").field("encodings", &names).finish()
    }
}
