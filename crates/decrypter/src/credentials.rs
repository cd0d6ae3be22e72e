use bytes::Bytes;

/// A stored hash paired with the plaintext candidate to check against it.
///
/// Both halves are cheap to clone ([`Bytes`] is reference counted), so a
/// `Credentials` value can be handed to a worker without copying the
/// underlying buffers. The `Debug` impl never prints the candidate.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    stored_hash: Bytes,
    candidate: Bytes,
}

impl Credentials {
    pub fn new(stored_hash: impl Into<Bytes>, candidate: impl Into<Bytes>) -> Self {
        Self {
            stored_hash: stored_hash.into(),
            candidate: candidate.into(),
        }
    }

    pub fn stored_hash(&self) -> &[u8] {
        &self.stored_hash
    }

    pub fn candidate(&self) -> &[u8] {
        &self.candidate
    }
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("stored_hash", &String::from_utf8_lossy(&self.stored_hash))
            .field("candidate", &"<redacted>")
            .finish()
    }
}
