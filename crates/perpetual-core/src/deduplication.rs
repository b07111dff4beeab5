//! Duplicate suppression during connection overlap
//!
//! While a channel rotates connections the upstream may deliver the same
//! logical message on every open link. The deduplicator tracks content
//! fingerprints and lets each one through exactly once until it is reset.

use core::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::message::Frame;
use crate::types::ConnectionId;

// ----------------------------------------------------------------------------
// Fingerprints
// ----------------------------------------------------------------------------

const TEXT_TAG: u8 = 0x01;
const BINARY_TAG: u8 = 0x02;

/// SHA-256 over the frame kind and payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a frame by content only
    pub fn of(frame: &Frame) -> Self {
        let mut hasher = Sha256::new();
        match frame {
            Frame::Text(text) => {
                hasher.update([TEXT_TAG]);
                hasher.update(text.as_bytes());
            }
            Frame::Binary(data) => {
                hasher.update([BINARY_TAG]);
                hasher.update(data);
            }
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Deduplicator
// ----------------------------------------------------------------------------

/// Counters kept by the deduplicator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub resets: u64,
    pub tracked: usize,
}

/// Exactly-once filter over frame fingerprints
#[derive(Debug, Default)]
pub struct MessageDeduplicator {
    /// Fingerprint to the connection that delivered it first
    seen: HashMap<Fingerprint, ConnectionId>,
    stats: DeduplicationStats,
}

impl MessageDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a fingerprint is seen since the last reset
    pub fn accept(&mut self, frame: &Frame, origin: ConnectionId) -> bool {
        let fingerprint = Fingerprint::of(frame);
        match self.seen.get(&fingerprint) {
            Some(first) => {
                trace!(%fingerprint, %origin, first = %first, "Duplicate frame dropped");
                self.stats.duplicates += 1;
                false
            }
            None => {
                self.seen.insert(fingerprint, origin);
                self.stats.accepted += 1;
                true
            }
        }
    }

    /// Connection that first delivered a frame, if it is tracked
    pub fn first_seen(&self, frame: &Frame) -> Option<ConnectionId> {
        self.seen.get(&Fingerprint::of(frame)).copied()
    }

    /// Forget every tracked fingerprint
    pub fn reset(&mut self) {
        if !self.seen.is_empty() {
            trace!(tracked = self.seen.len(), "Deduplicator reset");
        }
        self.seen.clear();
        self.stats.resets += 1;
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> DeduplicationStats {
        DeduplicationStats {
            tracked: self.seen.len(),
            ..self.stats.clone()
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
