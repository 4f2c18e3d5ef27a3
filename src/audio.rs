//! Maps dialed extensions to the audio that should be played to them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::rtp::SAMPLES_PER_PACKET;

/// External collaborator: given an extension string extracted from a
/// Request-URI, produce the mu-law audio buffer to stream to the caller.
pub trait AudioRouter: Send + Sync {
    /// Looks up audio for `extension`. `None` means "no such extension",
    /// which the dispatcher turns into a 404.
    fn lookup(&self, extension: &str) -> Option<Arc<[u8]>>;
}

/// In-memory router backed by a fixed table, built once at startup.
pub struct StaticAudioRouter {
    table: HashMap<String, Arc<[u8]>>,
}

impl StaticAudioRouter {
    pub fn new() -> Self {
        Self { table: HashMap::new() }
    }

    /// Registers `extension`, truncating `samples` to a whole number of
    /// 20ms packets. A buffer that isn't already a multiple of
    /// `SAMPLES_PER_PACKET` is tolerated by dropping the trailing remainder
    /// rather than padding or rejecting it.
    pub fn register(&mut self, extension: impl Into<String>, samples: Vec<u8>) {
        let whole_packets = samples.len() / SAMPLES_PER_PACKET;
        let mut truncated = samples;
        truncated.truncate(whole_packets * SAMPLES_PER_PACKET);
        self.table.insert(extension.into(), Arc::from(truncated));
    }
}

impl Default for StaticAudioRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioRouter for StaticAudioRouter {
    fn lookup(&self, extension: &str) -> Option<Arc<[u8]>> {
        self.table.get(extension).cloned()
    }
}
