use crate::policy::CompiledPolicy;
use tracing::warn;

/// Holds the serialized form of the last policy document applied to the backend.
///
/// Documents are compared by their exact JSON encoding. An empty cache never matches, so the first
/// document after startup (or after a failed push) is always pushed.
#[derive(Clone, Debug, Default)]
pub struct ConfigCache {
    applied: Option<Vec<u8>>,
}

impl ConfigCache {
    pub fn is_unchanged(&self, candidate: &CompiledPolicy) -> bool {
        let applied = match self.applied.as_ref() {
            Some(applied) => applied,
            None => return false,
        };
        match serde_json::to_vec(candidate) {
            Ok(bytes) => bytes == *applied,
            Err(error) => {
                warn!(%error, "Failed to serialize policy document");
                false
            }
        }
    }

    /// Records `applied` as the document currently held by the backend.
    pub fn update(&mut self, applied: &CompiledPolicy) {
        match serde_json::to_vec(applied) {
            Ok(bytes) => self.applied = Some(bytes),
            Err(error) => {
                warn!(%error, "Failed to serialize policy document");
                self.applied = None;
            }
        }
    }

    pub fn invalidate(&mut self) {
        self.applied = None;
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_none()
    }
}
