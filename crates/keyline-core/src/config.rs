//! Session layer configuration.

use serde::{Deserialize, Serialize};

use crate::session::VersionRange;

/// Default minimum length of a padded plaintext (bytes).
pub const DEFAULT_MIN_PADDED_LEN: usize = 32;

/// Upper bound for [`Config::min_padded_len`]; one padding run is at most
/// 255 bytes.
pub const MAX_MIN_PADDED_LEN: usize = 255;

/// Configuration shared by the coder and the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Protocol versions offered in `Init` and accepted from peers
    pub versions: VersionRange,
    /// Plaintexts are padded to at least this many bytes
    pub min_padded_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { versions: VersionRange::SUPPORTED, min_padded_len: DEFAULT_MIN_PADDED_LEN }
    }
}

impl Config {
    /// Clamp out-of-range values.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self { min_padded_len: self.min_padded_len.min(MAX_MIN_PADDED_LEN), ..self }
    }
}
