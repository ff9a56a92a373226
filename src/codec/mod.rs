//! Payload codecs
//!
//! A codec turns one buffer into a list of independently decodable segments
//! and back. Codecs are identified on the wire by a 32-bit token; token `0`
//! means the payload is raw. The [`CodecRegistry`] maps names (configuration)
//! and tokens (wire) to codec factories.
//!
//! Whether compression is attempted at all is decided per receiver set by the
//! [`CompressionPolicy`] predicate on link bandwidth.

mod rle;
#[cfg(feature = "compression")]
mod zstd_codec;

pub use rle::RleCodec;
#[cfg(feature = "compression")]
pub use zstd_codec::ZstdCodec;

use crate::connection::ConnectionDescription;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wire identifier of a codec.
pub type CodecToken = u32;

/// Raw payload.
pub const TOKEN_NONE: CodecToken = 0;
pub const TOKEN_RLE: CodecToken = 1;
pub const TOKEN_ZSTD: CodecToken = 2;

/// Segment size used by the built-in segmenting codecs.
pub const SEGMENT_SIZE_MAX: usize = 64 * 1024;

/// Default bandwidth threshold: 2 Gbit/s in KB/s.
pub const DEFAULT_BANDWIDTH_THRESHOLD_KBS: u64 = 262_144;

#[derive(Debug)]
pub enum CodecError {
    /// No codec registered for the token
    UnknownToken(CodecToken),
    /// No codec registered under the name
    UnknownName(String),
    /// Compressed data is malformed
    Corrupt(String),
    /// Decoded size differs from the declared size
    SizeMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::UnknownToken(t) => write!(f, "Unknown codec token: {}", t),
            CodecError::UnknownName(n) => write!(f, "Unknown codec: {}", n),
            CodecError::Corrupt(msg) => write!(f, "Corrupt compressed data: {}", msg),
            CodecError::SizeMismatch { expected, actual } => {
                write!(f, "Decoded size mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// A stateful compressor/decompressor.
pub trait Codec: Send {
    fn token(&self) -> CodecToken;
    fn name(&self) -> &'static str;

    /// Compress `input` into one or more segments, each covering at most
    /// [`SEGMENT_SIZE_MAX`] input bytes.
    fn compress(&mut self, input: &[u8]) -> Result<Vec<Vec<u8>>, CodecError>;

    /// Decode all segments of one chunk into `uncompressed_size` bytes.
    fn decompress(&mut self, segments: &[&[u8]], uncompressed_size: usize)
        -> Result<Vec<u8>, CodecError>;
}

/// Factory producing a fresh codec instance.
pub type CodecFactory = fn() -> Box<dyn Codec>;

struct Registration {
    name: &'static str,
    token: CodecToken,
    factory: CodecFactory,
}

/// Name and token lookup of available codecs.
pub struct CodecRegistry {
    entries: Vec<Registration>,
}

impl CodecRegistry {
    /// Registry with the codecs compiled into this build.
    pub fn builtin() -> Self {
        let mut registry = CodecRegistry {
            entries: Vec::new(),
        };
        registry.register("rle", TOKEN_RLE, || Box::new(RleCodec::new()) as Box<dyn Codec>);
        #[cfg(feature = "compression")]
        registry.register("zstd", TOKEN_ZSTD, || Box::new(ZstdCodec::new(3)) as Box<dyn Codec>);
        registry
    }

    /// Shared builtin registry.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::builtin())
    }

    /// Register (or replace) a codec.
    pub fn register(&mut self, name: &'static str, token: CodecToken, factory: CodecFactory) {
        debug_assert_ne!(token, TOKEN_NONE, "token 0 is reserved for raw payloads");
        self.entries.retain(|e| e.name != name && e.token != token);
        self.entries.push(Registration {
            name,
            token,
            factory,
        });
    }

    /// Look up a codec by configuration name. `"none"` yields `Ok(None)`.
    pub fn choose(&self, name: &str) -> Result<Option<Box<dyn Codec>>, CodecError> {
        if name.is_empty() || name == "none" {
            return Ok(None);
        }
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Some((e.factory)()))
            .ok_or_else(|| CodecError::UnknownName(name.to_string()))
    }

    /// Look up a codec by wire token.
    pub fn by_token(&self, token: CodecToken) -> Result<Box<dyn Codec>, CodecError> {
        self.entries
            .iter()
            .find(|e| e.token == token)
            .map(|e| (e.factory)())
            .ok_or(CodecError::UnknownToken(token))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Compression settings as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Codec name (`none`, `rle`, `zstd`)
    pub codec: String,
    /// Compress only when every receiver's link is at or below this (KB/s)
    pub bandwidth_threshold_kbs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            codec: "rle".to_string(),
            bandwidth_threshold_kbs: DEFAULT_BANDWIDTH_THRESHOLD_KBS,
        }
    }
}

/// Decides whether compression is worth attempting for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub bandwidth_threshold_kbs: u64,
}

impl CompressionPolicy {
    /// Always attempt compression.
    pub const ALWAYS: CompressionPolicy = CompressionPolicy {
        bandwidth_threshold_kbs: u64::MAX,
    };
    /// Never attempt compression.
    pub const NEVER: CompressionPolicy = CompressionPolicy {
        bandwidth_threshold_kbs: 0,
    };

    pub fn from_config(config: &CompressionConfig) -> Self {
        CompressionPolicy {
            bandwidth_threshold_kbs: config.bandwidth_threshold_kbs,
        }
    }

    #[inline]
    pub fn should_compress(&self, description: &ConnectionDescription) -> bool {
        description.effective_bandwidth() <= self.bandwidth_threshold_kbs
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        CompressionPolicy {
            bandwidth_threshold_kbs: DEFAULT_BANDWIDTH_THRESHOLD_KBS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;

    #[test]
    fn test_choose_by_name_and_token() {
        let registry = CodecRegistry::builtin();
        assert!(registry.choose("none").unwrap().is_none());
        let rle = registry.choose("rle").unwrap().unwrap();
        assert_eq!(rle.token(), TOKEN_RLE);
        assert_eq!(registry.by_token(TOKEN_RLE).unwrap().name(), "rle");
        assert!(matches!(
            registry.choose("lzma"),
            Err(CodecError::UnknownName(_))
        ));
        assert!(matches!(
            registry.by_token(99),
            Err(CodecError::UnknownToken(99))
        ));
    }

    #[test]
    fn test_policy_threshold() {
        let policy = CompressionPolicy::default();
        let tcp = ConnectionDescription::tcp("h", 1);
        let pair = ConnectionDescription::new(ConnectionType::ConnectionPair);
        assert!(policy.should_compress(&tcp));
        assert!(!policy.should_compress(&pair));
        assert!(CompressionPolicy::ALWAYS.should_compress(&pair));
        assert!(!CompressionPolicy::NEVER.should_compress(&tcp));
    }
}
