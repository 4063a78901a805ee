//! Artifact persistence: `dump_data` / `load_data`.
//!
//! Every artifact is a `bincode` envelope holding the format version, the
//! artifact kind, a SHA-256 of the payload and the payload itself (the
//! `bincode` encoding of the value). Loading checks all three before the
//! payload is decoded.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ArtifactError;

/// Current envelope format version.
pub const FORMAT_VERSION: u32 = 1;

/// A value that can be dumped to and loaded from disk.
pub trait Artifact: Serialize + DeserializeOwned {
    /// Stable name stored in the envelope.
    const KIND: &'static str;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    kind: String,
    checksum: String,
    payload: Vec<u8>,
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serializes `obj` to `out_file`, creating parent directories.
pub fn dump_data<T: Artifact>(obj: &T, out_file: &Path) -> Result<(), ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: out_file.to_path_buf(),
        source,
    };

    let payload = bincode::serialize(obj).map_err(|e| ArtifactError::Encode(e.to_string()))?;
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        kind: T::KIND.to_string(),
        checksum: checksum(&payload),
        payload,
    };
    let bytes = bincode::serialize(&envelope).map_err(|e| ArtifactError::Encode(e.to_string()))?;

    if let Some(parent) = out_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(out_file, &bytes).map_err(io_err)?;

    info!(
        "Dumped {} ({} bytes) to {}",
        T::KIND,
        bytes.len(),
        out_file.display()
    );
    Ok(())
}

/// Deserializes a value previously written by [`dump_data`].
pub fn load_data<T: Artifact>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let envelope: Envelope =
        bincode::deserialize(&bytes).map_err(|e| ArtifactError::Decode(e.to_string()))?;

    if envelope.format_version != FORMAT_VERSION {
        return Err(ArtifactError::Version {
            found: envelope.format_version,
            expected: FORMAT_VERSION,
        });
    }
    if envelope.kind != T::KIND {
        return Err(ArtifactError::KindMismatch {
            found: envelope.kind,
            expected: T::KIND.to_string(),
        });
    }
    let computed = checksum(&envelope.payload);
    if computed != envelope.checksum {
        return Err(ArtifactError::Checksum {
            expected: envelope.checksum,
            computed,
        });
    }

    debug!("Loaded {} from {}", T::KIND, path.display());
    bincode::deserialize(&envelope.payload).map_err(|e| ArtifactError::Decode(e.to_string()))
}
