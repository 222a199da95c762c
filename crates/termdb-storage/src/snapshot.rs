//! Engine snapshots.
//!
//! ```text
//! ┌──────┬─────────┬──────────┬──────────┬─────────────────────┐
//! │ TMDB │ version │ last seq │ body len │ bincode(Engine)     │
//! │ 4 B  │ u32 LE  │ u64 LE   │ u64 LE   │ taxonomy + facts    │
//! └──────┴─────────┴──────────┴──────────┴─────────────────────┘
//! ```
//!
//! `last seq` is the newest log entry folded into the engine; replay skips
//! everything up to and including it.

use anyhow::{anyhow, Result};
use termdb_core::Engine;

const MAGIC: &[u8; 4] = b"TMDB";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 24;

/// A decoded snapshot.
#[derive(Debug)]
pub struct Snapshot {
    pub engine: Engine,
    pub last_seq: u64,
}

/// Serialize the whole engine, stamped with the last log entry it contains.
pub fn encode(engine: &Engine, last_seq: u64) -> Result<Vec<u8>> {
    let body = bincode::serialize(engine)?;

    let mut result = Vec::with_capacity(HEADER_LEN + body.len());
    result.extend_from_slice(MAGIC);
    result.extend_from_slice(&VERSION.to_le_bytes());
    result.extend_from_slice(&last_seq.to_le_bytes());
    result.extend_from_slice(&(body.len() as u64).to_le_bytes());
    result.extend_from_slice(&body);
    Ok(result)
}

/// Deserialize a snapshot written by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
        return Err(anyhow!("Invalid termdb snapshot"));
    }

    let version = u32::from_le_bytes(bytes[4..8].try_into()?);
    if version != VERSION {
        return Err(anyhow!("Unsupported snapshot version: {}", version));
    }

    let last_seq = u64::from_le_bytes(bytes[8..16].try_into()?);
    let body_len = u64::from_le_bytes(bytes[16..24].try_into()?);
    let body = usize::try_from(body_len)
        .ok()
        .and_then(|len| HEADER_LEN.checked_add(len))
        .and_then(|end| bytes.get(HEADER_LEN..end))
        .ok_or_else(|| anyhow!("Truncated snapshot: expected {} body bytes", body_len))?;
    Ok(Snapshot {
        engine: bincode::deserialize(body)?,
        last_seq,
    })
}
