//! Jobs, results and login parameters exchanged with pools.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Algorithm identifier as spoken on the wire (e.g. `rx/0`, `sha256d`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Algorithm(String);

impl Algorithm {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Algorithm {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Immutable unit of work issued by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Pool-assigned job identifier
    pub id: String,

    /// Algorithm the job must be hashed with
    pub algorithm: Algorithm,

    /// Share difficulty derived from the pool target
    pub diff: u64,

    /// Block height (0 when the pool doesn't report it)
    pub height: u64,

    /// Seed material for algorithms that need it (empty otherwise)
    pub seed_hash: Vec<u8>,

    /// Hashing blob
    pub blob: Vec<u8>,
}

impl Job {
    /// Parse a job object from a direct-login pool (`login` result or `job`
    /// notification).
    ///
    /// `fallback` is used when the pool omits `algo`, which older pools do.
    pub fn from_login_json(value: &Value, fallback: Option<&Algorithm>) -> Result<Self, String> {
        let obj = value.as_object().ok_or("job not an object")?;

        let id = obj
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or("job_id missing")?
            .to_string();

        if id.is_empty() {
            return Err("job_id empty".to_string());
        }

        let blob_str = obj.get("blob").and_then(Value::as_str).ok_or("blob missing")?;
        let blob = hex::decode(blob_str).map_err(|e| format!("blob hex: {}", e))?;

        let target_str = obj
            .get("target")
            .and_then(Value::as_str)
            .ok_or("target missing")?;
        let diff = difficulty_from_target_hex(target_str)?;

        let algorithm = match obj.get("algo").and_then(Value::as_str) {
            Some(name) => Algorithm::new(name),
            None => fallback.cloned().ok_or("algo missing")?,
        };

        let height = obj.get("height").and_then(Value::as_u64).unwrap_or(0);

        let seed_hash = match obj.get("seed_hash").and_then(Value::as_str) {
            Some(seed) => hex::decode(seed).map_err(|e| format!("seed_hash hex: {}", e))?,
            None => Vec::new(),
        };

        Ok(Self {
            id,
            algorithm,
            diff,
            height,
            seed_hash,
            blob,
        })
    }
}

/// Convert a little-endian pool target (4 or 8 bytes of hex) to difficulty.
///
/// Compact 4-byte targets cover the top 32 bits of the 64-bit target, so
/// difficulty is `0xffffffff / target` for those and `u64::MAX / target`
/// for full-width ones.
pub fn difficulty_from_target_hex(hex_target: &str) -> Result<u64, String> {
    let bytes = hex::decode(hex_target).map_err(|e| format!("target hex: {}", e))?;

    match bytes.len() {
        4 => {
            let target = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if target == 0 {
                return Err("target is zero".to_string());
            }
            Ok(u64::from(u32::MAX) / u64::from(target))
        }
        8 => {
            let mut le = [0u8; 8];
            le.copy_from_slice(&bytes);
            let target = u64::from_le_bytes(le);
            if target == 0 {
                return Err("target is zero".to_string());
            }
            Ok(u64::MAX / target)
        }
        n => Err(format!("target wrong length: {}", n)),
    }
}

/// Solved work produced by a worker, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: String,
    pub nonce: u32,
    pub result: [u8; 32],
    pub algorithm: Option<Algorithm>,
}

impl JobResult {
    /// Parameters for a direct-login `submit` request.
    pub fn to_login_json(&self, session_id: &str) -> Value {
        let mut params = serde_json::json!({
            "id": session_id,
            "job_id": self.job_id,
            "nonce": hex::encode(self.nonce.to_le_bytes()),
            "result": hex::encode(self.result),
        });

        if let Some(algorithm) = &self.algorithm {
            params["algo"] = Value::String(algorithm.name().to_string());
        }

        params
    }
}

/// Pool verdict on a submitted result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    /// Submission id returned by [`Session::submit`](crate::session::Session::submit)
    pub id: u64,

    pub job_id: String,

    /// Time between submission and the pool's reply
    pub elapsed: Duration,
}

/// Extra fields merged into a direct-login `login` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LoginParams {
    /// Own connection to a pool: advertise algorithms and current job shape.
    Pool {
        algo: Vec<Algorithm>,
        diff: u64,
        height: u64,
        #[serde(skip_serializing_if = "String::is_empty")]
        seed_hash: String,
    },

    /// Tunnel through a proxy that supports the `connect` extension: tell it
    /// where to forward.
    Tunnel { url: String },
}

impl LoginParams {
    /// Build pool parameters with `negotiated` at the head of the list.
    ///
    /// The negotiated algorithm swaps places with whatever was first, which
    /// leaves the rest of the list in its original order. When it isn't in
    /// the list at all it is inserted at the front.
    pub fn pool(
        supported: &[Algorithm],
        negotiated: Option<&Algorithm>,
        diff: u64,
        height: u64,
        seed_hash: &[u8],
    ) -> Self {
        let mut algo = supported.to_vec();

        if let Some(negotiated) = negotiated {
            match algo.iter().position(|a| a == negotiated) {
                Some(i) => algo.swap(0, i),
                None => algo.insert(0, negotiated.clone()),
            }
        }

        LoginParams::Pool {
            algo,
            diff,
            height,
            seed_hash: hex::encode(seed_hash),
        }
    }

    pub fn tunnel(url: impl Into<String>) -> Self {
        LoginParams::Tunnel { url: url.into() }
    }

    /// Serialize to a JSON object for merging into the login request.
    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}
