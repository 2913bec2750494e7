use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{DigestAlgorithm, HashError};

/// How strictly transfers validate content digests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashCheck {
    /// Never compute or compare digests.
    Never,
    /// Validate whatever the store reports; warn when it reports nothing usable.
    #[default]
    IfAvailable,
    /// Fail a transfer that cannot be validated.
    Required,
}

/// Outcome of a successful [`verify`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified(Vec<DigestAlgorithm>),
    Skipped,
}

/// Algorithms worth computing locally for an object whose store reports
/// `remote` digests.
pub fn select_algorithms(
    remote: &BTreeMap<String, String>,
    policy: HashCheck,
) -> Vec<DigestAlgorithm> {
    if policy == HashCheck::Never {
        return Vec::new();
    }
    let mut algs: Vec<DigestAlgorithm> = remote
        .keys()
        .filter_map(|name| DigestAlgorithm::from_name(name))
        .collect();
    algs.sort();
    algs.dedup();
    algs
}

/// Compares two encoded digests, ignoring surrounding whitespace and
/// quotes and ASCII case.
pub fn digests_match(a: &str, b: &str) -> bool {
    normalize(a).eq_ignore_ascii_case(normalize(b))
}

fn normalize(s: &str) -> &str {
    s.trim().trim_matches('"').trim()
}

/// Checks every algorithm present on both sides.
///
/// Mismatches are always errors. An object with nothing to compare is an
/// error only under [`HashCheck::Required`].
pub fn verify(
    object: &str,
    local: &BTreeMap<String, String>,
    remote: &BTreeMap<String, String>,
    policy: HashCheck,
) -> Result<Verification, HashError> {
    if policy == HashCheck::Never {
        return Ok(Verification::Skipped);
    }

    let mut checked = Vec::new();
    for (name, local_value) in local {
        let Some(alg) = DigestAlgorithm::from_name(name) else {
            continue;
        };
        let Some(remote_value) = remote
            .iter()
            .find(|(k, _)| DigestAlgorithm::from_name(k) == Some(alg))
            .map(|(_, v)| v)
        else {
            continue;
        };
        debug!(object, algorithm = %alg, local = %local_value, remote = %remote_value, "comparing digests");
        if !digests_match(local_value, remote_value) {
            return Err(HashError::Mismatch {
                object: object.to_string(),
                algorithm: alg,
                local: local_value.clone(),
                remote: remote_value.clone(),
            });
        }
        checked.push(alg);
    }

    if checked.is_empty() {
        if policy == HashCheck::Required {
            return Err(HashError::NoCommonDigest(object.to_string()));
        }
        warn!(object, "found no hashes to validate; integrity was not checked");
        return Ok(Verification::Skipped);
    }
    Ok(Verification::Verified(checked))
}
