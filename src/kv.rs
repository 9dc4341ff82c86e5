//! Untyped key-value metadata operations.
//!
//! Entities and groups both carry a free-form string map next to their
//! typed metadata. Clients manage it through a single verb with four
//! modes; reads with the key `"*"` dump the whole map as `"k:v"` lines
//! in key order.

use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown untyped metadata mode '{0}'")]
pub struct UnknownKvMode(pub String);

/// Operation to apply to an untyped metadata map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvMode {
    /// Insert the pair, overwriting any existing value for the key.
    Upsert,
    /// Return the pair for the key, or every pair for `"*"`.
    Read,
    /// Remove every pair whose key matches the glob.
    ClearFuzzy,
    /// Remove exactly the named key.
    ClearExact,
}

impl KvMode {
    pub fn mutates(&self) -> bool {
        !matches!(self, KvMode::Read)
    }
}

impl FromStr for KvMode {
    type Err = UnknownKvMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "upsert" => Ok(KvMode::Upsert),
            "read" => Ok(KvMode::Read),
            "clear-fuzzy" | "clearfuzzy" => Ok(KvMode::ClearFuzzy),
            "clear-exact" | "clearexact" => Ok(KvMode::ClearExact),
            other => Err(UnknownKvMode(other.to_string())),
        }
    }
}

/// Apply `mode` to `map`, returning the affected pairs as `"k:v"` strings.
///
/// Output ordering is stable: `BTreeMap` iteration is already sorted by
/// key. Mutating modes return the pairs they touched so callers can echo
/// them back to the client.
pub fn manage(map: &mut BTreeMap<String, String>, mode: KvMode, key: &str, value: &str) -> Vec<String> {
    match mode {
        KvMode::Upsert => {
            map.insert(key.to_string(), value.to_string());
            vec![format_pair(key, value)]
        }
        KvMode::Read => {
            if key == "*" {
                map.iter().map(|(k, v)| format_pair(k, v)).collect()
            } else {
                map.get(key).map(|v| vec![format_pair(key, v)]).unwrap_or_default()
            }
        }
        KvMode::ClearFuzzy => {
            let doomed: Vec<String> = map
                .keys()
                .filter(|k| glob_match(key, k))
                .cloned()
                .collect();
            doomed
                .iter()
                .filter_map(|k| map.remove(k).map(|v| format_pair(k, &v)))
                .collect()
        }
        KvMode::ClearExact => map
            .remove(key)
            .map(|v| vec![format_pair(key, &v)])
            .unwrap_or_default(),
    }
}

fn format_pair(key: &str, value: &str) -> String {
    format!("{}:{}", key, value)
}

/// Minimal glob matcher supporting `*` (any run of characters) and `?`
/// (any single character). Everything else matches literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some('?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}
