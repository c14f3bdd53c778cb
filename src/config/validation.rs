//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse approach: first deserialize the raw file into a
//! `toml::Value`, walk the key tree, compare against known field names, and
//! emit warnings with "did you mean?" suggestions. Then proceed with normal
//! serde deserialization. Warnings never break existing configs.

use std::collections::{BTreeSet, HashSet};

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Tables whose keys are user-chosen (attribute and tag maps).
const FREE_FORM_TABLES: &[&str] = &[
    "logging.attributes",
    "statsd.default_tags",
    "logging_attributes",
];

/// Returns the complete set of valid dotted key paths for `AgentConfig`.
///
/// Entries of `[[probes]]` and `[[remediations]]` share their array's prefix.
/// Any new field added to `AgentConfig` must be added here too.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // top level
        "startup_grace_seconds",
        "run_remediation_on_signal",
        "run_remediation_on_failure",
        "exit_after_remediation",
        // [logging]
        "logging",
        "logging.format",
        "logging.debug",
        "logging.attributes",
        // [server]
        "server",
        "server.enabled",
        "server.address",
        "server.port",
        "server.pretty_json",
        // [statsd]
        "statsd",
        "statsd.enabled",
        "statsd.address",
        "statsd.port",
        "statsd.prefix",
        "statsd.default_tags",
        // [[probes]]
        "probes",
        "probes.name",
        "probes.description",
        "probes.command",
        "probes.arguments",
        "probes.interval_seconds",
        "probes.allowed_failures",
        "probes.recovery_successes",
        // [[remediations]]
        "remediations",
        "remediations.name",
        "remediations.description",
        "remediations.command",
        "remediations.arguments",
        "remediations.max_retry",
        "remediations.retry_delay_seconds",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields
/// `["a", "a.b", "a.c"]`. Tables inside arrays are walked under the
/// array's own path. Free-form tables are reported but not descended.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = BTreeSet::new();
    collect_keys(value, prefix, &mut keys);
    keys.into_iter().collect()
}

fn collect_keys(value: &toml::Value, prefix: &str, keys: &mut BTreeSet<String>) {
    let Some(table) = value.as_table() else {
        return;
    };
    for (k, v) in table {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        keys.insert(path.clone());
        if FREE_FORM_TABLES.contains(&path.as_str()) {
            continue;
        }
        match v {
            toml::Value::Table(_) => collect_keys(v, &path, keys),
            toml::Value::Array(items) => {
                for item in items.iter().filter(|i| i.is_table()) {
                    collect_keys(item, &path, keys);
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
///
/// Ties resolve to the lexically smallest key so output is stable.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (levenshtein(unknown, k), *k))
        .filter(|(dist, _)| *dist <= 3)
        .min()
        .map(|(_, k)| k.to_string())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// This does NOT fail on unknown keys, it only warns. Parse errors are
/// reported later by serde.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    match raw_toml.parse::<toml::Value>() {
        Ok(value) => unknown_key_warnings(&value),
        Err(_) => Vec::new(),
    }
}

/// Same as [`validate_unknown_keys`] for an already-parsed document
/// (used for JSON configs converted to a `toml::Value`).
pub fn unknown_key_warnings(value: &toml::Value) -> Vec<ValidationWarning> {
    unknown_key_warnings_for(value, &known_config_keys())
}

/// Unknown-key warnings against an explicit key set.
pub fn unknown_key_warnings_for(
    value: &toml::Value,
    known: &HashSet<&str>,
) -> Vec<ValidationWarning> {
    walk_toml_keys(value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| {
            let suggestion = suggest_correction(&key, known);
            ValidationWarning {
                message: format!("Unknown config key '{key}'"),
                field: key,
                suggestion,
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
