//! Unresolved job placeholders.
//!
//! Env values may reference outputs of other jobs as `{{.job.<name>.<output>}}`.
//! The workflow renders them before jobs run; whatever is still a bare
//! placeholder at prepare time refers to something that never produced a
//! value and must not reach the executor verbatim.

use regex::Regex;
use shipyard_core::job::KeyVal;
use std::sync::LazyLock;

static JOB_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\{\{\.job.*\}\}$").unwrap());

/// Whether the whole value is an unrendered `{{.job...}}` placeholder.
pub fn is_unresolved(value: &str) -> bool {
    JOB_PLACEHOLDER.is_match(value)
}

/// Blank every env value that is still an unresolved placeholder.
/// Returns the keys that were blanked.
pub fn blank_unresolved(envs: &mut [KeyVal]) -> Vec<String> {
    envs.iter_mut()
        .filter(|env| is_unresolved(&env.value))
        .map(|env| {
            env.value.clear();
            env.key.clone()
        })
        .collect()
}
