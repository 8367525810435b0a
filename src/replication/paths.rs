//! Allowed-path filters for filtered hubs
//!
//! A grant scopes a sink to a set of document-id paths:
//! - `users/1` matches exactly that id
//! - `users/*` matches every id starting with `users/`
//! - `*` is only legal as the final character, preceded by `/` or `-`

use std::collections::BTreeSet;

use super::errors::{ReplicationError, ReplicationResult};

/// Validate a set of allowed paths.
pub fn validate_paths(paths: &BTreeSet<String>, direction: &str) -> ReplicationResult<()> {
    for path in paths {
        validate_path(path).map_err(|reason| {
            ReplicationError::invalid_configuration(format!(
                "invalid {} path '{}': {}",
                direction, path, reason
            ))
        })?;
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), &'static str> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("path must not be empty");
    }
    if trimmed.len() != path.len() {
        return Err("path must not have surrounding whitespace");
    }
    match path.find('*') {
        None => Ok(()),
        Some(pos) if pos != path.len() - 1 => Err("'*' is only allowed at the end of a path"),
        Some(_) if path.len() == 1 => Err("a bare '*' would allow every document"),
        Some(pos) => match path.as_bytes()[pos - 1] {
            b'/' | b'-' => Ok(()),
            _ => Err("'*' must follow '/' or '-'"),
        },
    }
}

/// Check whether a document id is covered by a single path.
pub fn path_matches(path: &str, id: &str) -> bool {
    match path.strip_suffix('*') {
        Some(prefix) => starts_with_ignore_case(id, prefix),
        None => path.eq_ignore_ascii_case(id),
    }
}

/// Check whether a document id is covered by any of the allowed paths.
///
/// An empty set means the direction is unfiltered.
pub fn is_allowed(paths: &BTreeSet<String>, id: &str) -> bool {
    paths.is_empty() || paths.iter().any(|p| path_matches(p, id))
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
