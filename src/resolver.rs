//! Key resolution against a bucket, with wildcard version matching.
//!
//! ```text
//! heroku-18/libraries/sqlite-3.30.1.tar.gz   exact lookup
//! heroku-18/libraries/sqlite-3.*.tar.gz      newest sqlite-3.x present
//! ```

use glob::{MatchOptions, Pattern};
use tracing::debug;

use crate::storage::{Bucket, ObjectRef, StorageError};
use crate::version;

const WILDCARD: char = '*';

/// Resolve `key_pattern` in `bucket`.
///
/// Without a `*`, this is a plain existence check and never lists the
/// bucket. With one, everything under the text before the first `*` is
/// listed, filtered with shell glob semantics against the whole pattern, and
/// the highest key in version order wins. `Ok(None)` means nothing matched;
/// storage failures are returned as errors.
pub fn resolve(
    bucket: &dyn Bucket,
    key_pattern: &str,
) -> Result<Option<ObjectRef>, StorageError> {
    let Some((prefix, _)) = key_pattern.split_once(WILDCARD) else {
        return bucket.head(key_pattern);
    };

    let pattern = Pattern::new(&collapse_wildcards(key_pattern)).map_err(|_| {
        StorageError::InvalidKey {
            key: key_pattern.to_string(),
        }
    })?;
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };

    let candidates = bucket.list(prefix)?;
    debug!(
        "{} candidate(s) under '{}' in bucket '{}'",
        candidates.len(),
        prefix,
        bucket.name()
    );

    Ok(candidates
        .into_iter()
        .filter(|object| pattern.matches_with(&object.key, options))
        .max_by(|a, b| version::compare(&a.key, &b.key)))
}

/// Squeeze each run of `*` into one. `glob` only accepts `**` as a whole
/// path component, and a run of stars matches the same keys as one star.
fn collapse_wildcards(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if ch == WILDCARD && out.ends_with(WILDCARD) {
            continue;
        }
        out.push(ch);
    }
    out
}
