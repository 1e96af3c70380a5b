//! Identifier validation for table and column names.
//!
//! Every dynamic identifier goes through [`quote`] before it is placed in
//! SQL text. Accepted identifiers match
//! `^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)?$` and are at most
//! [`MAX_IDENTIFIER_LEN`] characters; they are emitted double-quoted.

use std::collections::BTreeSet;
use strata_types::DataError;

pub const MAX_IDENTIFIER_LEN: usize = 63;

fn valid_part(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Checks `raw` against the identifier grammar.
///
/// # Errors
///
/// Returns `DataError::Validation` naming the offending identifier.
pub fn validate(raw: &str) -> Result<(), DataError> {
    let invalid = |reason: &str| DataError::Validation(format!("invalid identifier {raw:?}: {reason}"));

    if raw.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid("longer than 63 characters"));
    }
    let mut parts = raw.splitn(2, '.');
    let head = parts.next().unwrap_or_default();
    if !valid_part(head) {
        return Err(invalid("must start with a letter and contain only letters, digits and underscores"));
    }
    if let Some(tail) = parts.next() {
        if !valid_part(tail) {
            return Err(invalid("qualified name must be schema.name"));
        }
    }
    Ok(())
}

/// Validates `raw` and returns it double-quoted, part by part.
///
/// ```
/// assert_eq!(strata_data::ident::quote("main.users").unwrap(), r#""main"."users""#);
/// ```
///
/// # Errors
///
/// See [`validate`].
pub fn quote(raw: &str) -> Result<String, DataError> {
    validate(raw)?;
    Ok(raw
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join("."))
}

/// Which entities the data service may touch.
///
/// The default policy allows any entity whose name passes [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPolicy {
    allowed: Option<BTreeSet<String>>,
}

impl EntityPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Restricts access to exactly the listed entities.
    pub fn only<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(entities.into_iter().map(Into::into).collect()),
        }
    }

    /// Validates `entity` and returns its quoted form.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Validation` if the name is malformed or not on the
    /// allow-list.
    pub fn entity(&self, entity: &str) -> Result<String, DataError> {
        let quoted = quote(entity)?;
        match &self.allowed {
            Some(allowed) if !allowed.contains(entity) => Err(DataError::Validation(format!(
                "entity {entity:?} is not allowed"
            ))),
            _ => Ok(quoted),
        }
    }
}
