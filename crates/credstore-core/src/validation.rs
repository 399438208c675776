//! Checks run before any file is touched.

use crate::error::{Result, StoreError};

const NAME_PUNCTUATION: &str = ".-_()";

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(c)
}

/// Drops every character that is not an ASCII letter, digit or one of `.-_()`.
pub fn sanitize_name(name: &str) -> String {
    name.chars().filter(|c| is_name_char(*c)).collect()
}

/// True when `name` can be used verbatim as a file stem.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && name.chars().all(is_name_char)
}

/// Sanitizes `name` and makes sure no database in `existing` already uses it.
/// Returns the cleaned name.
pub fn validate_new_name<'a, I>(name: &str, existing: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let cleaned = sanitize_name(name);
    if cleaned.is_empty() {
        return Err(StoreError::EmptyName);
    }
    if !is_valid_name(&cleaned) {
        return Err(StoreError::InvalidName(cleaned));
    }
    if existing.into_iter().any(|n| n == cleaned) {
        return Err(StoreError::NameTaken(cleaned));
    }
    Ok(cleaned)
}

/// Like [`validate_new_name`] but keeping the current name is allowed.
pub fn validate_rename<'a, I>(current: &str, name: &str, existing: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    if sanitize_name(name) == current {
        return Ok(current.to_string());
    }
    validate_new_name(name, existing)
}

pub fn validate_passwords(password: &str, confirmation: &str) -> Result<()> {
    if password.is_empty() {
        return Err(StoreError::EmptyPassword);
    }
    if password != confirmation {
        return Err(StoreError::PasswordMismatch);
    }
    Ok(())
}
