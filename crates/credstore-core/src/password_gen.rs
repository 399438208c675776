//! Random password generation for new accounts and databases.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use thiserror::Error;

pub const DIGITS: &str = "0123456789";
pub const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
pub const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("at least one character class must be selected")]
    NoClasses,
    #[error("length {length} cannot fit one character from each of {classes} classes")]
    TooShort { length: usize, classes: usize },
}

/// Which character classes a generated password must draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharClasses {
    pub digits: bool,
    pub lower: bool,
    pub upper: bool,
    pub punctuation: bool,
}

impl Default for CharClasses {
    fn default() -> Self {
        Self {
            digits: true,
            lower: true,
            upper: true,
            punctuation: true,
        }
    }
}

impl CharClasses {
    fn selected(&self) -> Vec<&'static [u8]> {
        [
            (self.digits, DIGITS),
            (self.lower, LOWER),
            (self.upper, UPPER),
            (self.punctuation, PUNCTUATION),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, chars)| chars.as_bytes())
        .collect()
    }
}

/// Generates a password of `length` characters containing at least one
/// character of every selected class.
pub fn generate_password(length: usize, classes: CharClasses) -> Result<String, GenerateError> {
    let selected = classes.selected();
    if selected.is_empty() {
        return Err(GenerateError::NoClasses);
    }
    if length < selected.len() {
        return Err(GenerateError::TooShort {
            length,
            classes: selected.len(),
        });
    }

    let mut rng = OsRng;
    let pool: Vec<u8> = selected.iter().flat_map(|chars| chars.iter().copied()).collect();
    // One guaranteed pick per class, the rest from the whole pool, then shuffle.
    let mut password: Vec<u8> = selected
        .iter()
        .filter_map(|chars| chars.choose(&mut rng).copied())
        .collect();
    while password.len() < length {
        if let Some(c) = pool.choose(&mut rng) {
            password.push(*c);
        }
    }
    password.shuffle(&mut rng);
    Ok(password.into_iter().map(char::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_any(password: &str, chars: &str) -> bool {
        password.chars().any(|c| chars.contains(c))
    }

    #[test]
    fn every_class_is_represented() {
        for _ in 0..50 {
            let password = generate_password(8, CharClasses::default()).unwrap();
            assert_eq!(password.len(), 8);
            for chars in [DIGITS, LOWER, UPPER, PUNCTUATION] {
                assert!(contains_any(&password, chars), "{password} misses {chars}");
            }
        }
    }

    #[test]
    fn disabled_classes_are_absent() {
        let classes = CharClasses {
            digits: true,
            lower: false,
            upper: false,
            punctuation: false,
        };
        let password = generate_password(32, classes).unwrap();
        assert!(password.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn impossible_requests_are_rejected() {
        let none = CharClasses {
            digits: false,
            lower: false,
            upper: false,
            punctuation: false,
        };
        assert_eq!(generate_password(10, none), Err(GenerateError::NoClasses));
        assert_eq!(
            generate_password(3, CharClasses::default()),
            Err(GenerateError::TooShort {
                length: 3,
                classes: 4
            })
        );
    }
}
