use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

use miette::{Diagnostic, SourceSpan};
use regex::Regex;
use thiserror::Error;

static PART_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{L}\p{N}_.\-]{1,64}$").unwrap());

/// Stable two-part name of a servant, unique across the cache and the
/// backing store.
///
/// The category groups servants sharing a factory/store (e.g. `"account"`),
/// the name picks one servant within the category. Both parts are validated
/// on construction and never change afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    category: String,
    name: String,
}

#[derive(Error, Diagnostic, Debug)]
pub enum IdentityError {
    #[error("invalid identity part {part:?}")]
    #[diagnostic(help("parts are 1-64 letters, digits, '_', '.' or '-'"))]
    InvalidPart { part: String },

    #[error("malformed identity string")]
    #[diagnostic(help("expected the form category/name"))]
    Malformed {
        #[source_code]
        input: String,
        #[label("here")]
        at: SourceSpan,
    },
}

impl Identity {
    pub fn new(category: &str, name: &str) -> Result<Self, IdentityError> {
        for part in [category, name] {
            if !PART_REGEX.is_match(part) {
                return Err(IdentityError::InvalidPart {
                    part: part.to_string(),
                });
            }
        }
        Ok(Self {
            category: category.to_string(),
            name: name.to_string(),
        })
    }

    pub fn category(&self) -> &str {
        self.category.as_str()
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

impl TryFrom<&str> for Identity {
    type Error = IdentityError;

    /// Parses the `category/name` display form.
    fn try_from(input: &str) -> Result<Self, Self::Error> {
        let Some((category, name)) = input.split_once('/') else {
            return Err(IdentityError::Malformed {
                input: input.to_string(),
                at: (0, input.len()).into(),
            });
        };
        if name.contains('/') {
            let offset = category.len() + 1 + name.find('/').unwrap();
            return Err(IdentityError::Malformed {
                input: input.to_string(),
                at: (offset, 1).into(),
            });
        }
        Self::new(category, name)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}
