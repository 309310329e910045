use crate::error::{KeyError, KeyPart};

use hashbrown::HashSet;

use std::fmt::Display;

pub const DEFAULT_SEPARATOR: &str = "-";

/// Join a key type and its arguments into a cache key, e.g. `myType-3`.
///
/// Shorthand for [`KeyScheme::unprefixed`] followed by [`KeyScheme::derive`].
pub fn derive_key<I>(key_type: &str, args: I) -> Result<String, KeyError>
where
    I: IntoIterator,
    I::Item: Display,
{
    KeyScheme::unprefixed().derive(key_type, args)
}

/// Builds cache keys of the form `prefix-type-arg1-arg2`.
///
/// Every part is checked, a part that is empty or contains the separator is rejected
/// since `a-b` + `c` and `a` + `b-c` would otherwise share a key.
#[derive(Clone, Debug)]
pub struct KeyScheme {
    prefix: Option<String>,
    separator: String,
    key_types: Option<HashSet<String>>,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeyScheme {
            prefix: Some(prefix.into()),
            separator: DEFAULT_SEPARATOR.to_string(),
            key_types: None,
        }
    }

    pub fn unprefixed() -> Self {
        KeyScheme {
            prefix: None,
            separator: DEFAULT_SEPARATOR.to_string(),
            key_types: None,
        }
    }

    /// An empty separator makes every [`KeyScheme::derive`] fail with [`KeyError::EmptySeparator`].
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    /// Only accept these key types, anything else is a [`KeyError::UnknownKeyType`].
    pub fn with_key_types<I, T>(mut self, key_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.key_types = Some(key_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn derive<I>(&self, key_type: &str, args: I) -> Result<String, KeyError>
    where
        I: IntoIterator,
        I::Item: Display,
    {
        // nothing could be checked for ambiguity
        if self.separator.is_empty() {
            return Err(KeyError::EmptySeparator);
        }

        if let Some(key_types) = &self.key_types {
            if !key_types.contains(key_type) {
                return Err(KeyError::UnknownKeyType(key_type.to_string()));
            }
        }

        let mut key = String::new();

        if let Some(prefix) = &self.prefix {
            self.push_part(&mut key, KeyPart::Prefix, prefix)?;
        }
        self.push_part(&mut key, KeyPart::KeyType, key_type)?;

        for (idx, arg) in args.into_iter().enumerate() {
            self.push_part(&mut key, KeyPart::Argument(idx), &arg.to_string())?;
        }

        Ok(key)
    }

    fn push_part(&self, key: &mut String, part: KeyPart, value: &str) -> Result<(), KeyError> {
        if value.is_empty() {
            return Err(KeyError::EmptyPart(part));
        }

        if value.contains(self.separator.as_str()) {
            return Err(KeyError::AmbiguousPart {
                part,
                value: value.to_string(),
                separator: self.separator.clone(),
            });
        }

        if !key.is_empty() {
            key.push_str(&self.separator);
        }
        key.push_str(value);

        Ok(())
    }
}
