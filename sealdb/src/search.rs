//! Equality search over blind-indexed columns.
//!
//! During a rotation window rows may be indexed under any active key, so a
//! search condition ORs one fragment per active key:
//!
//! ```text
//! (email_key_id = $1 AND email_idx = $2) OR (email_key_id = $3 AND email_idx = $4)
//! ```
//!
//! Each key binds two consecutive positional parameters. The column name is
//! interpolated into query text, so it must pass [`validate_identifier`].
//! Validation failures panic: they come from the caller's query code, not
//! from data.

use crate::blind_index::{self, BlindIndex, Normalizer};
use crate::error::Error;
use crate::vault::Vault;
use std::fmt::Write;

/// Highest positional parameter number the wire protocol can address.
pub const MAX_PARAMETER: usize = 65535;

/// Predicate emitted when the searched value is `NULL`.
pub const ALWAYS_FALSE: &str = "FALSE";

/// Suffix of the column holding the key id a row was indexed under.
pub const KEY_ID_COLUMN_SUFFIX: &str = "_key_id";

/// Suffix of the column holding the blind index.
pub const INDEX_COLUMN_SUFFIX: &str = "_idx";

/// One bound parameter of a [`SearchCondition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchParam {
    /// Key id compared against the key id column.
    KeyId(String),
    /// Digest compared against the blind index column.
    BlindIndex(BlindIndex),
}

/// A parameterized predicate and its arguments, in binding order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCondition {
    predicate: String,
    parameters: Vec<SearchParam>,
}

impl SearchCondition {
    /// Returns the SQL predicate with `$n` placeholders.
    #[must_use]
    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    /// Returns the parameters; element `i` binds to placeholder `offset + i`.
    #[must_use]
    pub fn parameters(&self) -> &[SearchParam] {
        &self.parameters
    }

    /// Consumes the condition, returning predicate and parameters.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<SearchParam>) {
        (self.predicate, self.parameters)
    }
}

/// Checks that `name` is safe to interpolate as an SQL identifier.
///
/// The first character must be an ASCII letter or underscore, the rest ASCII
/// alphanumerics or underscores.
///
/// # Errors
///
/// Returns `Error::InvalidColumnIdentifier` otherwise.
pub fn validate_identifier(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidColumnIdentifier(name.to_string()))
    }
}

/// Checks that `offset` and every parameter after it fit the protocol ceiling.
///
/// # Errors
///
/// Returns `Error::InvalidParameterOffset` unless
/// `1 <= offset` and `offset + 2 * key_count - 1 <= MAX_PARAMETER`.
pub fn validate_offset(offset: usize, key_count: usize) -> Result<(), Error> {
    let last = key_count
        .checked_mul(2)
        .and_then(|slots| offset.checked_add(slots))
        .and_then(|end| end.checked_sub(1));

    match last {
        Some(last) if offset >= 1 && offset <= MAX_PARAMETER && last <= MAX_PARAMETER => Ok(()),
        _ => Err(Error::InvalidParameterOffset { offset, key_count, max: MAX_PARAMETER }),
    }
}

impl Vault {
    /// Builds an equality condition on `column` matching rows indexed under any active key.
    ///
    /// Placeholders start at `$offset`. A `None` plaintext yields
    /// [`ALWAYS_FALSE`] with no parameters.
    ///
    /// # Panics
    ///
    /// Panics if the vault is closed, `column` is not a valid identifier, or
    /// the parameters would not fit between `offset` and [`MAX_PARAMETER`].
    ///
    /// # Example
    ///
    /// ```
    /// use sealdb::config::VaultConfig;
    /// use sealdb::key_registry::MemoryKeyRegistry;
    /// use sealdb::vault::Vault;
    ///
    /// let registry = MemoryKeyRegistry::new().with_key("v1", [1u8; 32]).with_key("v2", [2u8; 32]);
    /// let vault = Vault::new(&registry, VaultConfig::default()).unwrap();
    ///
    /// let condition = vault.build_condition("email", Some(b"alice@example.com"), 1);
    /// assert_eq!(
    ///     condition.predicate(),
    ///     "(email_key_id = $1 AND email_idx = $2) OR (email_key_id = $3 AND email_idx = $4)"
    /// );
    /// assert_eq!(condition.parameters().len(), 4);
    /// ```
    #[must_use]
    pub fn build_condition(
        &self,
        column: &str,
        plaintext: Option<&[u8]>,
        offset: usize,
    ) -> SearchCondition {
        let ring = self.default_ring();
        let key_ids = self.active_key_ids();

        let valid =
            validate_identifier(column).and_then(|()| validate_offset(offset, key_ids.len()));
        if let Err(e) = valid {
            panic!("sealdb: {e}");
        }

        let Some(plaintext) = plaintext else {
            return SearchCondition { predicate: ALWAYS_FALSE.to_string(), parameters: Vec::new() };
        };

        let mut predicate = String::new();
        let mut parameters = Vec::with_capacity(key_ids.len() * 2);

        for (i, key_id) in key_ids.iter().enumerate() {
            let keys = match ring.get(key_id) {
                Ok(keys) => keys,
                Err(e) => panic!("sealdb: {e}"),
            };
            let slot = offset + i * 2;

            if i > 0 {
                predicate.push_str(" OR ");
            }
            // Writing to a String cannot fail.
            let _ = write!(
                predicate,
                "({column}{KEY_ID_COLUMN_SUFFIX} = ${slot} AND {column}{INDEX_COLUMN_SUFFIX} = ${})",
                slot + 1
            );

            parameters.push(SearchParam::KeyId(key_id.clone()));
            parameters.push(SearchParam::BlindIndex(blind_index::compute(keys, plaintext)));
        }

        SearchCondition { predicate, parameters }
    }

    /// As [`Vault::build_condition`], normalizing the value first.
    ///
    /// # Panics
    ///
    /// As [`Vault::build_condition`].
    #[must_use]
    pub fn build_condition_str(
        &self,
        column: &str,
        plaintext: Option<&str>,
        normalizer: Normalizer,
        offset: usize,
    ) -> SearchCondition {
        drop(self.default_ring());
        let normalized = plaintext.map(|p| normalizer.apply(p));
        self.build_condition(column, normalized.as_deref().map(str::as_bytes), offset)
    }
}
