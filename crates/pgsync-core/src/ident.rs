//! Safe SQL identifier quoting.
//!
//! Every role, user, and database name that reaches [`crate::traits::DbGateway`]
//! is routed through [`quote_ident`] before it is interpolated into SQL text —
//! never by direct string interpolation. This is the only place in the
//! controller that builds executable SQL out of an identifier; password
//! values never go through here, they are always bind parameters.

use crate::error::ReconcileError;
use crate::model::ALLOWED_PRIVILEGES;

/// Double-quotes `name` for use as a SQL identifier, doubling any internal
/// double quotes. Always quotes, regardless of whether the input already
/// conforms to the bare-identifier grammar — there is exactly one code path
/// from Rust string to SQL identifier text.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validates and returns `keyword` unchanged if it is one of the documented
/// privilege keywords; privilege keywords are the one piece of user-adjacent
/// text emitted unquoted, so they may never flow through anything but this
/// allow-list check.
pub fn validate_privilege(keyword: &str) -> Result<&str, ReconcileError> {
    if ALLOWED_PRIVILEGES.contains(&keyword) {
        Ok(keyword)
    } else {
        Err(ReconcileError::DisallowedPrivilege {
            keyword: keyword.to_owned(),
        })
    }
}

/// Validates that `object` (a privilege-grant target, e.g. a schema name)
/// conforms to the same identifier grammar as usernames and roles. The
/// spec's open question about what a privilege key denotes is resolved by
/// rejecting anything that is not a bare identifier, rather than extending
/// the ambiguity (see SPEC_FULL.md §9).
pub fn validate_privilege_object(object: &str) -> Result<&str, ReconcileError> {
    use crate::model::UserRecord;
    if UserRecord::is_valid_identifier(object) {
        Ok(object)
    } else {
        Err(ReconcileError::InvalidPrivilegeObject {
            object: object.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_identifier() {
        assert_eq!(quote_ident("alice"), "\"alice\"");
    }

    #[test]
    fn escapes_internal_quotes() {
        assert_eq!(quote_ident("ali\"ce"), "\"ali\"\"ce\"");
    }

    #[test]
    fn quotes_identifiers_with_whitespace_or_semicolons() {
        assert_eq!(quote_ident("ali ce"), "\"ali ce\"");
        assert_eq!(quote_ident("ali;ce"), "\"ali;ce\"");
    }

    #[test]
    fn no_sql_keyword_injection_path() {
        // A malicious identifier embedding a statement terminator and a
        // second statement stays a single, inert quoted literal: the
        // trailing `--` and `DROP` become part of the identifier's text,
        // never executable syntax, because the quoter only ever doubles
        // embedded quotes — it does not stop escaping at `;` or `--`.
        let hostile = "x\"; DROP TABLE users; --";
        let quoted = quote_ident(hostile);
        assert_eq!(quoted, "\"x\"\"; DROP TABLE users; --\"");
        // Exactly two quote characters open/close the identifier; every
        // other `"` byte is doubled, so no unescaped quote terminates it
        // early.
        assert_eq!(quoted.matches('"').count() % 2, 0);
    }

    #[test]
    fn privilege_allow_list() {
        assert!(validate_privilege("USAGE").is_ok());
        assert!(validate_privilege("SELECT").is_ok());
        assert!(validate_privilege("DROP TABLE users").is_err());
    }

    #[test]
    fn privilege_object_must_be_bare_identifier() {
        assert!(validate_privilege_object("public").is_ok());
        assert!(validate_privilege_object("public; DROP TABLE x").is_err());
    }
}
