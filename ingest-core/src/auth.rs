// ingest-core/src/auth.rs
// Bearer token parsing and validation

use once_cell::sync::Lazy;
use regex::Regex;

/// Token shape: `sm_<tenant>_<issuance epoch>_<host>`. The tenant segment
/// carries no underscore; the host segment may.
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sm_([^_]+)_[0-9]+_(.+)$").expect("token pattern compiles"));

/// Identity parsed out of a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub tenant_id: String,
    pub host_id: String,
}

/// Parse a token without checking it against a claimed tenant.
pub fn parse_token(token: &str) -> Option<AuthToken> {
    let captures = TOKEN_RE.captures(token)?;
    Some(AuthToken {
        tenant_id: captures[1].to_string(),
        host_id: captures[2].to_string(),
    })
}

/// Validate a token against the tenant claimed on the auth request.
///
/// Returns the parsed identity, or the error message to hand back in the
/// auth response. Failures here are data, never transport errors.
pub fn authenticate(tenant_id: &str, token: &str) -> Result<AuthToken, &'static str> {
    match parse_token(token) {
        Some(parsed) if parsed.tenant_id == tenant_id => Ok(parsed),
        _ => Err("Invalid org_id or token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_token_parses() {
        let token = parse_token("sm_demo_1700000000_h1").unwrap();
        assert_eq!(token.tenant_id, "demo");
        assert_eq!(token.host_id, "h1");
    }

    #[test]
    fn host_segment_may_contain_underscores() {
        let token = parse_token("sm_acme_1700000000_db_primary_01").unwrap();
        assert_eq!(token.tenant_id, "acme");
        assert_eq!(token.host_id, "db_primary_01");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(parse_token("").is_none());
        assert!(parse_token("sm_demo_1700000000_").is_none()); // empty host
        assert!(parse_token("xx_demo_1700000000_h1").is_none()); // wrong prefix
        assert!(parse_token("sm_demo_h1").is_none()); // missing epoch
        assert!(parse_token("sm_demo_notanumber_h1").is_none());
    }

    #[test]
    fn authenticate_requires_tenant_match() {
        assert!(authenticate("demo", "sm_demo_1700000000_h1").is_ok());
        assert_eq!(
            authenticate("demo", "sm_acme_1700000000_h1"),
            Err("Invalid org_id or token")
        );
        assert_eq!(
            authenticate("demo", "invalid_token"),
            Err("Invalid org_id or token")
        );
    }
}
