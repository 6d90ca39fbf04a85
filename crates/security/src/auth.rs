/// Configured token value that refuses every request.
pub const DISABLED_TOKEN: &str = "!";

/// Check a request's `Authorization` header against a configured token.
///
/// An empty configured token admits everyone and [`DISABLED_TOKEN`] admits no
/// one. Any other token must arrive as `Bearer <token>`; the scheme is matched
/// case-insensitively, the token exactly.
pub fn has_bearer_token(configured: &str, authorization: Option<&str>) -> bool {
    if configured.is_empty() {
        return true;
    }
    if configured == DISABLED_TOKEN {
        return false;
    }
    let Some(header) = authorization else {
        return false;
    };
    let Some((scheme, token)) = header.trim().split_once(' ') else {
        return false;
    };
    scheme.eq_ignore_ascii_case("bearer") && constant_time_eq(token.trim().as_bytes(), configured.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
