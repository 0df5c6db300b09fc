//! Resource identity: human path ↔ storage-safe slug.
//!
//! A resource is addressed by its URL path (`/customers/`) in the UI and
//! by a slug (`customers-slash`) in backend routes, virtual addresses,
//! sidecar file names, and state keys. The mapping is invertible for every
//! non-empty path, modulo the leading slash.
//!
//! # Encoding
//!
//! | Input | Output |
//! |-------|--------|
//! | leading `/` | dropped |
//! | trailing `/` | suffix `-slash` |
//! | inner `/` | `-` |
//! | `[A-Za-z0-9_]` | unchanged |
//! | any other byte (including `-`) | `~XX` (uppercase hex) |
//! | root `/` | `empty` |
//!
//! Simple paths therefore produce the same slugs the backend computes
//! itself (`/sap/functions` → `sap-functions`). Two bodies would otherwise
//! be ambiguous and get one character escaped: a body spelling `empty`
//! (`~65mpty`) and a non-trailing body ending in a `slash` segment
//! (`a-~73lash`).
//!
//! # Route slugs
//!
//! The configuration service names resources by its own, lossy slug: every
//! character outside `[A-Za-z0-9_-]` becomes `-`, runs of `-` collapse, and
//! `/customer-orders` and `/customer/orders` both become
//! `customer-orders`. [`route_slug_for_path`] reproduces it for building
//! service URLs. Local keys (virtual addresses, sidecars, test state)
//! always use [`to_slug`].

use crate::error::WorkbenchError;

/// Slug used for the root path.
pub const EMPTY_SLUG: &str = "empty";

const TRAILING_SUFFIX: &str = "-slash";

/// Add a leading `/` if missing. Rejects the empty string.
pub fn normalize_path(path: &str) -> Result<String, WorkbenchError> {
    if path.is_empty() {
        return Err(WorkbenchError::EmptyPath);
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("/{path}"))
    }
}

/// Convert a resource path into its slug.
pub fn to_slug(path: &str) -> Result<String, WorkbenchError> {
    let normalized = normalize_path(path)?;
    let mut body = &normalized[1..];
    let trailing = body.ends_with('/');
    if trailing {
        body = &body[..body.len() - 1];
    }

    if body.is_empty() && !trailing {
        return Ok(EMPTY_SLUG.to_string());
    }

    let mut encoded = encode_body(body);
    if trailing {
        encoded.push_str(TRAILING_SUFFIX);
        return Ok(encoded);
    }

    if encoded == EMPTY_SLUG {
        return Ok("~65mpty".to_string());
    }
    if encoded.ends_with(TRAILING_SUFFIX) {
        // "-slash" -> "-~73lash"
        encoded.truncate(encoded.len() - "slash".len());
        encoded.push_str("~73lash");
    }
    Ok(encoded)
}

/// Convert a slug back into its (leading-slash normalized) path.
pub fn to_path(slug: &str) -> Result<String, WorkbenchError> {
    if slug.is_empty() {
        return Err(WorkbenchError::InvalidSlug(String::new()));
    }
    if slug == EMPTY_SLUG {
        return Ok("/".to_string());
    }

    let (body, trailing) = match slug.strip_suffix(TRAILING_SUFFIX) {
        Some(body) => (body, true),
        None => (slug, false),
    };

    let decoded = decode_body(body).ok_or_else(|| WorkbenchError::InvalidSlug(slug.to_string()))?;
    let mut path = String::with_capacity(decoded.len() + 2);
    path.push('/');
    path.push_str(&decoded);
    if trailing {
        path.push('/');
    }
    Ok(path)
}

/// True when both paths name the same resource.
pub fn same_resource(a: &str, b: &str) -> bool {
    match (normalize_path(a), normalize_path(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The configuration service's slug for `path`.
pub fn route_slug_for_path(path: &str) -> String {
    let mut body = path.strip_prefix('/').unwrap_or(path);
    let trailing = body.ends_with('/');
    if trailing {
        body = &body[..body.len() - 1];
    }

    let mut slug = String::with_capacity(body.len() + TRAILING_SUFFIX.len());
    for c in body.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' };
        if c == '-' && (slug.is_empty() || slug.ends_with('-')) {
            continue;
        }
        slug.push(c);
    }
    while slug.ends_with('-') {
        slug.pop();
    }

    if trailing {
        slug.push_str(TRAILING_SUFFIX);
    }
    if slug.is_empty() {
        return EMPTY_SLUG.to_string();
    }
    slug
}

/// The configuration service's slug for the resource named by `slug`.
pub fn route_slug(slug: &str) -> Result<String, WorkbenchError> {
    Ok(route_slug_for_path(&to_path(slug)?))
}

fn encode_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for byte in body.bytes() {
        match byte {
            b'/' => out.push('-'),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("~{other:02X}")),
        }
    }
    out
}

fn decode_body(body: &str) -> Option<String> {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'-' => {
                out.push(b'/');
                i += 1;
            }
            b'~' => {
                let hex = body.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b @ (b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_') => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_backend_slugs_for_simple_paths() {
        assert_eq!(to_slug("/customers/").unwrap(), "customers-slash");
        assert_eq!(to_slug("/api/v1/data/").unwrap(), "api-v1-data-slash");
        assert_eq!(to_slug("/sap/functions").unwrap(), "sap-functions");
        assert_eq!(to_slug("/").unwrap(), "empty");
    }

    #[test]
    fn leading_slash_is_optional() {
        assert_eq!(to_slug("customers").unwrap(), to_slug("/customers").unwrap());
        assert!(same_resource("customers", "/customers"));
        assert!(!same_resource("/customers", "/customers/"));
    }

    #[test]
    fn empty_path_is_rejected() {
        assert_eq!(to_slug(""), Err(WorkbenchError::EmptyPath));
        assert!(matches!(to_path(""), Err(WorkbenchError::InvalidSlug(_))));
    }

    #[test]
    fn round_trip_over_awkward_paths() {
        let paths = [
            "/customers/",
            "/customers",
            "/api/v1/data/",
            "/sap/functions",
            "/single",
            "/multiple/nested/path/",
            "/",
            "//",
            "/empty",
            "/empty/",
            "/slash",
            "/a/slash",
            "/a/slash/",
            "/with-hyphen",
            "/with/hyphen-",
            "/dots.and spaces",
            "/ünïcode/päth",
            "/tilde~name",
            "/a//b",
            "relative/path",
        ];
        for path in paths {
            let slug = to_slug(path).unwrap();
            let back = to_path(&slug).unwrap();
            assert_eq!(back, normalize_path(path).unwrap(), "slug {slug}");
        }
    }

    #[test]
    fn distinct_paths_never_collide() {
        let paths = [
            "/a/b", "/a-b", "/a_b", "/a/b/", "/a/slash", "/a/", "/empty", "/", "/a~2Db",
        ];
        let mut slugs: Vec<String> = paths.iter().map(|p| to_slug(p).unwrap()).collect();
        slugs.sort();
        slugs.dedup();
        assert_eq!(slugs.len(), paths.len());
    }

    #[test]
    fn slugs_are_uri_and_filesystem_safe() {
        let slug = to_slug("/weird path/with:colons?and#frag").unwrap();
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '~')));
    }

    #[test]
    fn route_slugs_follow_the_service() {
        assert_eq!(route_slug_for_path("/customer-orders"), "customer-orders");
        assert_eq!(route_slug_for_path("/customer/orders"), "customer-orders");
        assert_eq!(route_slug_for_path("/api/v1.2/data/"), "api-v1-2-data-slash");
        assert_eq!(route_slug_for_path("/a//b--c/"), "a-b-c-slash");
        assert_eq!(route_slug_for_path("/-edge-"), "edge");
        assert_eq!(route_slug_for_path("/"), "empty");
        assert_eq!(route_slug_for_path(""), "empty");
        assert_eq!(route_slug_for_path("/snake_case"), "snake_case");
    }

    #[test]
    fn route_slug_decodes_the_local_slug_first() {
        let local = to_slug("/customer-orders").unwrap();
        assert_eq!(local, "customer~2Dorders");
        assert_eq!(route_slug(&local).unwrap(), "customer-orders");
        assert_eq!(route_slug("customers-slash").unwrap(), "customers-slash");
        assert!(route_slug("bad~zz").is_err());
    }

    #[test]
    fn malformed_escape_is_rejected() {
        assert!(to_path("bad~Z1").is_err());
        assert!(to_path("truncated~4").is_err());
        assert!(to_path("has.dot").is_err());
    }
}
