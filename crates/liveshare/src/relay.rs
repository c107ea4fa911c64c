//! Rewrites a Service-Bus hybrid-connections endpoint into a relay WebSocket URL.
//!
//! This is a pure function: it holds no state and only fails on a caller
//! precondition (an empty endpoint).

use url::form_urlencoded::byte_serialize;

use crate::error::{Error, Result};

/// Build the WebSocket URL the relay will accept for a given hybrid-connection
/// `endpoint`, `action`, and pre-issued SAS token.
///
/// Applies, in order: `sb:` → `wss:`, injects the hybrid-connection path
/// prefix at the first `.net/`, percent-encodes the SAS, and appends the
/// `sb-hc-action`/`sb-hc-token` query parameters.
///
/// ```
/// # use liveshare::relay::relay_uri;
/// let uri = relay_uri("sb://example.net/abc/", "connect", "TOKEN A/B+C").unwrap();
/// assert_eq!(
///     uri,
///     "wss://example.net:443/$hc/abc/?sb-hc-action=connect&sb-hc-token=TOKEN+A%2FB%2BC"
/// );
/// ```
pub fn relay_uri(endpoint: &str, action: &str, sas: &str) -> Result<String> {
    if endpoint.is_empty() {
        return Err(Error::InvalidConnection { field: "relayEndpoint" });
    }

    let rewritten = endpoint.replacen("sb:", "wss:", 1);
    let rewritten = replace_first(&rewritten, ".net/", ".net:443/$hc/");

    let encoded_sas: String = byte_serialize(sas.as_bytes()).collect();

    let separator = if rewritten.contains('?') { '&' } else { '?' };
    Ok(format!(
        "{rewritten}{separator}sb-hc-action={action}&sb-hc-token={encoded_sas}"
    ))
}

/// Replace the first occurrence of `pattern` in `s` with `replacement`.
fn replace_first(s: &str, pattern: &str, replacement: &str) -> String {
    match s.find(pattern) {
        Some(idx) => {
            let mut out = String::with_capacity(s.len() - pattern.len() + replacement.len());
            out.push_str(&s[..idx]);
            out.push_str(replacement);
            out.push_str(&s[idx + pattern.len()..]);
            out
        }
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_scheme_and_injects_hybrid_connection_prefix() {
        let uri = relay_uri("sb://example.servicebus.windows.net/abc/", "connect", "TOKEN").unwrap();
        assert_eq!(
            uri,
            "wss://example.servicebus.windows.net:443/$hc/abc/?sb-hc-action=connect&sb-hc-token=TOKEN"
        );
    }

    #[test]
    fn encodes_sas_special_characters() {
        let uri = relay_uri("sb://example.net/abc/", "connect", "TOKEN A/B+C").unwrap();
        assert_eq!(
            uri,
            "wss://example.net:443/$hc/abc/?sb-hc-action=connect&sb-hc-token=TOKEN+A%2FB%2BC"
        );
    }

    #[test]
    fn rejects_empty_endpoint() {
        let err = relay_uri("", "connect", "TOKEN").unwrap_err();
        assert!(matches!(err, Error::InvalidConnection { field: "relayEndpoint" }));
    }

    #[test]
    fn query_carries_exactly_two_parameters() {
        let uri = relay_uri("sb://host.servicebus.windows.net/path/", "connect", "sas").unwrap();
        let (_, query) = uri.split_once('?').unwrap();
        let params: Vec<&str> = query.split('&').map(|p| p.split('=').next().unwrap()).collect();
        assert_eq!(params, vec!["sb-hc-action", "sb-hc-token"]);
    }

    #[test]
    fn only_first_dot_net_slash_is_rewritten() {
        // Pathological input with a second ".net/" later in the path must not
        // get a second rewrite.
        let uri = relay_uri("sb://a.net/b.net/c/", "connect", "x").unwrap();
        assert!(uri.starts_with("wss://a.net:443/$hc/b.net/c/"));
    }
}
