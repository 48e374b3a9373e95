//! Rewrites between the create, connect, join and stream addresses.
//!
//! All of these work on the request URI the caller actually used, so a relay
//! mounted under a path prefix keeps that prefix in every link it hands out.

use once_cell::sync::Lazy;
use regex::Regex;

static CREATE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"/create.*$").expect("valid regex"));

/// Address of the connect page for `id`, derived from the host's `/create`
/// request. This is what the host receives in its `URL` envelope.
pub fn create_to_connect(scheme: &str, host: &str, request_uri: &str, id: &str) -> String {
    let path = CREATE_SUFFIX.replace(request_uri, format!("/connect/{id}").as_str());
    format!("{scheme}://{host}{path}")
}

/// Shareable join page address, derived from a connect page request.
pub fn connect_to_join(scheme: &str, host: &str, request_uri: &str) -> String {
    let path = request_uri.replace("/connect/", "/join/");
    format!("{scheme}://{host}{path}")
}

/// Listener stream address, derived from a join page request.
pub fn join_to_ws(scheme: &str, host: &str, request_uri: &str, id: &str) -> String {
    let path = request_uri.replace(&format!("/join/{id}"), &format!("/ws/{id}"));
    format!("{scheme}://{host}{path}")
}
