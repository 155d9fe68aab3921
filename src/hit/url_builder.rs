//! Target path and form body for a hit POST.

use super::Hit;
use url::form_urlencoded;

/// Measurement protocol version sent as `v`
pub const PROTOCOL_VERSION: &str = "1";

/// Collection path on the configured host
pub const COLLECT_PATH: &str = "/collect";

/// Path the hit is POSTed to, relative to the transport address
pub fn build_post_url(_hit: &Hit) -> String {
    COLLECT_PATH.to_string()
}

/// Form-urlencoded body carrying every parameter of the hit
pub fn build_post_payload(hit: &Hit) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in hit.parameters() {
        serializer.append_pair(&key, &value);
    }
    serializer.finish()
}
