//! Socket URL derivation.

use url::Url;

use crate::error::{ChannelError, ChannelResult};

/// Engine protocol revision spoken by default.
pub const DEFAULT_ENGINE_VERSION: u8 = 3;

/// Build the socket URL for an upstream endpoint.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` endpoints are
/// used as given. Any path on the endpoint is kept as a prefix of
/// `/socket.io/`.
pub fn socket_url(endpoint: &str, token: &str, engine_version: u8) -> ChannelResult<Url> {
    let mut url =
        Url::parse(endpoint).map_err(|e| ChannelError::InvalidUrl(format!("{}: {}", endpoint, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_fragment(None);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", &engine_version.to_string())
        .append_pair("transport", "websocket")
        .append_pair("token", token);

    Ok(url)
}
