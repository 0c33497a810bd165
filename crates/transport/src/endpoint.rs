use url::Url;

use {crate::error::TransportError, tether_protocol::session_path};

/// Socket URL for `session_id` on the server at `base_url`.
///
/// `http` maps to `ws` and `https` to `wss`; `ws`/`wss` bases are kept. Any
/// path on the base is replaced by the session path.
pub fn session_url(base_url: &str, session_id: &str) -> Result<Url, TransportError> {
    if session_id.is_empty() {
        return Err(TransportError::InvalidUrl("empty session id".into()));
    }
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme `{other}`"
            )));
        },
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(format!("cannot use scheme `{scheme}`")))?;
    url.set_path(&session_path(session_id));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// The same server, bound to another session.
pub fn rebind(url: &Url, session_id: &str) -> Url {
    let mut url = url.clone();
    url.set_path(&session_path(session_id));
    url
}

/// The session id in a `/ws/session/<id>/` URL.
pub fn session_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    match (segments.next(), segments.next(), segments.next()) {
        (Some("ws"), Some("session"), Some(id)) if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}
