use exec_relay::{ExecParameters, UpstreamUrlError, build_upstream_url};
use url::Url;

/// Upstream exec URL for the Workers `fetch` API, which only takes
/// `http(s)` URLs even for WebSocket upgrades. The credential goes in the
/// `X-Nomad-Token` header, never the URL.
pub fn upstream_fetch_url(
    cluster_addr: &str,
    params: &ExecParameters,
) -> Result<Url, UpstreamUrlError> {
    let mut url = build_upstream_url(cluster_addr, params, None)?;
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    url.set_scheme(scheme)
        .map_err(|()| UpstreamUrlError::UnsupportedScheme(scheme.to_string()))?;
    Ok(url)
}
