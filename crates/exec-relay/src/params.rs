//! Exec connection parameters and the upstream exec URL.

use thiserror::Error;
use url::{Url, form_urlencoded};

use crate::credential::Credential;

/// Command run when the client sends none or an unusable one.
pub const DEFAULT_COMMAND: &str = "/bin/sh";

const ALLOC_ID_PARAM: &str = "allocId";
const TASK_PARAM: &str = "task";
const COMMAND_PARAM: &str = "command";
const TTY_PARAM: &str = "tty";

/// What the browser asked to run, read from the upgrade query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParameters {
    pub alloc_id: String,
    pub task: String,
    pub command: Vec<String>,
    pub tty: bool,
}

impl ExecParameters {
    /// Reads `allocId`, `task`, `command` and `tty` from a urlencoded query.
    ///
    /// The first occurrence of each key wins. Returns `None` when `allocId`
    /// or `task` is missing or empty. `command` must be a JSON array of
    /// strings and anything else, including `[]`, falls back to
    /// [`DEFAULT_COMMAND`]. `tty` is on only for the literal `true`.
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let mut alloc_id = None;
        let mut task = None;
        let mut command = None;
        let mut tty = None;

        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let slot = match key.as_ref() {
                ALLOC_ID_PARAM => &mut alloc_id,
                TASK_PARAM => &mut task,
                COMMAND_PARAM => &mut command,
                TTY_PARAM => &mut tty,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        let alloc_id = alloc_id.filter(|value| !value.is_empty())?;
        let task = task.filter(|value| !value.is_empty())?;

        Some(Self {
            alloc_id,
            task,
            command: parse_command(command.as_deref()),
            tty: tty.as_deref() == Some("true"),
        })
    }

    /// The command as the JSON array the cluster expects.
    pub fn command_json(&self) -> String {
        serde_json::to_string(&self.command).unwrap_or_else(|_| "[]".to_string())
    }
}

fn parse_command(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .filter(|command| !command.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_COMMAND.to_string()])
}

/// First value of `name` in a urlencoded query.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamUrlError {
    #[error("invalid cluster address: {0}")]
    InvalidBase(#[from] url::ParseError),
    #[error("unsupported cluster address scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("cluster address cannot carry a path")]
    CannotBeABase,
}

/// Builds the cluster exec socket URL:
/// `{ws|wss}://{cluster}/…/v1/client/allocation/{allocId}/exec?task=&command=&tty=`.
///
/// `credential` is appended as `token` and is only passed when the outbound
/// client cannot set the `X-Nomad-Token` header.
pub fn build_upstream_url(
    base_addr: &str,
    params: &ExecParameters,
    credential: Option<&Credential>,
) -> Result<Url, UpstreamUrlError> {
    let mut url = Url::parse(base_addr)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(UpstreamUrlError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| UpstreamUrlError::UnsupportedScheme(scheme.to_string()))?;

    url.path_segments_mut()
        .map_err(|()| UpstreamUrlError::CannotBeABase)?
        .pop_if_empty()
        .extend(["v1", "client", "allocation", params.alloc_id.as_str(), "exec"]);

    url.set_fragment(None);
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair(TASK_PARAM, &params.task)
            .append_pair(COMMAND_PARAM, &params.command_json())
            .append_pair(TTY_PARAM, if params.tty { "true" } else { "false" });
        if let Some(credential) = credential {
            query.append_pair("token", credential.expose());
        }
    }
    Ok(url)
}
