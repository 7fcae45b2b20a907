//! Shareable links: `<origin><path>?session=<id>`.

use url::Url;

use crate::config::SESSION_PARAM;
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Which side of a session a link opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Tracker,
    Submitter(SessionId),
}

/// Builds the link for `id` on the origin and path of `base_url`. Any query or
/// fragment already on the base is dropped.
pub fn build(base_url: &str, id: &SessionId) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(|e| Error::InvalidLink(e.to_string()))?;
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut().append_pair(SESSION_PARAM, id.as_str());
    Ok(url)
}

/// Selects the role from the `session` query parameter.
pub fn role_of(url: &Url) -> Result<Role> {
    let session = url
        .query_pairs()
        .find(|(name, _)| name == SESSION_PARAM)
        .map(|(_, value)| value.into_owned());

    match session {
        Some(raw) if !raw.trim().is_empty() => Ok(Role::Submitter(SessionId::parse(&raw)?)),
        _ => Ok(Role::Tracker),
    }
}

pub fn parse(raw: &str) -> Result<Role> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidLink(e.to_string()))?;
    role_of(&url)
}
