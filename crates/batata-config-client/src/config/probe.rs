//! Long-poll wire format
//!
//! A probe lists every polled config as `dataId WORD_SEP group WORD_SEP md5
//! [WORD_SEP tenant] LINE_SEP`. The server answers with the changed keys as
//! `dataId WORD_SEP group [WORD_SEP tenant] LINE_SEP`, URL-encoded as a whole.

use tracing::error;

use super::cache::{CacheData, ConfigKey};

pub const WORD_SEPARATOR: char = '\u{2}';
pub const LINE_SEPARATOR: char = '\u{1}';

/// Encode the probe payload for the given entries.
pub fn encode_probe<'a>(entries: impl IntoIterator<Item = &'a CacheData>) -> String {
    let mut probe = String::new();
    for cache in entries {
        probe.push_str(cache.data_id());
        probe.push(WORD_SEPARATOR);
        probe.push_str(cache.group());
        probe.push(WORD_SEPARATOR);
        probe.push_str(&cache.md5());
        if !cache.tenant().is_empty() {
            probe.push(WORD_SEPARATOR);
            probe.push_str(cache.tenant());
        }
        probe.push(LINE_SEPARATOR);
    }
    probe
}

/// Parse the changed keys out of a long-poll response body.
///
/// Malformed lines are logged and skipped.
pub fn parse_changed_keys(body: &str) -> Vec<ConfigKey> {
    let decoded = url_decode(body);
    let mut changed = Vec::new();

    for line in decoded.split([LINE_SEPARATOR, '\n']) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(WORD_SEPARATOR).collect();
        match fields.as_slice() {
            [data_id, group] if !data_id.is_empty() && !group.is_empty() => {
                changed.push(ConfigKey::new(data_id, group, ""));
            }
            [data_id, group, tenant] if !data_id.is_empty() && !group.is_empty() => {
                changed.push(ConfigKey::new(data_id, group, tenant));
            }
            _ => error!(line = %line.escape_default(), "Invalid changed config key in long-poll response"),
        }
    }
    changed
}

/// Decode a body that was URL-encoded as a single value.
///
/// Literal `&` and `=` are escaped first so the form parser sees one name.
fn url_decode(body: &str) -> String {
    let escaped = body.replace('&', "%26").replace('=', "%3D");
    url::form_urlencoded::parse(escaped.as_bytes())
        .map(|(name, _)| name.into_owned())
        .next()
        .unwrap_or_default()
}
