use tracing::debug;

use crate::archive::snapshot_timestamp;
use crate::citation::{
    ARCHIVE_TIMESTAMP_FIELD, CitationTemplate, DEAD_LINK_FIELD, DEAD_LINK_VALUE, build,
};

/// Adds the snapshot timestamp (and dead-link marker) to a citation.
///
/// Returns `None` without touching anything when the template is already
/// archived, has no usable `url`, or when `snapshot_url` carries no timestamp.
pub fn process(
    title: &str,
    template: &CitationTemplate,
    snapshot_url: &str,
    url_is_dead: bool,
) -> Option<String> {
    if template.has_archive() {
        debug!(title, "citation already archived");
        return None;
    }
    let url = template.url()?;
    let Some(timestamp) = snapshot_timestamp(snapshot_url) else {
        debug!(title, url, snapshot_url, "snapshot has no timestamp");
        return None;
    };

    let mut fields = template.fields.clone();
    fields.insert(ARCHIVE_TIMESTAMP_FIELD, timestamp);
    if url_is_dead {
        fields.insert(DEAD_LINK_FIELD, DEAD_LINK_VALUE);
    } else {
        fields.remove(DEAD_LINK_FIELD);
    }
    debug!(title, url, timestamp, url_is_dead, "citation rewritten");
    Some(build(&template.name, &fields))
}
