use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::changes::Diff;
use crate::wiki_api::{DiffRecord, WikiReadApi};

/// Comparison record types that carry inserted content: added line, changed line, moved paragraph.
pub const INSERTED_RECORD_TYPES: [u8; 3] = [1, 3, 5];

/// Wikitext added between the two revisions of `diff`. Empty when nothing was inserted.
pub fn inserted_wikitext<A>(api: &mut A, diff: &Diff) -> Result<String>
where
    A: WikiReadApi + ?Sized,
{
    if diff.old_revision_id == 0 || diff.new_revision_id == 0 {
        bail!(
            "cannot compare revisions of {}: missing revision id ({} -> {})",
            diff.title,
            diff.old_revision_id,
            diff.new_revision_id
        );
    }
    let records = api
        .compare_revisions(diff.old_revision_id, diff.new_revision_id)
        .with_context(|| {
            format!(
                "failed to compare revisions {} -> {} of {}",
                diff.old_revision_id, diff.new_revision_id, diff.title
            )
        })?;
    let text = inserted_text(&records);
    debug!(
        title = %diff.title,
        records = records.len(),
        inserted_bytes = text.len(),
        "diff content extracted"
    );
    Ok(text)
}

pub fn inserted_text(records: &[DiffRecord]) -> String {
    records
        .iter()
        .filter(|record| INSERTED_RECORD_TYPES.contains(&record.kind))
        .filter_map(|record| record.text.as_deref())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
