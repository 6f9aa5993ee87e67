use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;

use crate::wiki_api::{RecentChange, WikiReadApi};

/// Revision span covering every edit to one page inside a change window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub title: String,
    pub page_id: u64,
    pub old_revision_id: u64,
    pub new_revision_id: u64,
    pub site: String,
}

impl Diff {
    pub fn from_recent_change(change: &RecentChange, site: &str) -> Self {
        Self {
            title: change.title.clone(),
            page_id: change.pageid,
            old_revision_id: change.old_revid,
            new_revision_id: change.revid,
            site: site.to_string(),
        }
    }

    /// Widens this span to cover `other`. Order-independent.
    pub fn combine(&mut self, other: &Diff) {
        self.new_revision_id = self.new_revision_id.max(other.new_revision_id);
        self.old_revision_id = self.old_revision_id.min(other.old_revision_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ChangeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            bail!("change window starts after it ends: {start} > {end}");
        }
        Ok(Self { start, end })
    }

    pub fn last_hours(now: DateTime<Utc>, hours: u32) -> Self {
        Self {
            start: now - TimeDelta::hours(i64::from(hours)),
            end: now,
        }
    }

    /// The whole UTC day `date`, 00:00:00 through 23:59:59.
    pub fn for_date(date: NaiveDate) -> Result<Self> {
        let start = date
            .and_hms_opt(0, 0, 0)
            .with_context(|| format!("invalid start of day for {date}"))?
            .and_utc();
        let end = date
            .and_hms_opt(23, 59, 59)
            .with_context(|| format!("invalid end of day for {date}"))?
            .and_utc();
        Self::new(start, end)
    }

    /// The feed is read newest first, so `rcstart` is the window end.
    pub fn rcstart(&self) -> String {
        self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn rcend(&self) -> String {
        self.start.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Merges per-edit diffs into one span per page, ordered by page id.
pub fn merge_diffs<I>(diffs: I) -> Vec<Diff>
where
    I: IntoIterator<Item = Diff>,
{
    let mut by_page: BTreeMap<u64, Diff> = BTreeMap::new();
    for diff in diffs {
        match by_page.get_mut(&diff.page_id) {
            Some(existing) => existing.combine(&diff),
            None => {
                by_page.insert(diff.page_id, diff);
            }
        }
    }
    by_page.into_values().collect()
}

/// Reads the whole change feed for `window`, following continuation tokens until exhausted.
pub fn fetch_diffs<A>(api: &mut A, window: &ChangeWindow) -> Result<Vec<Diff>>
where
    A: WikiReadApi + ?Sized,
{
    let site = api.site().to_string();
    let mut diffs = Vec::new();
    let mut continuation = BTreeMap::new();

    loop {
        let page = api
            .recent_changes_page(window, &continuation)
            .context("failed to read the recent changes feed")?;
        diffs.extend(
            page.changes
                .iter()
                .map(|change| Diff::from_recent_change(change, &site)),
        );
        match page.continuation {
            Some(next) => continuation = next,
            None => break,
        }
    }

    let entries = diffs.len();
    let merged = merge_diffs(diffs);
    info!(
        entries,
        pages = merged.len(),
        start = %window.rcend(),
        end = %window.rcstart(),
        "change feed loaded"
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{ChangeWindow, Diff, fetch_diffs, merge_diffs};
    use crate::test_support::{MockWiki, recent_change};

    fn diff(page_id: u64, old: u64, new: u64) -> Diff {
        Diff {
            title: format!("Page {page_id}"),
            page_id,
            old_revision_id: old,
            new_revision_id: new,
            site: "https://test.wikipedia.org".to_string(),
        }
    }

    #[test]
    fn combine_widens_span_for_overlapping_edits() {
        let merged = merge_diffs(vec![diff(42, 95, 102), diff(42, 100, 105)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].old_revision_id, 95);
        assert_eq!(merged[0].new_revision_id, 105);
    }

    #[test]
    fn merge_is_independent_of_entry_order() {
        let entries = [diff(7, 10, 12), diff(7, 12, 20), diff(7, 3, 9), diff(8, 1, 2)];
        let expected = merge_diffs(entries.clone());
        let orders: [[usize; 4]; 5] = [
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [0, 2, 1, 3],
            [1, 0, 2, 3],
        ];
        for order in orders {
            let shuffled = order.iter().map(|index| entries[*index].clone());
            let merged = merge_diffs(shuffled);
            let spans = merged
                .iter()
                .map(|item| (item.page_id, item.old_revision_id, item.new_revision_id))
                .collect::<Vec<_>>();
            let expected_spans = expected
                .iter()
                .map(|item| (item.page_id, item.old_revision_id, item.new_revision_id))
                .collect::<Vec<_>>();
            assert_eq!(spans, expected_spans);
        }
        assert_eq!(
            (expected[0].old_revision_id, expected[0].new_revision_id),
            (3, 20)
        );
    }

    #[test]
    fn combine_is_associative() {
        let (a, b, c) = (diff(1, 5, 9), diff(1, 2, 6), diff(1, 7, 11));

        let mut left = a.clone();
        left.combine(&b);
        left.combine(&c);

        let mut right_tail = b.clone();
        right_tail.combine(&c);
        let mut right = a.clone();
        right.combine(&right_tail);

        assert_eq!(left, right);
        assert!(left.old_revision_id <= left.new_revision_id);
    }

    #[test]
    fn fetch_diffs_follows_continuation_until_exhausted() {
        let mut api = MockWiki::default();
        api.push_changes_page(
            vec![recent_change("Alfa", 42, 95, 102)],
            Some(&[("rccontinue", "20250115|1"), ("continue", "-||")]),
        );
        api.push_changes_page(
            vec![
                recent_change("Alfa", 42, 100, 105),
                recent_change("Beta", 7, 10, 11),
            ],
            None,
        );

        let window = ChangeWindow::for_date(NaiveDate::from_ymd_opt(2025, 1, 15).expect("date"))
            .expect("window");
        let diffs = fetch_diffs(&mut api, &window).expect("fetch");

        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].page_id, 7);
        assert_eq!(diffs[1].page_id, 42);
        assert_eq!(
            (diffs[1].old_revision_id, diffs[1].new_revision_id),
            (95, 105)
        );
        assert_eq!(diffs[1].site, "https://test.wikipedia.org");
        assert_eq!(api.seen_continuations.len(), 2);
        assert!(api.seen_continuations[0].is_empty());
        assert_eq!(
            api.seen_continuations[1]
                .get("rccontinue")
                .map(String::as_str),
            Some("20250115|1")
        );
    }

    #[test]
    fn fetch_diffs_aborts_on_transport_error() {
        let mut api = MockWiki::default();
        api.push_changes_page(vec![recent_change("Alfa", 1, 1, 2)], Some(&[("rccontinue", "x")]));
        api.fail_changes_after = Some(1);

        let window = ChangeWindow::last_hours(Utc::now(), 24);
        let error = fetch_diffs(&mut api, &window).expect_err("must fail");
        assert!(error.to_string().contains("recent changes feed"));
    }

    #[test]
    fn window_formats_feed_bounds_newest_first() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).single().expect("time");
        let window = ChangeWindow::last_hours(now, 24);
        assert_eq!(window.rcstart(), "2025-01-15T12:00:00Z");
        assert_eq!(window.rcend(), "2025-01-14T12:00:00Z");

        let day = ChangeWindow::for_date(NaiveDate::from_ymd_opt(2025, 1, 15).expect("date"))
            .expect("window");
        assert_eq!(day.rcend(), "2025-01-15T00:00:00Z");
        assert_eq!(day.rcstart(), "2025-01-15T23:59:59Z");

        assert!(ChangeWindow::new(now, now - chrono::TimeDelta::hours(1)).is_err());
    }
}
