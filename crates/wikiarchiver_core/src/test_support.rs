use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::archive::SnapshotApi;
use crate::changes::ChangeWindow;
use crate::checks::{ArticleCheck, CheckRecorder, UrlCheck};
use crate::wiki_api::{
    DiffRecord, PageData, RecentChange, RecentChangesPage, WikiReadApi, WikiWriteApi,
};

pub(crate) const TEST_SITE: &str = "https://test.wikipedia.org";

pub(crate) fn recent_change(title: &str, pageid: u64, old_revid: u64, revid: u64) -> RecentChange {
    RecentChange {
        title: title.to_string(),
        pageid,
        revid,
        old_revid,
        timestamp: None,
    }
}

pub(crate) fn page(source: &str, latest_id: u64) -> PageData {
    PageData {
        source: Some(source.to_string()),
        latest_id: Some(latest_id),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedEdit {
    pub title: String,
    pub source: String,
    pub comment: String,
    pub latest_id: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MockWiki {
    pub changes_pages: VecDeque<RecentChangesPage>,
    pub seen_continuations: Vec<BTreeMap<String, String>>,
    /// Number of change-feed calls that succeed before every later call fails.
    pub fail_changes_after: Option<usize>,
    pub compare_records: HashMap<(u64, u64), Vec<DiffRecord>>,
    pub compared: Vec<(u64, u64)>,
    pub fail_compare: bool,
    pub pages: HashMap<String, PageData>,
    pub page_reads: Vec<String>,
    pub fail_page_read: bool,
    pub fail_edit: bool,
    pub edits: Vec<RecordedEdit>,
    pub next_edit_id: Option<u64>,
    pub request_count: usize,
}

impl MockWiki {
    pub fn push_changes_page(
        &mut self,
        changes: Vec<RecentChange>,
        continuation: Option<&[(&str, &str)]>,
    ) {
        let continuation = continuation.map(|pairs| {
            pairs
                .iter()
                .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                .collect()
        });
        self.changes_pages.push_back(RecentChangesPage {
            changes,
            continuation,
        });
    }
}

impl WikiReadApi for MockWiki {
    fn site(&self) -> &str {
        TEST_SITE
    }

    fn recent_changes_page(
        &mut self,
        _window: &ChangeWindow,
        continuation: &BTreeMap<String, String>,
    ) -> Result<RecentChangesPage> {
        self.request_count += 1;
        let call_index = self.seen_continuations.len();
        self.seen_continuations.push(continuation.clone());
        if self
            .fail_changes_after
            .is_some_and(|limit| call_index >= limit)
        {
            bail!("mock change feed unavailable");
        }
        Ok(self.changes_pages.pop_front().unwrap_or_default())
    }

    fn compare_revisions(
        &mut self,
        old_revision_id: u64,
        new_revision_id: u64,
    ) -> Result<Vec<DiffRecord>> {
        self.request_count += 1;
        self.compared.push((old_revision_id, new_revision_id));
        if self.fail_compare {
            bail!("mock compare failed");
        }
        Ok(self
            .compare_records
            .get(&(old_revision_id, new_revision_id))
            .cloned()
            .unwrap_or_default())
    }

    fn page_data(&mut self, title: &str) -> Result<PageData> {
        self.request_count += 1;
        self.page_reads.push(title.to_string());
        if self.fail_page_read {
            bail!("mock page read failed");
        }
        Ok(self.pages.get(title).cloned().unwrap_or_default())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for MockWiki {
    fn edit_page(
        &mut self,
        title: &str,
        source: &str,
        comment: &str,
        latest_id: u64,
    ) -> Result<Option<u64>> {
        self.request_count += 1;
        if self.fail_edit {
            bail!("mock edit rejected");
        }
        if let Some(current) = self.pages.get(title).and_then(|page| page.latest_id)
            && current != latest_id
        {
            bail!("edit conflict: {title} is at revision {current}, not {latest_id}");
        }
        self.edits.push(RecordedEdit {
            title: title.to_string(),
            source: source.to_string(),
            comment: comment.to_string(),
            latest_id,
        });
        let new_id = self.next_edit_id.unwrap_or(latest_id + 1);
        self.pages.insert(title.to_string(), page(source, new_id));
        Ok(self.next_edit_id)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) enum SnapshotReply {
    Found(String),
    #[default]
    Missing,
    Error,
}

impl SnapshotReply {
    fn into_result(self) -> Result<Option<String>> {
        match self {
            Self::Found(snapshot) => Ok(Some(snapshot)),
            Self::Missing => Ok(None),
            Self::Error => bail!("mock snapshot service unavailable"),
        }
    }
}

/// Snapshot service double. Unknown probe URLs fail like an unreachable host.
#[derive(Debug, Default)]
pub(crate) struct MockSnapshots {
    pub statuses: HashMap<String, u16>,
    pub save_reply: SnapshotReply,
    /// Per-url save replies, taking precedence over `save_reply`.
    pub save_replies: HashMap<String, SnapshotReply>,
    pub lookup_reply: SnapshotReply,
    pub probes: Vec<String>,
    pub saves: Vec<String>,
    pub lookups: Vec<String>,
}

impl SnapshotApi for MockSnapshots {
    fn probe_status(&mut self, url: &str, _timeout: Duration) -> Result<u16> {
        self.probes.push(url.to_string());
        match self.statuses.get(url) {
            Some(status) => Ok(*status),
            None => bail!("mock connection refused for {url}"),
        }
    }

    fn save(&mut self, url: &str) -> Result<Option<String>> {
        self.saves.push(url.to_string());
        self.save_replies
            .get(url)
            .cloned()
            .unwrap_or_else(|| self.save_reply.clone())
            .into_result()
    }

    fn closest_available(&mut self, url: &str) -> Result<Option<String>> {
        self.lookups.push(url.to_string());
        self.lookup_reply.clone().into_result()
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryRecorder {
    pub articles: Vec<ArticleCheck>,
    pub urls: Vec<(Option<i64>, UrlCheck)>,
    pub fail: bool,
    next_id: i64,
}

impl CheckRecorder for MemoryRecorder {
    fn record_article(&mut self, article: &mut ArticleCheck) -> Result<()> {
        if self.fail {
            bail!("mock recorder offline");
        }
        match article.id {
            Some(id) => {
                if let Some(stored) = self.articles.iter_mut().find(|item| item.id == Some(id)) {
                    *stored = article.clone();
                }
            }
            None => {
                self.next_id += 1;
                article.id = Some(self.next_id);
                self.articles.push(article.clone());
            }
        }
        Ok(())
    }

    fn record_url(&mut self, article: &ArticleCheck, check: &UrlCheck) -> Result<()> {
        if self.fail {
            bail!("mock recorder offline");
        }
        match self
            .urls
            .iter_mut()
            .find(|(id, stored)| *id == article.id && stored.url == check.url)
        {
            Some((_, stored)) => *stored = check.clone(),
            None => self.urls.push((article.id, check.clone())),
        }
        Ok(())
    }
}
