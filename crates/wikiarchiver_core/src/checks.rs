use anyhow::{Context, Result, bail};
use serde::Serialize;

use crate::changes::Diff;
use crate::wiki_api::{PageData, WikiReadApi, WikiWriteApi};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Running,
    Archived,
    Failed,
    IgnoredPermalink,
    IgnoredArchived,
}

impl UrlStatus {
    pub const ALL: [UrlStatus; 5] = [
        Self::Running,
        Self::Archived,
        Self::Failed,
        Self::IgnoredPermalink,
        Self::IgnoredArchived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Archived => "archived",
            Self::Failed => "failed",
            Self::IgnoredPermalink => "ignored_permalink",
            Self::IgnoredArchived => "ignored_archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value.trim()))
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

/// Outcome of one URL within one article. Starts `running`; every other state is final.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UrlCheck {
    pub url: String,
    pub status: UrlStatus,
    pub archive_url: Option<String>,
    pub is_url_dead: bool,
    /// Rewritten citation stored in the archive map, once archived.
    pub replacement: Option<String>,
}

impl UrlCheck {
    pub fn running(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: UrlStatus::Running,
            archive_url: None,
            is_url_dead: false,
            replacement: None,
        }
    }

    pub fn set_archived(
        &mut self,
        archive_url: &str,
        is_url_dead: bool,
        replacement: &str,
    ) -> Result<()> {
        self.transition(UrlStatus::Archived)?;
        self.archive_url = Some(archive_url.to_string());
        self.is_url_dead = is_url_dead;
        self.replacement = Some(replacement.to_string());
        Ok(())
    }

    pub fn set_failed(&mut self, is_url_dead: bool) -> Result<()> {
        self.transition(UrlStatus::Failed)?;
        self.is_url_dead = is_url_dead;
        Ok(())
    }

    pub fn set_ignored_permalink(&mut self) -> Result<()> {
        self.transition(UrlStatus::IgnoredPermalink)
    }

    pub fn set_ignored_archived(&mut self) -> Result<()> {
        self.transition(UrlStatus::IgnoredArchived)
    }

    fn transition(&mut self, next: UrlStatus) -> Result<()> {
        if self.status.is_terminal() {
            bail!(
                "url check for {} is already {}, cannot become {}",
                self.url,
                self.status.as_str(),
                next.as_str()
            );
        }
        self.status = next;
        Ok(())
    }
}

/// One article visited by a run, with the page capabilities the pipeline needs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArticleCheck {
    pub id: Option<i64>,
    pub title: String,
    pub site: String,
    pub diff_old_id: Option<u64>,
    pub diff_new_id: Option<u64>,
    pub edit_id: Option<u64>,
}

impl ArticleCheck {
    pub fn new(title: &str, site: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            site: site.to_string(),
            diff_old_id: None,
            diff_new_id: None,
            edit_id: None,
        }
    }

    pub fn from_diff(diff: &Diff) -> Self {
        Self {
            diff_old_id: Some(diff.old_revision_id),
            diff_new_id: Some(diff.new_revision_id),
            ..Self::new(&diff.title, &diff.site)
        }
    }

    pub fn page_data<A>(&self, api: &mut A) -> Result<PageData>
    where
        A: WikiReadApi + ?Sized,
    {
        api.page_data(&self.title)
            .with_context(|| format!("failed to read source of {}", self.title))
    }

    pub fn source<A>(&self, api: &mut A) -> Result<Option<String>>
    where
        A: WikiReadApi + ?Sized,
    {
        Ok(self.page_data(api)?.source)
    }

    /// Commits `new_source` guarded by `latest_id`; keeps the new revision id in `edit_id`.
    pub fn edit_and_save<A>(
        &mut self,
        api: &mut A,
        new_source: &str,
        comment: &str,
        latest_id: u64,
    ) -> Result<()>
    where
        A: WikiWriteApi + ?Sized,
    {
        let edit_id = api.edit_page(&self.title, new_source, comment, latest_id)?;
        if edit_id.is_some() {
            self.edit_id = edit_id;
        }
        Ok(())
    }
}

/// Durable sink for article and URL outcomes.
pub trait CheckRecorder {
    /// Assigns `article.id` on first call; later calls update the stored row.
    fn record_article(&mut self, article: &mut ArticleCheck) -> Result<()>;
    /// Upserts the check keyed by article and URL.
    fn record_url(&mut self, article: &ArticleCheck, check: &UrlCheck) -> Result<()>;
}
