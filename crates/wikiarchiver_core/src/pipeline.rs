use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveResolver, SnapshotApi};
use crate::changes::{ChangeWindow, Diff, fetch_diffs};
use crate::checks::{ArticleCheck, CheckRecorder, UrlCheck};
use crate::citation::{self, CitationTemplate};
use crate::config::{ArchiverConfig, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::diff_content::inserted_wikitext;
use crate::rewrite;
use crate::wiki_api::WikiWriteApi;

pub const MSG_NO_TEMPLATES: &str = "no templates to update";
pub const MSG_MISSING_PAGE_DATA: &str = "failed to get wikitext or revision id";
pub const MSG_UNCHANGED: &str = "article unchanged";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Lower-cased URL prefixes that are never archived.
    pub skip_url_prefixes: Vec<String>,
    pub probe_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl PipelineSettings {
    pub fn new<I, P>(skip_url_prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        Self {
            skip_url_prefixes: skip_url_prefixes
                .into_iter()
                .map(|prefix| prefix.as_ref().trim().to_lowercase())
                .filter(|prefix| !prefix.is_empty())
                .collect(),
            probe_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self {
            probe_timeout: config.request_timeout(),
            ..Self::new(config.skip_url_prefixes())
        }
    }

    pub fn is_skipped(&self, url: &str) -> bool {
        let lower = url.trim().to_lowercase();
        self.skip_url_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
    }
}

/// Run-scoped `url -> rewritten citation`, in insertion order. Entries are never removed.
#[derive(Debug, Clone, Default)]
pub struct ArchiveMap {
    entries: Vec<(String, String)>,
    positions: HashMap<String, usize>,
}

impl ArchiveMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = Self::new();
        for (url, template) in entries {
            map.insert(&url, &template);
        }
        map
    }

    pub fn contains(&self, url: &str) -> bool {
        self.positions.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<&str> {
        self.positions
            .get(url)
            .map(|index| self.entries[*index].1.as_str())
    }

    pub fn insert(&mut self, url: &str, template: &str) {
        match self.positions.get(url) {
            Some(index) => self.entries[*index].1 = template.to_string(),
            None => {
                self.positions.insert(url.to_string(), self.entries.len());
                self.entries.push((url.to_string(), template.to_string()));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(url, template)| (url.as_str(), template.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArticleUpdate {
    pub success: bool,
    pub message: String,
    pub urls_archived: usize,
}

impl ArticleUpdate {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            urls_archived: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleReport {
    pub title: String,
    pub edit_id: Option<u64>,
    pub checks: Vec<UrlCheck>,
    pub update: ArticleUpdate,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub diffs: usize,
    pub pages_failed: usize,
    pub pages_skipped: usize,
    pub pages_with_citations: usize,
    pub edits_committed: usize,
    pub edits_failed: usize,
    pub url_statuses: BTreeMap<String, usize>,
    pub archive_map_size: usize,
    pub request_count: usize,
}

impl RunReport {
    fn count_checks(&mut self, checks: &[UrlCheck]) {
        for check in checks {
            *self
                .url_statuses
                .entry(check.status.as_str().to_string())
                .or_insert(0) += 1;
        }
    }
}

pub fn edit_comment(urls_archived: usize) -> String {
    if urls_archived == 1 {
        format!("Arquivamento de {urls_archived} URL")
    } else {
        format!("Arquivamento de {urls_archived} URLs")
    }
}

/// Drives one archiving run: wiki access, snapshot resolution and outcome recording.
pub struct Archiver<A, S, R> {
    api: A,
    resolver: ArchiveResolver<S>,
    recorder: R,
    settings: PipelineSettings,
}

impl<A, S, R> Archiver<A, S, R>
where
    A: WikiWriteApi,
    S: SnapshotApi,
    R: CheckRecorder,
{
    pub fn new(
        api: A,
        resolver: ArchiveResolver<S>,
        recorder: R,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            api,
            resolver,
            recorder,
            settings,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn resolver(&self) -> &ArchiveResolver<S> {
        &self.resolver
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Resolves every cited URL of `wikitext` not yet in `map` and stores the rewritten citations.
    pub fn build_archive_map(
        &mut self,
        wikitext: &str,
        article: &ArticleCheck,
        map: &mut ArchiveMap,
    ) -> Vec<UrlCheck> {
        let mut checks = Vec::new();
        for (url, templates) in group_by_url(citation::extract(wikitext)) {
            let mut check = UrlCheck::running(&url);
            self.record_url(article, &check);
            if let Err(error) = self.settle_url(&article.title, &templates, map, &mut check) {
                warn!(url = %url, error = %format!("{error:#}"), "url check left unsettled");
            }
            self.record_url(article, &check);
            checks.push(check);
        }
        checks
    }

    fn settle_url(
        &mut self,
        title: &str,
        templates: &[CitationTemplate],
        map: &mut ArchiveMap,
        check: &mut UrlCheck,
    ) -> Result<()> {
        let url = check.url.clone();
        if self.settings.is_skipped(&url) {
            debug!(title, url = %url, "url matches a skip prefix");
            return check.set_ignored_permalink();
        }
        if map.contains(&url) || templates.iter().all(CitationTemplate::has_archive) {
            debug!(title, url = %url, "url already archived");
            return check.set_ignored_archived();
        }

        let resolved = self.resolver.resolve(&url);
        let is_url_dead = !self.resolver.is_alive(&url, self.settings.probe_timeout);
        let Some(snapshot) = resolved.snapshot_url.as_deref() else {
            warn!(title, url = %url, is_url_dead, "no snapshot available");
            return check.set_failed(is_url_dead);
        };

        // later citations of the same url overwrite earlier rewrites
        let replacement = templates
            .iter()
            .filter(|template| !template.has_archive())
            .filter_map(|template| rewrite::process(title, template, snapshot, is_url_dead))
            .last();
        match replacement {
            Some(replacement) => {
                map.insert(&url, &replacement);
                info!(title, url = %url, snapshot, is_url_dead, "url archived");
                check.set_archived(snapshot, is_url_dead, &replacement)
            }
            None => {
                warn!(title, url = %url, snapshot, "snapshot could not be applied to any citation");
                check.set_failed(is_url_dead)
            }
        }
    }

    /// Replaces every mapped citation in the current page source and commits the result.
    pub fn apply_to_article(
        &mut self,
        article: &mut ArticleCheck,
        map: &ArchiveMap,
    ) -> ArticleUpdate {
        if map.is_empty() {
            return ArticleUpdate::failed(MSG_NO_TEMPLATES);
        }

        let page = match article.page_data(&mut self.api) {
            Ok(page) => page,
            Err(error) => {
                warn!(title = %article.title, error = %format!("{error:#}"), "page read failed");
                return ArticleUpdate::failed(format!("{MSG_MISSING_PAGE_DATA}: {error:#}"));
            }
        };
        let source = page.source.filter(|source| !source.is_empty());
        let latest_id = page.latest_id.filter(|id| *id != 0);
        let (Some(source), Some(latest_id)) = (source, latest_id) else {
            return ArticleUpdate::failed(MSG_MISSING_PAGE_DATA);
        };

        let (updated, urls_archived) = splice_replacements(&article.title, &source, map);
        if urls_archived == 0 || updated == source {
            return ArticleUpdate::failed(MSG_UNCHANGED);
        }

        let comment = edit_comment(urls_archived);
        match article.edit_and_save(&mut self.api, &updated, &comment, latest_id) {
            Ok(()) => {
                info!(
                    title = %article.title,
                    urls_archived,
                    edit_id = ?article.edit_id,
                    "article updated"
                );
                ArticleUpdate {
                    success: true,
                    message: format!("{} successfully updated archived templates", article.title),
                    urls_archived,
                }
            }
            Err(error) => {
                warn!(title = %article.title, error = %format!("{error:#}"), "edit failed");
                ArticleUpdate::failed(format!("failed to commit edit: {error:#}"))
            }
        }
    }

    /// Archives the citations of one article's current source.
    pub fn process_article(&mut self, title: &str, map: &mut ArchiveMap) -> Result<ArticleReport> {
        let mut article = ArticleCheck::new(title, self.api.site());
        self.record_article(&mut article);

        let Some(source) = article.source(&mut self.api)? else {
            bail!("page {title} has no source");
        };
        let checks = self.build_archive_map(&source, &article, map);
        let update = self.apply_to_article(&mut article, map);
        self.record_article(&mut article);

        Ok(ArticleReport {
            title: article.title,
            edit_id: article.edit_id,
            checks,
            update,
        })
    }

    pub fn run_on_diffs(&mut self, diffs: &[Diff], map: &mut ArchiveMap) -> RunReport {
        let mut report = RunReport {
            diffs: diffs.len(),
            ..RunReport::default()
        };

        for diff in diffs {
            let mut article = ArticleCheck::from_diff(diff);
            self.record_article(&mut article);

            let inserted = match inserted_wikitext(&mut self.api, diff) {
                Ok(inserted) => inserted,
                Err(error) => {
                    warn!(title = %diff.title, error = %format!("{error:#}"), "diff unavailable, skipping page");
                    report.pages_failed += 1;
                    continue;
                }
            };
            if !citation::has_citations(&inserted) {
                debug!(title = %diff.title, "no citations inserted");
                report.pages_skipped += 1;
                continue;
            }
            report.pages_with_citations += 1;

            let source = match article.source(&mut self.api) {
                Ok(Some(source)) => source,
                Ok(None) => {
                    warn!(title = %diff.title, "page has no source, skipping");
                    report.pages_failed += 1;
                    continue;
                }
                Err(error) => {
                    warn!(title = %diff.title, error = %format!("{error:#}"), "page read failed, skipping");
                    report.pages_failed += 1;
                    continue;
                }
            };

            let checks = self.build_archive_map(&source, &article, map);
            report.count_checks(&checks);

            let update = self.apply_to_article(&mut article, map);
            if update.success {
                report.edits_committed += 1;
            } else if update.message.starts_with("failed to commit edit") {
                report.edits_failed += 1;
            } else {
                debug!(title = %diff.title, message = %update.message, "article not edited");
            }
            self.record_article(&mut article);
        }

        report.archive_map_size = map.len();
        report.request_count = self.api.request_count();
        info!(
            diffs = report.diffs,
            with_citations = report.pages_with_citations,
            edits = report.edits_committed,
            failed = report.pages_failed,
            "run finished"
        );
        report
    }

    /// Fetches the change feed for `window` and runs over every changed page.
    pub fn run_window(&mut self, window: &ChangeWindow, map: &mut ArchiveMap) -> Result<RunReport> {
        let diffs = fetch_diffs(&mut self.api, window)?;
        let mut report = self.run_on_diffs(&diffs, map);
        report.window_start = Some(window.rcend());
        report.window_end = Some(window.rcstart());
        Ok(report)
    }

    fn record_article(&mut self, article: &mut ArticleCheck) {
        if let Err(error) = self.recorder.record_article(article) {
            warn!(title = %article.title, error = %format!("{error:#}"), "failed to record article check");
        }
    }

    fn record_url(&mut self, article: &ArticleCheck, check: &UrlCheck) {
        if let Err(error) = self.recorder.record_url(article, check) {
            warn!(url = %check.url, error = %format!("{error:#}"), "failed to record url check");
        }
    }
}

/// Citations with a usable url, grouped by url in first-seen order.
fn group_by_url(templates: Vec<CitationTemplate>) -> Vec<(String, Vec<CitationTemplate>)> {
    let mut groups: Vec<(String, Vec<CitationTemplate>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for template in templates {
        let Some(url) = template.url().map(ToString::to_string) else {
            continue;
        };
        match positions.get(&url) {
            Some(index) => groups[*index].1.push(template),
            None => {
                positions.insert(url.clone(), groups.len());
                groups.push((url, vec![template]));
            }
        }
    }
    groups
}

/// Rebuilds `source` with mapped replacements. Citations that already carry archive
/// fields are kept, as is anything nested inside a replaced citation.
fn splice_replacements(title: &str, source: &str, map: &ArchiveMap) -> (String, usize) {
    let mut output = String::with_capacity(source.len());
    let mut cursor = 0usize;
    let mut replaced_urls = BTreeSet::new();

    for template in citation::extract(source) {
        if template.span.start < cursor || template.has_archive() {
            continue;
        }
        let Some(url) = template.url() else {
            continue;
        };
        let Some(raw) = map.get(url) else {
            continue;
        };
        let Some(replacement) = citation::parse(raw) else {
            warn!(title, url, "stored replacement is not a single template, skipping");
            continue;
        };

        output.push_str(&source[cursor..template.span.start]);
        output.push_str(&replacement.to_wikitext());
        cursor = template.span.end;
        replaced_urls.insert(url.to_string());
    }
    output.push_str(&source[cursor..]);
    (output, replaced_urls.len())
}
