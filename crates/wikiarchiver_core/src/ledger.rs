use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::checks::{ArticleCheck, CheckRecorder, UrlCheck, UrlStatus};

const LEDGER_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS article_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    site TEXT NOT NULL,
    diff_old_id INTEGER,
    diff_new_id INTEGER,
    edit_id INTEGER,
    created_at_unix INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_article_checks_title ON article_checks(title);

CREATE TABLE IF NOT EXISTS url_checks (
    article_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    archive_url TEXT,
    is_url_dead INTEGER NOT NULL,
    replacement TEXT,
    updated_at_unix INTEGER NOT NULL,
    PRIMARY KEY (article_id, url),
    FOREIGN KEY (article_id) REFERENCES article_checks(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_url_checks_status ON url_checks(status);
CREATE INDEX IF NOT EXISTS idx_url_checks_url ON url_checks(url);
"#;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerSummary {
    pub db_path: String,
    pub articles: usize,
    pub edited_articles: usize,
    pub url_statuses: BTreeMap<String, usize>,
}

/// SQLite-backed record of every article and URL a run touched.
pub struct SqliteLedger {
    connection: Connection,
    db_path: PathBuf,
}

impl SqliteLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database parent directory {}",
                    parent.display()
                )
            })?;
        }
        let connection = open_connection(db_path)?;
        initialize_schema(&connection)?;
        Ok(Self {
            connection,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Latest rewritten citation per archived URL, oldest first.
    pub fn archive_map_entries(&self) -> Result<Vec<(String, String)>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT url, replacement
                 FROM url_checks
                 WHERE status = ?1 AND replacement IS NOT NULL
                 ORDER BY updated_at_unix ASC, rowid ASC",
            )
            .context("failed to prepare archived url query")?;
        let rows = statement
            .query_map([UrlStatus::Archived.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to query archived urls")?;

        let mut entries: Vec<(String, String)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let (url, replacement) = row.context("failed to decode archived url row")?;
            match positions.get(&url) {
                Some(index) => entries[*index].1 = replacement,
                None => {
                    positions.insert(url.clone(), entries.len());
                    entries.push((url, replacement));
                }
            }
        }
        Ok(entries)
    }

    pub fn url_status_counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut statement = self
            .connection
            .prepare("SELECT status, COUNT(*) FROM url_checks GROUP BY status ORDER BY status")
            .context("failed to prepare url status query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("failed to query url statuses")?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.context("failed to decode url status row")?;
            counts.insert(
                status,
                usize::try_from(count).context("count does not fit into usize")?,
            );
        }
        Ok(counts)
    }

    pub fn summary(&self) -> Result<LedgerSummary> {
        Ok(LedgerSummary {
            db_path: normalize_path(&self.db_path),
            articles: count_query(&self.connection, "SELECT COUNT(*) FROM article_checks")?,
            edited_articles: count_query(
                &self.connection,
                "SELECT COUNT(*) FROM article_checks WHERE edit_id IS NOT NULL",
            )?,
            url_statuses: self.url_status_counts()?,
        })
    }
}

impl CheckRecorder for SqliteLedger {
    fn record_article(&mut self, article: &mut ArticleCheck) -> Result<()> {
        let now = unix_timestamp()?;
        let diff_old_id = sql_id(article.diff_old_id)?;
        let diff_new_id = sql_id(article.diff_new_id)?;
        let edit_id = sql_id(article.edit_id)?;

        match article.id {
            Some(id) => {
                let updated = self
                    .connection
                    .execute(
                        "UPDATE article_checks
                         SET title = ?2, site = ?3, diff_old_id = ?4, diff_new_id = ?5,
                             edit_id = ?6, updated_at_unix = ?7
                         WHERE id = ?1",
                        params![
                            id,
                            article.title,
                            article.site,
                            diff_old_id,
                            diff_new_id,
                            edit_id,
                            now
                        ],
                    )
                    .with_context(|| format!("failed to update article check {id}"))?;
                if updated == 0 {
                    bail!("article check {id} does not exist");
                }
            }
            None => {
                self.connection
                    .execute(
                        "INSERT INTO article_checks (
                            title,
                            site,
                            diff_old_id,
                            diff_new_id,
                            edit_id,
                            created_at_unix,
                            updated_at_unix
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                        params![
                            article.title,
                            article.site,
                            diff_old_id,
                            diff_new_id,
                            edit_id,
                            now
                        ],
                    )
                    .with_context(|| format!("failed to insert article check for {}", article.title))?;
                article.id = Some(self.connection.last_insert_rowid());
            }
        }
        Ok(())
    }

    fn record_url(&mut self, article: &ArticleCheck, check: &UrlCheck) -> Result<()> {
        let Some(article_id) = article.id else {
            bail!("article check for {} has not been recorded", article.title);
        };
        self.connection
            .execute(
                "INSERT INTO url_checks (
                    article_id,
                    url,
                    status,
                    archive_url,
                    is_url_dead,
                    replacement,
                    updated_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(article_id, url) DO UPDATE SET
                    status = excluded.status,
                    archive_url = excluded.archive_url,
                    is_url_dead = excluded.is_url_dead,
                    replacement = excluded.replacement,
                    updated_at_unix = excluded.updated_at_unix",
                params![
                    article_id,
                    check.url,
                    check.status.as_str(),
                    check.archive_url,
                    if check.is_url_dead { 1i64 } else { 0i64 },
                    check.replacement,
                    unix_timestamp()?
                ],
            )
            .with_context(|| format!("failed to record url check for {}", check.url))?;
        Ok(())
    }
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(LEDGER_SCHEMA_SQL)
        .context("failed to initialize ledger schema")
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

fn sql_id(value: Option<u64>) -> Result<Option<i64>> {
    value
        .map(|id| i64::try_from(id).with_context(|| format!("revision id {id} exceeds i64")))
        .transpose()
}

fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
