use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde_json::json;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use wikiarchiver_core::archive::{ArchiveResolver, WaybackClient, WaybackConfig};
use wikiarchiver_core::changes::ChangeWindow;
use wikiarchiver_core::checks::ArticleCheck;
use wikiarchiver_core::citation::{extract, extract_external_links};
use wikiarchiver_core::config::{ArchiverConfig, DEFAULT_CONFIG_FILENAME, load_config};
use wikiarchiver_core::ledger::{LedgerSummary, SqliteLedger};
use wikiarchiver_core::pipeline::{ArchiveMap, ArticleReport, Archiver, PipelineSettings, RunReport};
use wikiarchiver_core::wiki_api::{MediaWikiClient, WikiClientConfig, WikiReadApi};

#[derive(Debug, Parser)]
#[command(
    name = "wikiarchiver",
    version,
    about = "Archive the URLs cited by recently edited wiki articles"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log debug output")]
    verbose: bool,
    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Only log warnings and errors"
    )]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Archive citations inserted by recent edits")]
    Run(RunArgs),
    #[command(about = "Archive every citation of one article")]
    Article(ArticleArgs),
    #[command(about = "List external links of an article's current source")]
    Links(LinksArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "N", conflicts_with = "date", help = "Look back N hours")]
    hours: Option<u32>,
    #[arg(long, value_name = "YYYY-MM-DD", help = "Process one UTC day")]
    date: Option<NaiveDate>,
    #[arg(long, help = "Reuse citations archived by earlier runs")]
    seed_from_ledger: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ArticleArgs {
    title: String,
    #[arg(long, help = "Reuse citations archived by earlier runs")]
    seed_from_ledger: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct LinksArgs {
    title: String,
}

struct Runtime {
    config: ArchiverConfig,
    config_path: PathBuf,
    base_dir: PathBuf,
}

type LiveArchiver = Archiver<MediaWikiClient, WaybackClient, SqliteLedger>;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };

    let runtime = load_runtime(cli.config.as_deref())?;
    match command {
        Commands::Run(args) => run_window(&runtime, args),
        Commands::Article(args) => run_article(&runtime, args),
        Commands::Links(LinksArgs { title }) => run_links(&runtime, &title),
    }
}

fn run_window(runtime: &Runtime, args: RunArgs) -> Result<()> {
    let window = match args.date {
        Some(date) => ChangeWindow::for_date(date)?,
        None => ChangeWindow::last_hours(
            Utc::now(),
            args.hours.unwrap_or_else(|| runtime.config.last_hours()),
        ),
    };
    let mut archiver = build_archiver(runtime)?;
    let mut map = seed_map(&archiver, args.seed_from_ledger)?;

    info!(
        start = %window.rcend(),
        end = %window.rcstart(),
        seeded = map.len(),
        "starting run"
    );
    let report = archiver.run_window(&window, &mut map)?;
    let ledger = archiver.recorder().summary()?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "run": report, "ledger": ledger }))?
        );
    } else {
        print_run_report(&report);
        print_ledger_summary(&ledger);
    }
    Ok(())
}

fn run_article(runtime: &Runtime, args: ArticleArgs) -> Result<()> {
    let mut archiver = build_archiver(runtime)?;
    let mut map = seed_map(&archiver, args.seed_from_ledger)?;
    let report = archiver.process_article(&args.title, &mut map)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_article_report(&report);
    }
    Ok(())
}

fn run_links(runtime: &Runtime, title: &str) -> Result<()> {
    let mut api = MediaWikiClient::new(WikiClientConfig::from_config(&runtime.config))?;
    let article = ArticleCheck::new(title, api.site());
    let Some(source) = article.source(&mut api)? else {
        bail!("page {title} has no source");
    };

    let links = extract_external_links(&source);
    let citations = extract(&source);
    println!("article links");
    println!("title: {title}");
    println!("site: {}", api.site());
    println!("citations: {}", citations.len());
    println!(
        "citations_archived: {}",
        citations.iter().filter(|item| item.has_archive()).count()
    );
    println!("external_links: {}", links.len());
    for link in &links {
        println!("  - {link}");
    }
    Ok(())
}

fn build_archiver(runtime: &Runtime) -> Result<LiveArchiver> {
    let config = &runtime.config;
    if config.token().is_none() {
        warn!("WIKI_TOKEN is not set; the wiki will reject edits");
    }
    let api = MediaWikiClient::new(WikiClientConfig::from_config(config))?;
    let wayback = WaybackClient::new(WaybackConfig::from_config(config))?;
    let resolver = ArchiveResolver::new(wayback).with_archive_delay(config.archive_delay());
    let ledger = SqliteLedger::open(&config.db_path(&runtime.base_dir))?;
    info!(
        wiki = %config.wiki_url(),
        config = %normalize_path(&runtime.config_path),
        ledger = %normalize_path(ledger.db_path()),
        "archiver ready"
    );
    Ok(Archiver::new(
        api,
        resolver,
        ledger,
        PipelineSettings::from_config(config),
    ))
}

fn seed_map(archiver: &LiveArchiver, seed_from_ledger: bool) -> Result<ArchiveMap> {
    if !seed_from_ledger {
        return Ok(ArchiveMap::new());
    }
    let entries = archiver.recorder().archive_map_entries()?;
    Ok(ArchiveMap::from_entries(entries))
}

fn load_runtime(config: Option<&Path>) -> Result<Runtime> {
    dotenvy::dotenv().ok();

    let config_path = config
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let base_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let config_env = base_dir.join(".env");
    if config.is_some() && config_env.exists() {
        let _ = dotenvy::from_path_override(&config_env);
    }

    Ok(Runtime {
        config: load_config(&config_path)?,
        config_path,
        base_dir,
    })
}

fn print_run_report(report: &RunReport) {
    println!("archive run");
    println!(
        "window: {} .. {}",
        report.window_start.as_deref().unwrap_or("n/a"),
        report.window_end.as_deref().unwrap_or("n/a")
    );
    println!("diffs: {}", report.diffs);
    println!("pages_with_citations: {}", report.pages_with_citations);
    println!("pages_skipped: {}", report.pages_skipped);
    println!("pages_failed: {}", report.pages_failed);
    println!("edits_committed: {}", report.edits_committed);
    println!("edits_failed: {}", report.edits_failed);
    for (status, count) in &report.url_statuses {
        println!("urls.{status}: {count}");
    }
    println!("archive_map_size: {}", report.archive_map_size);
    println!("request_count: {}", report.request_count);
}

fn print_ledger_summary(summary: &LedgerSummary) {
    println!("ledger: {}", summary.db_path);
    println!("ledger.articles: {}", summary.articles);
    println!("ledger.edited_articles: {}", summary.edited_articles);
    for (status, count) in &summary.url_statuses {
        println!("ledger.urls.{status}: {count}");
    }
}

fn print_article_report(report: &ArticleReport) {
    println!("article: {}", report.title);
    println!("success: {}", format_flag(report.update.success));
    println!("message: {}", report.update.message);
    println!("urls_archived: {}", report.update.urls_archived);
    if let Some(edit_id) = report.edit_id {
        println!("edit_id: {edit_id}");
    }
    println!("urls: {}", report.checks.len());
    for check in &report.checks {
        let mut line = format!("  - {} [{}]", check.url, check.status.as_str());
        if let Some(archive_url) = &check.archive_url {
            line.push_str(&format!(" {archive_url}"));
        }
        if check.is_url_dead {
            line.push_str(" (dead)");
        }
        println!("{line}");
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
