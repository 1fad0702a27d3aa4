use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use registry_consolidation::{
    logging, CancellationToken, ChangeKind, ConsolidationEngine, EngineConfig, EntityFilter,
    EntityKind, EntityStatus, SourceFile,
};

#[derive(Debug, Parser)]
#[command(name = "registry-consolidation")]
#[command(about = "Consolidate company-registry dumps and report what changed", long_about = None)]
struct Cli {
    /// YAML config (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite archive, overrides `database_path` from the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest dumps as a new generation and print the change summary
    Ingest {
        /// CSV dump; append `=XX` to force the jurisdiction code
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Record kind of the --source files
        #[arg(long, default_value = "company")]
        kind: String,
    },
    /// Change set between the current and previous generation
    Diff {
        #[arg(long)]
        include_unchanged: bool,
    },
    /// Show one entity of the current generation (or its tombstone)
    Lookup { entity_id: String },
    /// List entities of the current generation, ascending entity_id
    Query {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        jurisdiction: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        name_prefix: Option<String>,
        #[arg(long)]
        after: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Rejected-rows log of one run (default: the current generation)
    Rejected {
        #[arg(long)]
        generation: Option<u64>,
    },
    /// Data-quality report for the current generation
    Quality,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &cli.database {
        config.database_path = Some(db.clone());
    }
    logging::init(config.log_profile);

    let engine = ConsolidationEngine::from_config(config)?;
    match cli.command {
        Commands::Ingest { sources, kind } => ingest(&engine, &sources, &kind, cli.json),
        Commands::Diff { include_unchanged } => show_diff(&engine, include_unchanged, cli.json),
        Commands::Lookup { entity_id } => lookup(&engine, &entity_id),
        Commands::Query {
            kind,
            jurisdiction,
            status,
            name_prefix,
            after,
            limit,
        } => {
            let mut filter = EntityFilter::new().limit(limit);
            if let Some(kind) = kind {
                filter = filter.with_kind(parse_kind(&kind)?);
            }
            if let Some(j) = jurisdiction {
                let code = engine
                    .registry()
                    .normalize(&j)
                    .with_context(|| format!("unknown jurisdiction `{}`", j))?;
                filter = filter.with_jurisdiction(&code);
            }
            if let Some(status) = status {
                filter = filter.with_status(parse_status(&status)?);
            }
            if let Some(prefix) = name_prefix {
                filter = filter.with_name_prefix(&prefix);
            }
            if let Some(after) = after {
                filter = filter.after(&after);
            }
            query(&engine, filter, cli.json)
        }
        Commands::Rejected { generation } => rejected(&engine, generation, cli.json),
        Commands::Quality => quality(&engine, cli.json),
    }
}

fn parse_kind(value: &str) -> Result<EntityKind> {
    EntityKind::parse(value).with_context(|| format!("unknown entity kind `{}`", value))
}

fn parse_status(value: &str) -> Result<EntityStatus> {
    EntityStatus::parse(value).with_context(|| {
        let names: Vec<&str> = EntityStatus::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown status `{}` (expected one of: {})", value, names.join(", "))
    })
}

/// `path` or `path=XX`
fn parse_source(value: &str, kind: EntityKind) -> SourceFile {
    match value.rsplit_once('=') {
        Some((path, jurisdiction)) => SourceFile {
            path: PathBuf::from(path),
            jurisdiction: Some(jurisdiction.to_string()),
            kind,
        },
        None => SourceFile {
            path: PathBuf::from(value),
            jurisdiction: None,
            kind,
        },
    }
}

fn ingest(
    engine: &ConsolidationEngine,
    cli_sources: &[String],
    kind: &str,
    json: bool,
) -> Result<()> {
    let kind = parse_kind(kind)?;
    let mut sources = engine.config().resolved_sources()?;
    sources.extend(cli_sources.iter().map(|s| parse_source(s, kind)));
    if sources.is_empty() {
        bail!("nothing to ingest: pass --source or configure `sources` / `input_directory`");
    }

    let summary = engine.run_sources(&sources, &CancellationToken::new())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("🗄️  Ingested {} rows from {} dumps", summary.input_rows, sources.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Generation {} (previous {})", summary.generation, summary.previous_generation);
    println!("✓ Entities:          {}", summary.entity_count);
    println!("  + added:           {}", summary.counts.added);
    println!("  ~ status changed:  {}", summary.counts.status_changed);
    println!("  ~ attr changed:    {}", summary.counts.attribute_changed);
    println!("  - removed:         {}", summary.counts.removed);
    println!("  = unchanged:       {}", summary.counts.unchanged);
    println!("⚠️  Rejected rows:     {}", summary.rejected_count);
    for row in &summary.rejected {
        println!("   {} [{}] {}", row.source, row.stage.as_str(), row.reason);
    }
    if !summary.conflicts.is_empty() {
        println!("⚠️  Identity conflicts: {}", summary.conflicts.len());
        for conflict in &summary.conflicts {
            println!("   {}", conflict);
        }
    }
    if !summary.uncertain.is_empty() {
        println!("🔍 Uncertain identities: {}", summary.uncertain.len());
    }
    if !summary.enrichment_failures.is_empty() {
        println!("⚠️  Enrichment failures: {}", summary.enrichment_failures.len());
    }
    Ok(())
}

fn show_diff(engine: &ConsolidationEngine, include_unchanged: bool, json: bool) -> Result<()> {
    let store = engine.store();
    let changes = registry_consolidation::diff(
        &store.current(),
        &store.previous(),
        include_unchanged || engine.config().include_unchanged,
    );
    if json {
        println!("{}", changes.to_canonical_json()?);
        return Ok(());
    }

    println!(
        "🔀 Generation {} → {}: {} changes, {} unchanged",
        changes.generation_from,
        changes.generation_to,
        changes.counts.total_changes(),
        changes.counts.unchanged
    );
    for record in &changes.records {
        let marker = match record.change_kind {
            ChangeKind::Added => "+",
            ChangeKind::Removed => "-",
            ChangeKind::StatusChanged | ChangeKind::AttributeChanged => "~",
            ChangeKind::Unchanged => "=",
        };
        let detail = if record.changed_fields.is_empty() {
            String::new()
        } else {
            format!(" ({})", record.changed_fields.join(", "))
        };
        println!(
            "{} {} [{}] {}{}",
            marker,
            record.entity_id,
            record.jurisdiction,
            record.change_kind.as_str(),
            detail
        );
    }
    println!("digest: {}", changes.digest()?);
    Ok(())
}

fn lookup(engine: &ConsolidationEngine, entity_id: &str) -> Result<()> {
    let current = engine.store().current();
    if let Some(entity) = current.lookup(entity_id) {
        println!("{}", serde_json::to_string_pretty(entity)?);
    } else if let Some(tombstone) = current.tombstone(entity_id) {
        println!("🪦 removed in generation {}", tombstone.removed_in);
        println!("{}", serde_json::to_string_pretty(tombstone)?);
    } else {
        bail!("`{}` not found in generation {}", entity_id, current.generation());
    }
    Ok(())
}

fn query(engine: &ConsolidationEngine, filter: EntityFilter, json: bool) -> Result<()> {
    let current = engine.store().current();
    let page = current.query(filter).collect_page();
    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    for entity in &page {
        println!(
            "{}  {:<2}  {:<17}  {}",
            entity.entity_id,
            entity.jurisdiction,
            entity.status.as_str(),
            entity.name().unwrap_or("")
        );
    }
    if let Some(last) = page.last() {
        println!("… next page: --after {}", last.entity_id);
    }
    Ok(())
}

fn rejected(engine: &ConsolidationEngine, generation: Option<u64>, json: bool) -> Result<()> {
    let current = engine.store().current();
    let generation = generation.unwrap_or(current.generation());
    let rows = if generation == current.generation() {
        current.rejected().to_vec()
    } else {
        match engine.store().archive() {
            Some(archive) => archive.rejected_rows(generation)?,
            None => bail!("generation {} is not retained in memory; use --database", generation),
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("⚠️  Generation {}: {} rejected rows", generation, rows.len());
    for row in &rows {
        println!("   {} [{}] {}", row.source, row.stage.as_str(), row.reason);
    }
    Ok(())
}

fn quality(engine: &ConsolidationEngine, json: bool) -> Result<()> {
    let report = engine.quality_report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("✅ {}", report.summary());
    for (field, stats) in &report.completeness {
        println!("   {:<32} {:>6.2}%", field, stats.completeness_pct);
    }
    for issue in &report.issues {
        println!("   {:?}: {} - {}", issue.severity, issue.field, issue.issue);
    }
    Ok(())
}
