//! examindex CLI: index exam documents, align question papers with mark
//! schemes, tag questions with specification references.
//!
//! Usage:
//!   examindex index add <metadata.json> --content <ocr.json>   (extracts missing metadata)
//!   examindex index rebuild
//!   examindex index search [--subject S] [--year Y] [--qualification Q] [--unit U] [--type T] [query]
//!   examindex index related <id>
//!   examindex align <qp-id> <ms-id>
//!   examindex align-all
//!   examindex tag

use clap::{Parser, Subcommand, ValueEnum};
use examindex::config::Backend;
use examindex::index::{ReconcileSummary, ResolveReport};
use examindex::pipeline::open_persistence;
use examindex::{
    AlignedExam, CancellationToken, Config, DocumentMetadata, DocumentType, ExamPipeline,
    IndexEntry, IndexSearcher, IndexStore, JobOutcome, LlmClient, Question, SearchQuery,
    SpecTagger, SubprocessClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "examindex",
    version,
    about = "Exam paper alignment and hierarchical index"
)]
struct Cli {
    /// Config file (defaults to $EXAMINDEX_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Data directory holding the index and OCR files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Use a SQLite database at this path instead of JSON files
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Concurrent alignments for align-all
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the document index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Align one question paper with its mark scheme
    Align {
        /// Question paper id
        question_paper: String,
        /// Mark scheme id
        mark_scheme: String,
    },
    /// Align every paired unit in the index
    AlignAll,
    /// Tag aligned questions with specification references
    Tag,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Add or refresh a document from its metadata file
    Add {
        /// Metadata JSON; extracted with the model and written here if missing
        metadata: PathBuf,
        /// OCR JSON for the document, relative to the data directory
        #[arg(long)]
        content: String,
    },
    /// Re-run pairing and rebuild the hierarchical index
    Rebuild,
    /// Search entries
    Search {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        qualification: Option<String>,
        #[arg(long)]
        unit: Option<String>,
        #[arg(long = "type", value_enum)]
        doc_type: Option<DocTypeArg>,
        /// Substring of the id or exam paper title
        query: Option<String>,
    },
    /// Show documents related to an id
    Related { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum DocTypeArg {
    QuestionPaper,
    MarkScheme,
}

impl From<DocTypeArg> for DocumentType {
    fn from(arg: DocTypeArg) -> Self {
        match arg {
            DocTypeArg::QuestionPaper => DocumentType::QuestionPaper,
            DocTypeArg::MarkScheme => DocumentType::MarkScheme,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, String> {
    let mut config = Config::load(cli.config.as_deref()).map_err(|e| e.to_string())?;
    if let Some(dir) = &cli.data_dir {
        config.index.data_dir = dir.clone();
    }
    if let Some(db) = &cli.db {
        config.index.backend = Backend::Sqlite;
        config.index.database = Some(db.clone());
    }
    if let Some(workers) = cli.workers {
        config.batch.workers = workers;
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<IndexStore, String> {
    let persistence = open_persistence(config).map_err(|e| format!("Failed to open index: {}", e))?;
    IndexStore::load(persistence).map_err(|e| format!("Failed to load index: {}", e))
}

fn llm_client(config: &Config) -> Result<Arc<dyn LlmClient>, String> {
    let client = SubprocessClient::from_command(&config.llm.command, Duration::from_secs(config.llm.timeout_secs))
        .map_err(|e| format!("{} (set llm.command in the config file)", e))?;
    Ok(Arc::new(client))
}

fn open_pipeline(config: &Config) -> Result<ExamPipeline, String> {
    let client = llm_client(config)?;
    ExamPipeline::from_config(config, client).map_err(|e| e.to_string())
}

fn print_summary(links: &ResolveReport, summary: &ReconcileSummary) {
    println!(
        "{} units, {} documents ({} new links)",
        summary.units,
        summary.documents,
        links.links.len()
    );
    for conflict in &links.conflicts {
        println!(
            "  pairing conflict for {}: kept {:?}, rejected {:?}",
            conflict.entry_id, conflict.chosen, conflict.rejected
        );
    }
    for conflict in summary.unit_conflicts.iter().filter(|c| !c.resolved) {
        println!(
            "  unit conflict: {} says {}, {} says {}",
            conflict.entry_id, conflict.entry_unit, conflict.partner_id, conflict.partner_unit
        );
    }
    for ambiguous in &summary.ambiguous {
        println!("  unassigned: {} ({})", ambiguous.entry_id, ambiguous.slot);
    }
}

fn print_entry(entry: &IndexEntry) {
    println!(
        "{}\t{}\t{}\t{}\t{}\tunit {}",
        entry.id,
        entry.doc_type,
        entry.year,
        entry.qualification,
        entry.subject,
        entry.unit_number.as_deref().unwrap_or("?")
    );
}

fn print_aligned(aligned: &AlignedExam) {
    let record = &aligned.record;
    println!(
        "{}: {} questions ({} parts), {} marks in {} steps",
        record.slot,
        record.questions.len(),
        record.questions.iter().map(Question::leaf_count).sum::<usize>(),
        record.total_marks(),
        aligned.steps
    );
    for skipped in &aligned.skipped {
        println!(
            "  skipped window at pages {}/{}: {}",
            skipped.question_paper_index, skipped.mark_scheme_index, skipped.last_error
        );
    }
    for incomplete in &aligned.incomplete {
        println!("  incomplete question {} ({})", incomplete.number, incomplete.missing);
    }
    if !aligned.media.is_empty() {
        println!("  {} media references unresolved", aligned.media.len());
    }
}

/// Metadata path as stored on an entry: relative to the data directory
/// when the file lives under it, absolute otherwise.
fn stored_metadata_path(config: &Config, metadata: &Path) -> String {
    let absolute = std::path::absolute(metadata).unwrap_or_else(|_| metadata.to_path_buf());
    let data_dir =
        std::path::absolute(&config.index.data_dir).unwrap_or_else(|_| config.index.data_dir.clone());
    absolute
        .strip_prefix(&data_dir)
        .unwrap_or(&absolute)
        .to_string_lossy()
        .into_owned()
}

async fn cmd_index_add(config: &Config, metadata: &Path, content: &str) -> i32 {
    let metadata_path = stored_metadata_path(config, metadata);
    if !metadata.exists() {
        let pipeline = match open_pipeline(config) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        return match pipeline.ingest_document(content, &metadata_path).await {
            Ok(report) => {
                println!("Extracted metadata to {}", metadata.display());
                println!("Indexed {}", report.entry.id);
                print_summary(&report.links, &report.reconcile);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        };
    }

    let store = match open_store(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let meta = match DocumentMetadata::load(metadata) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let entry = IndexEntry::from_metadata(&meta, content, &metadata_path);
    let id = entry.id.clone();
    match store.commit_entry(entry) {
        Ok((links, summary)) => {
            println!("Indexed {}", id);
            print_summary(&links, &summary);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_index_rebuild(config: &Config) -> i32 {
    let result = open_store(config).and_then(|store| store.rebuild().map_err(|e| e.to_string()));
    match result {
        Ok((links, summary)) => {
            print_summary(&links, &summary);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_index_search(config: &Config, query: SearchQuery) -> i32 {
    let store = match open_store(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let searcher = IndexSearcher::from_store(&store);
    let hits = searcher.search(&query);
    if hits.is_empty() {
        println!("No matching documents.");
    }
    for entry in hits {
        print_entry(entry);
    }
    0
}

fn cmd_index_related(config: &Config, id: &str) -> i32 {
    let store = match open_store(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let searcher = IndexSearcher::from_store(&store);
    if searcher.find_document(id).is_none() {
        eprintln!("Error: document '{}' not found", id);
        return 1;
    }
    if let Some(slot) = searcher.locate_slot(id) {
        println!("Slot: {}", slot);
    }
    for entry in searcher.find_related(id) {
        print_entry(entry);
    }
    0
}

async fn cmd_align(config: &Config, question_paper: &str, mark_scheme: &str) -> i32 {
    let pipeline = match open_pipeline(config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match pipeline.align_pair(question_paper, mark_scheme).await {
        Ok(aligned) => {
            print_aligned(&aligned);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_align_all(config: &Config) -> i32 {
    let cancel = CancellationToken::new();
    let pipeline = match open_pipeline(config) {
        Ok(p) => p.with_cancellation(cancel.clone()),
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: finishing documents in progress");
            on_interrupt.cancel();
        }
    });

    let report = match pipeline.align_all().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    for outcome in &report.outcomes {
        match outcome {
            JobOutcome::Completed { output, .. } => print_aligned(output),
            JobOutcome::Failed { job_id, error } => println!("{}: failed: {}", job_id, error),
            JobOutcome::Cancelled { job_id } => println!("{}: cancelled", job_id),
        }
    }
    println!(
        "Run {}: {} aligned, {} failed, {} cancelled",
        report.run_id,
        report.completed().count(),
        report.failed_count(),
        report.cancelled_count()
    );
    if report.failed_count() > 0 {
        1
    } else {
        0
    }
}

async fn cmd_tag(config: &Config) -> i32 {
    let client = match llm_client(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let mut tagger = SpecTagger::new(Arc::clone(&client));
    for (qualification, path) in &config.tagging.specifications {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            config.index.data_dir.join(path)
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => tagger = tagger.with_specification(qualification.clone(), text),
            Err(e) => eprintln!("Warning: cannot read specification {}: {}", path.display(), e),
        }
    }
    let pipeline = match ExamPipeline::from_config(config, client) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match pipeline.tag_all(&tagger).await {
        Ok(report) => {
            println!("Tagged {} questions", report.tagged);
            for number in &report.untagged {
                println!("  untagged: {}", number);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Index { action } => match action {
            IndexAction::Add { metadata, content } => cmd_index_add(&config, &metadata, &content).await,
            IndexAction::Rebuild => cmd_index_rebuild(&config),
            IndexAction::Search {
                subject,
                year,
                qualification,
                unit,
                doc_type,
                query,
            } => {
                let mut q = SearchQuery::new();
                q.subject = subject;
                q.year = year;
                q.qualification = qualification;
                q.doc_type = doc_type.map(DocumentType::from);
                q.text = query;
                if let Some(unit) = unit {
                    q = q.with_unit(unit);
                }
                cmd_index_search(&config, q)
            }
            IndexAction::Related { id } => cmd_index_related(&config, &id),
        },
        Commands::Align {
            question_paper,
            mark_scheme,
        } => cmd_align(&config, &question_paper, &mark_scheme).await,
        Commands::AlignAll => cmd_align_all(&config).await,
        Commands::Tag => cmd_tag(&config).await,
    };
    std::process::exit(code);
}
