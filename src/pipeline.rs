//! End-to-end processing: ingest, align, tag
//!
//! `ExamPipeline` ties the index store to the aligner. Alignment of a pair
//! never writes the tree itself; records are collected first and a single
//! reconciliation pass follows, so the store keeps one writer.
//!
//! Ingesting a document whose metadata file does not exist yet asks the
//! model for the metadata and writes the file before indexing.

use crate::align::{
    DroppedQuestion, IncompleteAlignment, MediaAssociator, MediaDiagnostic, MergeConflict,
    PromptBuilder, RetryPolicy, SkippedWindow, SlidingWindowAligner, WindowError,
};
use crate::batch::{BatchReport, BatchRunner, CancellationToken, JobOutcome, DEFAULT_WORKERS};
use crate::config::{Backend, Config, ConfigError};
use crate::index::{ExamRecord, IndexSearcher, IndexStore, ReconcileSummary, ResolveReport};
use crate::llm::{LlmClient, LlmError};
use crate::metadata::{DocumentMetadata, MetadataError, MetadataExtractor};
use crate::model::{IndexEntry, Page, UnitSlot};
use crate::source::{DocumentError, DocumentSource, FsDocumentSource};
use crate::storage::{
    IndexPersistence, JsonFileLayout, JsonFileStore, OpenStore, SqliteStore, StorageError,
};
use crate::tagging::{SpecTagger, TaggingReport};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Document not in index: {0}")]
    UnknownDocument(String),

    #[error("Document {0} has no unit slot; run `index rebuild` first")]
    NotPlaced(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A pair of documents to align, and where the result belongs.
#[derive(Debug, Clone)]
pub struct AlignJob {
    pub slot: UnitSlot,
    pub question_paper: IndexEntry,
    pub mark_scheme: IndexEntry,
}

/// Output of aligning one pair: the record plus everything worth reporting.
#[derive(Debug, Clone)]
pub struct AlignedExam {
    pub record: ExamRecord,
    pub steps: usize,
    pub skipped: Vec<SkippedWindow>,
    pub incomplete: Vec<IncompleteAlignment>,
    pub dropped: Vec<DroppedQuestion>,
    pub conflicts: Vec<MergeConflict>,
    pub media: Vec<MediaDiagnostic>,
}

/// Result of `ExamPipeline::ingest_entry`.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub entry: IndexEntry,
    pub links: ResolveReport,
    pub reconcile: ReconcileSummary,
}

/// Everything a job needs, cheap to clone into each batch task.
#[derive(Clone)]
struct PairAligner {
    aligner: Arc<SlidingWindowAligner>,
    source: Arc<dyn DocumentSource>,
    metadata_root: Option<PathBuf>,
    associator: MediaAssociator,
}

impl PairAligner {
    async fn align(&self, job: AlignJob) -> PipelineResult<AlignedExam> {
        let question_paper = self.source.load_pages(&job.question_paper.content_path).await?;
        let mark_scheme = self.source.load_pages(&job.mark_scheme.content_path).await?;

        let qp_start = self
            .start_index(&job.question_paper, |m| m.question_start_index)
            .await
            .map_or(0, |index| position_of(&question_paper, index));
        let ms_start = self
            .start_index(&job.mark_scheme, |m| m.mark_scheme_start_index)
            .await
            .map_or(0, |index| position_of(&mark_scheme, index));

        info!(
            question_paper = %job.question_paper.id,
            mark_scheme = %job.mark_scheme.id,
            qp_pages = question_paper.len(),
            ms_pages = mark_scheme.len(),
            "aligning exam"
        );
        let outcome = self
            .aligner
            .start(&question_paper, &mark_scheme)
            .starting_at(qp_start, ms_start)
            .run()
            .await?;
        let media = self.associator.associate(&outcome.questions, &question_paper);

        Ok(AlignedExam {
            record: ExamRecord {
                slot: job.slot,
                question_paper_id: job.question_paper.id,
                mark_scheme_id: job.mark_scheme.id,
                questions: media.questions,
            },
            steps: outcome.steps,
            skipped: outcome.skipped,
            incomplete: outcome.incomplete,
            dropped: outcome.dropped,
            conflicts: outcome.conflicts,
            media: media.diagnostics,
        })
    }

    async fn start_index(
        &self,
        entry: &IndexEntry,
        field: fn(&DocumentMetadata) -> Option<usize>,
    ) -> Option<usize> {
        let path = self.metadata_root.as_ref()?.join(&entry.metadata_path);
        match DocumentMetadata::read(&path).await {
            Ok(meta) => field(&meta),
            Err(e) => {
                debug!(entry_id = %entry.id, error = %e, "no start index from metadata");
                None
            }
        }
    }
}

/// Slice position of the first page at or after page `index`
fn position_of(pages: &[Page], index: usize) -> usize {
    pages.iter().position(|p| p.index >= index).unwrap_or(pages.len())
}

pub struct ExamPipeline {
    store: Arc<IndexStore>,
    pairs: PairAligner,
    extractor: MetadataExtractor,
    workers: usize,
    cancel: CancellationToken,
}

impl ExamPipeline {
    pub fn new(store: Arc<IndexStore>, source: Arc<dyn DocumentSource>, client: Arc<dyn LlmClient>) -> Self {
        Self {
            store,
            pairs: PairAligner {
                aligner: Arc::new(SlidingWindowAligner::new(Arc::clone(&client))),
                source,
                metadata_root: None,
                associator: MediaAssociator::new(),
            },
            extractor: MetadataExtractor::new(client),
            workers: DEFAULT_WORKERS,
            cancel: CancellationToken::new(),
        }
    }

    /// Open the configured backend, load the index and build the aligner
    /// from the configuration.
    pub fn from_config(config: &Config, client: Arc<dyn LlmClient>) -> PipelineResult<Self> {
        let store = Arc::new(IndexStore::load(open_persistence(config)?)?);
        let source = Arc::new(FsDocumentSource::new(&config.index.data_dir));
        let extractor = MetadataExtractor::new(Arc::clone(&client)).with_max_scan_pages(config.metadata.max_scan_pages);
        let aligner = SlidingWindowAligner::new(client)
            .with_window_size(config.alignment.window_size)
            .with_retry_policy(RetryPolicy {
                max_attempts: config.alignment.max_attempts,
            })
            .with_prompt_builder(
                PromptBuilder::new().with_strict_json_note(config.alignment.strict_json_note.clone()),
            );

        Ok(Self {
            store,
            pairs: PairAligner {
                aligner: Arc::new(aligner),
                source,
                metadata_root: Some(config.index.data_dir.clone()),
                associator: MediaAssociator::new(),
            },
            extractor,
            workers: config.batch.workers,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_aligner(mut self, aligner: SlidingWindowAligner) -> Self {
        self.pairs.aligner = Arc::new(aligner);
        self
    }

    /// Directory that entry metadata paths are relative to
    pub fn with_metadata_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.pairs.metadata_root = Some(root.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn searcher(&self) -> IndexSearcher {
        IndexSearcher::from_store(&self.store)
    }

    /// Add or refresh one document and bring the tree up to date.
    pub fn ingest_entry(&self, entry: IndexEntry) -> PipelineResult<IngestReport> {
        let id = entry.id.clone();
        let (links, reconcile) = self.store.commit_entry(entry)?;
        let entry = self.store.entry(&id).ok_or(PipelineError::UnknownDocument(id))?;
        Ok(IngestReport {
            entry,
            links,
            reconcile,
        })
    }

    /// Index the OCR document at `content_path` from its metadata file.
    ///
    /// A missing metadata file is produced by the extractor from the
    /// document's first pages and written to `metadata_path`, so later
    /// ingests and alignments read it instead of asking again.
    pub async fn ingest_document(&self, content_path: &str, metadata_path: &str) -> PipelineResult<IngestReport> {
        let file = match &self.pairs.metadata_root {
            Some(root) => root.join(metadata_path),
            None => PathBuf::from(metadata_path),
        };
        let meta = match DocumentMetadata::read(&file).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => {
                info!(content_path, metadata = %file.display(), "no metadata file; extracting");
                let pages = self.pairs.source.load_pages(content_path).await?;
                let meta = self.extractor.extract(&pages).await?;
                meta.write(&file).await?;
                meta
            }
            Err(e) => return Err(e.into()),
        };
        self.ingest_entry(IndexEntry::from_metadata(&meta, content_path, metadata_path))
    }

    /// Align one question paper against one mark scheme and store the result.
    pub async fn align_pair(&self, question_paper_id: &str, mark_scheme_id: &str) -> PipelineResult<AlignedExam> {
        let job = self.job_for(question_paper_id, mark_scheme_id)?;
        let aligned = self.pairs.align(job).await?;
        self.store.record_exam(aligned.record.clone())?;
        self.store.reconcile();
        self.store.save()?;
        Ok(aligned)
    }

    fn job_for(&self, question_paper_id: &str, mark_scheme_id: &str) -> PipelineResult<AlignJob> {
        let searcher = self.searcher();
        let lookup = |id: &str| {
            searcher
                .find_document(id)
                .cloned()
                .ok_or_else(|| PipelineError::UnknownDocument(id.to_string()))
        };
        let question_paper = lookup(question_paper_id)?;
        let mark_scheme = lookup(mark_scheme_id)?;
        let slot = searcher
            .locate_slot(&question_paper.id)
            .ok_or_else(|| PipelineError::NotPlaced(question_paper.id.clone()))?;
        Ok(AlignJob {
            slot,
            question_paper,
            mark_scheme,
        })
    }

    /// Align every paired unit slot concurrently, then reconcile once.
    ///
    /// A record that cannot be stored turns its job into a failure; the
    /// other records are still reconciled and saved.
    pub async fn align_all(&self) -> PipelineResult<BatchReport<AlignedExam>> {
        let jobs: Vec<(String, AlignJob)> = self
            .searcher()
            .exam_pairs()
            .into_iter()
            .map(|pair| {
                (
                    pair.slot.to_string(),
                    AlignJob {
                        slot: pair.slot,
                        question_paper: pair.question_paper,
                        mark_scheme: pair.mark_scheme,
                    },
                )
            })
            .collect();

        let pairs = self.pairs.clone();
        let mut report = BatchRunner::new(self.workers)
            .with_cancellation(self.cancel.clone())
            .run(jobs, move |job| {
                let pairs = pairs.clone();
                async move { pairs.align(job).await }
            })
            .await;

        for outcome in &mut report.outcomes {
            let JobOutcome::Completed { job_id, output } = &*outcome else {
                continue;
            };
            if let Err(e) = self.store.record_exam(output.record.clone()) {
                warn!(job_id = %job_id, error = %e, "could not store exam record");
                *outcome = JobOutcome::Failed {
                    job_id: job_id.clone(),
                    error: format!("storing exam record: {}", e),
                };
            }
        }
        let summary = self.store.reconcile();
        self.store.save()?;
        info!(units = summary.units, "index updated after batch alignment");
        Ok(report)
    }

    /// Tag every stored exam record with specification references.
    pub async fn tag_all(&self, tagger: &SpecTagger) -> PipelineResult<TaggingReport> {
        let mut total = TaggingReport::default();
        for mut record in self.store.exam_records() {
            if self.cancel.is_cancelled() {
                warn!("tagging cancelled");
                break;
            }
            let report = tagger.tag_record(&mut record).await;
            total.tagged += report.tagged;
            total.untagged.extend(report.untagged);
            self.store.record_exam(record)?;
        }
        self.store.reconcile();
        self.store.save()?;
        Ok(total)
    }
}

/// Persistence backend selected by the configuration
pub fn open_persistence(config: &Config) -> PipelineResult<Arc<dyn IndexPersistence>> {
    Ok(match config.index.backend {
        Backend::Json => Arc::new(JsonFileStore::with_layout(
            &config.index.data_dir,
            JsonFileLayout {
                index_file: config.index.index_file.clone(),
                hierarchical_file: config.index.hierarchical_file.clone(),
                exam_records_file: config.index.exam_records_file.clone(),
            },
        )),
        Backend::Sqlite => Arc::new(SqliteStore::open(config.index.database_path())?),
    })
}
