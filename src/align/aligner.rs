//! Sliding-window alignment of a question paper with its mark scheme
//!
//! One run owns an `AlignmentCursor` with independent positions in the two
//! documents. Each step shows the model a window of each, assembles the
//! reply, merges the questions and moves the cursors forward:
//!
//! ```text
//! Running ──step──▶ Running ──step──▶ ... ──both windows empty──▶ Done
//! ```
//!
//! Cursors never move backwards. A step either moves at least one cursor or
//! forces both forward, so a run over documents of `n` and `m` pages ends in
//! at most `n + m` steps plus the final empty-window check.

use super::assembler::{DroppedQuestion, ResponseAssembler};
use super::merge::{IncompleteAlignment, MergeConflict, QuestionAccumulator};
use super::prompt::PromptBuilder;
use super::window::{ContentWindow, ContentWindowBuilder, WindowError};
use crate::llm::LlmClient;
use crate::model::{top_level_number, Page, Question};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Position of one alignment run in both documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentCursor {
    pub question_paper_index: usize,
    pub mark_scheme_index: usize,
    pub next_question_number: String,
}

impl Default for AlignmentCursor {
    fn default() -> Self {
        Self {
            question_paper_index: 0,
            mark_scheme_index: 0,
            next_question_number: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignerState {
    Running,
    Done,
}

/// How many times one window is tried before it is skipped.
///
/// The first attempt uses the plain prompt; later attempts append the
/// strict-JSON note. Transport failures count the same as malformed replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

/// A window given up on after every attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedWindow {
    pub question_paper_index: usize,
    pub mark_scheme_index: usize,
    pub attempts: u32,
    pub last_error: String,
}

/// Everything one run produced.
#[derive(Debug, Clone, Default)]
pub struct AlignmentOutcome {
    /// Completed top-level questions, in order of first appearance
    pub questions: Vec<Question>,
    pub skipped: Vec<SkippedWindow>,
    pub incomplete: Vec<IncompleteAlignment>,
    pub dropped: Vec<DroppedQuestion>,
    pub conflicts: Vec<MergeConflict>,
    pub steps: usize,
}

/// Drives alignment runs against an LLM collaborator.
pub struct SlidingWindowAligner {
    client: Arc<dyn LlmClient>,
    windows: ContentWindowBuilder,
    prompts: PromptBuilder,
    assembler: ResponseAssembler,
    retry: RetryPolicy,
}

impl SlidingWindowAligner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            windows: ContentWindowBuilder::default(),
            prompts: PromptBuilder::default(),
            assembler: ResponseAssembler::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.windows = ContentWindowBuilder::new(window_size);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Begin a step-by-step run over one document pair.
    pub fn start<'a>(&'a self, question_paper: &'a [Page], mark_scheme: &'a [Page]) -> AlignmentRun<'a> {
        AlignmentRun {
            aligner: self,
            question_paper,
            mark_scheme,
            cursor: AlignmentCursor::default(),
            state: AlignerState::Running,
            accumulator: QuestionAccumulator::new(),
            skipped: Vec::new(),
            dropped: Vec::new(),
            steps: 0,
        }
    }

    /// Run to completion from the first page of each document.
    pub async fn align(&self, question_paper: &[Page], mark_scheme: &[Page]) -> Result<AlignmentOutcome, WindowError> {
        self.start(question_paper, mark_scheme).run().await
    }
}

/// State of a single alignment run.
pub struct AlignmentRun<'a> {
    aligner: &'a SlidingWindowAligner,
    question_paper: &'a [Page],
    mark_scheme: &'a [Page],
    cursor: AlignmentCursor,
    state: AlignerState,
    accumulator: QuestionAccumulator,
    skipped: Vec<SkippedWindow>,
    dropped: Vec<DroppedQuestion>,
    steps: usize,
}

impl<'a> AlignmentRun<'a> {
    /// Start from the given pages instead of the first ones (clamped to each document's length).
    pub fn starting_at(mut self, question_paper_index: usize, mark_scheme_index: usize) -> Self {
        self.cursor.question_paper_index = question_paper_index.min(self.question_paper.len());
        self.cursor.mark_scheme_index = mark_scheme_index.min(self.mark_scheme.len());
        self
    }

    pub fn cursor(&self) -> &AlignmentCursor {
        &self.cursor
    }

    pub fn state(&self) -> AlignerState {
        self.state
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub async fn run(mut self) -> Result<AlignmentOutcome, WindowError> {
        while self.step().await? == AlignerState::Running {}
        Ok(self.finish())
    }

    /// Perform one window step.
    pub async fn step(&mut self) -> Result<AlignerState, WindowError> {
        if self.state == AlignerState::Done {
            return Ok(AlignerState::Done);
        }

        let windows = self.aligner.windows;
        let qp_window = windows.build(self.question_paper, self.cursor.question_paper_index)?;
        let ms_window = windows.build(self.mark_scheme, self.cursor.mark_scheme_index)?;
        if qp_window.is_empty() && ms_window.is_empty() {
            info!(steps = self.steps, "alignment finished");
            self.state = AlignerState::Done;
            return Ok(AlignerState::Done);
        }
        self.steps += 1;

        debug!(
            step = self.steps,
            qp_index = qp_window.start,
            ms_index = ms_window.start,
            next_question = %self.cursor.next_question_number,
            "aligning window"
        );

        match self.request(&qp_window, &ms_window).await {
            Ok(result) => {
                let last_top_level = result.questions.last().map(|q| top_level_number(&q.number));
                for mut question in result.questions {
                    place_on_pages(&mut question, &qp_window, qp_window.start);
                    let page = question.source_page.unwrap_or(qp_window.start);
                    self.accumulator.insert(question, page);
                }
                for dropped in result.dropped {
                    warn!(
                        number = %dropped.number,
                        reason = %dropped.reason,
                        qp_index = qp_window.start,
                        "question dropped from model reply"
                    );
                    if let Some(fragment) = dropped.fragment.clone() {
                        let page = qp_window.page_of(&fragment.number).unwrap_or(qp_window.start);
                        self.accumulator.hold(fragment, page);
                    }
                    self.dropped.push(dropped);
                }

                let next_qp = next_index(
                    &qp_window,
                    self.question_paper.len(),
                    result.next_question_paper_index,
                    result.context_complete.question_paper,
                );
                let next_ms = next_index(
                    &ms_window,
                    self.mark_scheme.len(),
                    result.next_mark_scheme_index,
                    result.context_complete.mark_scheme,
                );
                self.advance(next_qp, next_ms);

                if let Some(number) = result.next_question_number {
                    self.cursor.next_question_number = number;
                } else if let Some(next) = last_top_level.as_deref().and_then(successor) {
                    self.cursor.next_question_number = next;
                }
            }
            Err(last_error) => {
                let attempts = self.aligner.retry.max_attempts.max(1);
                warn!(
                    qp_index = qp_window.start,
                    ms_index = ms_window.start,
                    attempts,
                    error = %last_error,
                    "skipping window after repeated failures"
                );
                self.skipped.push(SkippedWindow {
                    question_paper_index: qp_window.start,
                    mark_scheme_index: ms_window.start,
                    attempts,
                    last_error,
                });
                let size = windows.window_size();
                self.cursor.question_paper_index =
                    (qp_window.start + size).min(self.question_paper.len());
                self.cursor.mark_scheme_index = (ms_window.start + size).min(self.mark_scheme.len());
            }
        }

        Ok(AlignerState::Running)
    }

    /// Ask the model about one window pair, retrying with the strict note.
    async fn request(
        &self,
        qp_window: &ContentWindow<'_>,
        ms_window: &ContentWindow<'_>,
    ) -> Result<super::assembler::AssemblerResult, String> {
        let aligner = self.aligner;
        let attempts = aligner.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let prompt = aligner.prompts.build(
                qp_window,
                ms_window,
                &self.cursor.next_question_number,
                attempt > 1,
            );
            let outcome = match aligner.client.generate_structured(&prompt).await {
                Ok(raw) => aligner.assembler.assemble(&raw).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(error) => {
                    debug!(attempt, client = aligner.client.name(), error = %error, "window attempt failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    fn advance(&mut self, next_qp: usize, next_ms: usize) {
        let cursor = &mut self.cursor;
        let next_qp = next_qp.max(cursor.question_paper_index);
        let next_ms = next_ms.max(cursor.mark_scheme_index);
        if next_qp == cursor.question_paper_index && next_ms == cursor.mark_scheme_index {
            debug!(
                qp_index = next_qp,
                ms_index = next_ms,
                "no cursor movement; forcing both forward one page"
            );
            cursor.question_paper_index = (next_qp + 1).min(self.question_paper.len());
            cursor.mark_scheme_index = (next_ms + 1).min(self.mark_scheme.len());
        } else {
            cursor.question_paper_index = next_qp;
            cursor.mark_scheme_index = next_ms;
        }
    }

    pub fn finish(self) -> AlignmentOutcome {
        let (questions, incomplete, conflicts) = self.accumulator.finish();
        AlignmentOutcome {
            questions,
            skipped: self.skipped,
            incomplete,
            dropped: self.dropped,
            conflicts,
            steps: self.steps,
        }
    }
}

/// Where a cursor goes after a successful step.
///
/// A missing index means "past this window"; an incomplete context keeps the
/// cursor on the window start so the same pages are shown again.
/// Give each node the window page its number starts on, or its parent's.
fn place_on_pages(question: &mut Question, window: &ContentWindow<'_>, fallback: usize) {
    if question.source_page.is_none() {
        question.source_page = Some(window.page_of(&question.number).unwrap_or(fallback));
    }
    let page = question.source_page.unwrap_or(fallback);
    if let Some(children) = question.sub_questions_mut() {
        for child in children {
            place_on_pages(child, window, page);
        }
    }
}

fn next_index(window: &ContentWindow<'_>, len: usize, returned: Option<usize>, complete: bool) -> usize {
    let proposed = returned.unwrap_or(window.end).min(len);
    if complete {
        proposed
    } else {
        proposed.min(window.start)
    }
}

/// Next top-level number after a purely numeric one (`"3"` → `"4"`).
fn successor(number: &str) -> Option<String> {
    number.parse::<u32>().ok().map(|n| (n + 1).to_string())
}
