//! Question paper / mark scheme alignment
//!
//! - `window`: fixed-size page slices fed to the model
//! - `assembler` + `json_repair`: model reply → validated question trees
//! - `merge`: accumulating trees and half-seen questions across windows
//! - `aligner`: the cursor state machine driving the above
//! - `media`: attaching OCR images to the finished trees

mod aligner;
mod assembler;
mod json_repair;
mod media;
mod merge;
mod prompt;
mod window;

pub use aligner::{
    AlignerState, AlignmentCursor, AlignmentOutcome, AlignmentRun, RetryPolicy, SkippedWindow,
    SlidingWindowAligner,
};
pub use assembler::{
    infer_marks, infer_objectives, AssembleError, AssemblerResult, ContextComplete, DropReason,
    DroppedQuestion, QuestionFragment, ResponseAssembler,
};
pub use json_repair::{extract_json, repair_json};
pub use media::{MediaAssociation, MediaAssociator, MediaDiagnostic};
pub use merge::{IncompleteAlignment, MergeConflict, QuestionAccumulator};
pub use prompt::{PromptBuilder, DEFAULT_INSTRUCTIONS, DEFAULT_STRICT_JSON_NOTE};
pub use window::{ContentWindow, ContentWindowBuilder, WindowError, DEFAULT_WINDOW_SIZE};
