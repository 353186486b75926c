//! Curriculum specification tagging
//!
//! Each leaf question of an aligned exam is sent to the LLM with its mark
//! scheme, the text of its ancestors and, when configured, the
//! specification document for the exam's qualification. The reply is
//! expected to end in a bracketed list such as `[1.2.3, 1.4]`.

use crate::index::ExamRecord;
use crate::llm::LlmClient;
use crate::model::Question;
use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static TAG_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([\d., ]+)\]").expect("valid tag list regex"));
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*$").expect("valid spec tag regex"));

pub const DEFAULT_TAGGING_INSTRUCTIONS: &str = "\
Identify the specification areas this exam question assesses.
Think it through, then finish your answer with the specification
references as a bracketed, comma-separated list, for example [1.2.3, 1.4].";

/// Tags from the last bracketed list in `reply`, sorted numerically.
///
/// Malformed items are dropped; no list at all gives an empty result.
pub fn parse_spec_tags(reply: &str) -> Vec<String> {
    let Some(list) = TAG_LIST.captures_iter(reply).last() else {
        return Vec::new();
    };
    let mut tags: Vec<String> = list[1]
        .split(',')
        .map(str::trim)
        .filter(|t| TAG.is_match(t))
        .map(str::to_string)
        .collect();
    tags.sort_by_key(|t| tag_key(t));
    tags.dedup();
    tags
}

fn tag_key(tag: &str) -> Vec<u64> {
    tag.split('.').map(|n| n.parse().unwrap_or(u64::MAX)).collect()
}

/// Counts from one tagging pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggingReport {
    pub tagged: usize,
    /// Leaves left with no tags (failed call or no usable list)
    pub untagged: Vec<String>,
}

struct LeafJob {
    number: String,
    prompt: String,
}

pub struct SpecTagger {
    client: Arc<dyn LlmClient>,
    instructions: String,
    /// Qualification name → specification text
    specifications: HashMap<String, String>,
}

impl SpecTagger {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            instructions: DEFAULT_TAGGING_INSTRUCTIONS.to_string(),
            specifications: HashMap::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_specification(mut self, qualification: impl Into<String>, text: impl Into<String>) -> Self {
        self.specifications.insert(qualification.into(), text.into());
        self
    }

    /// Tag every leaf of an exam record in place.
    pub async fn tag_record(&self, record: &mut ExamRecord) -> TaggingReport {
        let qualification = record.slot.qualification.clone();
        self.tag_questions(&mut record.questions, &qualification).await
    }

    /// Tag every leaf in `questions`, one call per leaf, no retry.
    pub async fn tag_questions(&self, questions: &mut [Question], qualification: &str) -> TaggingReport {
        let mut jobs = Vec::new();
        for question in questions.iter() {
            self.collect_jobs(question, &mut Vec::new(), qualification, &mut jobs);
        }

        let mut results: HashMap<String, Vec<String>> = HashMap::new();
        let mut report = TaggingReport::default();
        for job in jobs {
            let tags = match self.client.generate_structured(&job.prompt).await {
                Ok(reply) => parse_spec_tags(&reply),
                Err(e) => {
                    warn!(question = %job.number, error = %e, "spec tagging call failed");
                    Vec::new()
                }
            };
            if tags.is_empty() {
                warn!(question = %job.number, "no specification tags for question");
                report.untagged.push(job.number.clone());
            } else {
                debug!(question = %job.number, tags = ?tags, "tagged question");
                report.tagged += 1;
            }
            results.insert(job.number, tags);
        }

        for question in questions.iter_mut() {
            question.for_each_leaf_mut(&mut |leaf| {
                if let Some(tags) = results.remove(&leaf.number) {
                    leaf.spec_tags = tags;
                }
            });
        }
        report
    }

    fn collect_jobs(
        &self,
        question: &Question,
        ancestors: &mut Vec<String>,
        qualification: &str,
        jobs: &mut Vec<LeafJob>,
    ) {
        if question.is_leaf() {
            jobs.push(LeafJob {
                number: question.number.clone(),
                prompt: self.build_prompt(question, ancestors, qualification),
            });
            return;
        }
        let stem = question.question_text().trim();
        let pushed = !stem.is_empty();
        if pushed {
            ancestors.push(format!("{}: {}", question.number, stem));
        }
        for child in question.sub_questions() {
            self.collect_jobs(child, ancestors, qualification, jobs);
        }
        if pushed {
            ancestors.pop();
        }
    }

    fn build_prompt(&self, question: &Question, ancestors: &[String], qualification: &str) -> String {
        let mut prompt = String::new();
        if let Some(spec) = self.specifications.get(qualification) {
            prompt.push_str(&format!("## Specification ({})\n\n{}\n\n", qualification, spec.trim()));
        }
        if !ancestors.is_empty() {
            prompt.push_str("## Question Context\n\n");
            prompt.push_str(&ancestors.join("\n"));
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!(
            "## Question {}\n\n{}\n\n## Mark Scheme\n\n{}\n\n{}",
            question.number,
            question.question_text().trim(),
            question.mark_scheme().trim(),
            self.instructions.trim()
        ));
        prompt
    }
}
