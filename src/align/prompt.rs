//! Prompt layout for one alignment step
//!
//! The instruction text itself is configurable; this module only arranges
//! the two windows and the cursor context around it.

use super::window::ContentWindow;

/// Instructions used when no template is configured.
pub const DEFAULT_INSTRUCTIONS: &str = "\
Extract every question from the question paper content above and pair it with its \
mark scheme entry. Reply with a single JSON object:
{\"questions\": [{\"question_number\": str, \"question_text\": str, \"mark_scheme\": str, \
\"max_marks\": int, \"assessment_objectives\": [str], \"sub_questions\": [...]}], \
\"next_question_paper_index\": int, \"next_mark_scheme_index\": int, \
\"next_question_number\": str, \
\"context_complete\": {\"question_paper\": bool, \"mark_scheme\": bool}}
Only include questions whose text and mark scheme are both fully visible. Set the next \
indices to the first page that still holds unprocessed content.";

/// Appended on the retry after a malformed reply.
pub const DEFAULT_STRICT_JSON_NOTE: &str = "\
Your previous reply could not be parsed. Reply with one valid JSON object only: \
no markdown fences, no comments, no trailing commas, double-quoted strings.";

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    instructions: String,
    strict_json_note: String,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            strict_json_note: DEFAULT_STRICT_JSON_NOTE.to_string(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_strict_json_note(mut self, note: impl Into<String>) -> Self {
        self.strict_json_note = note.into();
        self
    }

    /// Lay out both windows, the instructions and the continuation line.
    pub fn build(
        &self,
        question_paper: &ContentWindow<'_>,
        mark_scheme: &ContentWindow<'_>,
        next_question_number: &str,
        strict: bool,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str("## Question Paper Content\n\n```markdown\n");
        prompt.push_str(&render_window(question_paper));
        prompt.push_str("\n```\n\n---\n\n## Mark Scheme Content\n\n```markdown\n");
        prompt.push_str(&render_window(mark_scheme));
        prompt.push_str("\n```\n\n---\n\n");
        prompt.push_str(self.instructions.trim());
        prompt.push_str("\n\n---\n\n");
        prompt.push_str(&format!(
            "Please continue from question number {}.",
            next_question_number
        ));
        if strict {
            prompt.push_str("\n\n");
            prompt.push_str(self.strict_json_note.trim());
        }
        prompt
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn render_window(window: &ContentWindow<'_>) -> String {
    if window.is_empty() {
        return "(no remaining pages)".to_string();
    }
    window
        .positioned()
        .map(|(position, page)| format!("--- Page Index: {} ---\n{}", position, page.markdown.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::window::ContentWindowBuilder;
    use crate::model::Page;

    #[test]
    fn prompt_marks_page_positions_and_continuation() {
        let qp: Vec<Page> = (0..3).map(|i| Page::new(i, format!("QP page {}", i))).collect();
        let ms = vec![Page::new(0, "MS page 0")];
        let builder = ContentWindowBuilder::default();
        let qp_window = builder.build(&qp, 1).unwrap();
        let ms_window = builder.build(&ms, 1).unwrap();

        let prompt = PromptBuilder::new().build(&qp_window, &ms_window, "2a", false);
        assert!(prompt.contains("--- Page Index: 1 ---\nQP page 1"));
        assert!(prompt.contains("--- Page Index: 2 ---\nQP page 2"));
        assert!(prompt.contains("(no remaining pages)"));
        assert!(prompt.ends_with("Please continue from question number 2a."));
    }

    #[test]
    fn strict_note_only_on_retry() {
        let pages = vec![Page::new(0, "x")];
        let w = ContentWindowBuilder::default().build(&pages, 0).unwrap();
        let builder = PromptBuilder::new().with_strict_json_note("JSON ONLY");
        assert!(!builder.build(&w, &w, "1", false).contains("JSON ONLY"));
        assert!(builder.build(&w, &w, "1", true).ends_with("JSON ONLY"));
    }
}
