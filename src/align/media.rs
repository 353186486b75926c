//! Attaching OCR images to question nodes
//!
//! Two passes over a copy of the trees:
//! 1. Direct: markdown image references (`![img-0.jpeg](img-0.jpeg)`) in a
//!    node's text or mark scheme, resolved by id. Children are visited
//!    before their parent so an image lands on the deepest node citing it.
//! 2. Proximity: nodes none of whose references resolved take the still
//!    unclaimed images of their source page. A parent only does this for
//!    children that carry no page of their own.
//! 3. Continuation: images left on a page where no question starts go to
//!    the question running over it, the last leaf placed on an earlier page.
//!
//! An image is attached to at most one node. Unresolvable or malformed
//! references become diagnostics.

use crate::model::{ImageRef, Page, Question};
use pulldown_cmark::{Event, Parser, Tag};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaDiagnostic {
    /// Reference to an image id no page contains
    UnresolvedReference { question_number: String, reference: String },
    /// Image syntax that could not be parsed into a reference
    MalformedReference { question_number: String, excerpt: String },
}

#[derive(Debug, Clone, Default)]
pub struct MediaAssociation {
    pub questions: Vec<Question>,
    pub diagnostics: Vec<MediaDiagnostic>,
}

/// Images claimed so far, keyed by page index and id
type Claimed = HashSet<(usize, String)>;

/// Numbers of the nodes with at least one resolved reference
type Resolved = HashSet<String>;

struct Catalog<'a> {
    by_id: BTreeMap<String, Vec<(usize, &'a ImageRef)>>,
    pages: &'a [Page],
}

impl<'a> Catalog<'a> {
    fn new(pages: &'a [Page]) -> Self {
        let mut by_id: BTreeMap<String, Vec<(usize, &'a ImageRef)>> = BTreeMap::new();
        for (position, page) in pages.iter().enumerate() {
            for image in &page.images {
                by_id.entry(image.id.clone()).or_default().push((position, image));
                if let Some(name) = image.storage_ref.as_deref().map(file_name) {
                    if name != image.id {
                        by_id.entry(name.to_string()).or_default().push((position, image));
                    }
                }
            }
        }
        Self { by_id, pages }
    }

    /// Resolve a reference, preferring the copy on `page` when ids repeat.
    fn resolve(&self, reference: &str, page: Option<usize>) -> Option<(usize, &'a ImageRef)> {
        let candidates = self
            .by_id
            .get(reference)
            .or_else(|| self.by_id.get(file_name(reference)))?;
        page.and_then(|p| candidates.iter().find(|(pos, _)| *pos == p))
            .or_else(|| candidates.first())
            .copied()
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Stateless image-to-question mapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaAssociator;

impl MediaAssociator {
    pub fn new() -> Self {
        Self
    }

    /// Return enriched copies of `questions`; the input is left untouched.
    pub fn associate(&self, questions: &[Question], pages: &[Page]) -> MediaAssociation {
        let catalog = Catalog::new(pages);
        let mut claimed = Claimed::new();
        let mut resolved = Resolved::new();
        let mut diagnostics = Vec::new();
        let mut enriched = questions.to_vec();

        for question in &enriched {
            claim_existing(question, &mut claimed);
        }
        for question in &mut enriched {
            attach_direct(question, &catalog, &mut claimed, &mut resolved, &mut diagnostics);
        }
        for question in &mut enriched {
            attach_by_page(question, &catalog, &resolved, &mut claimed);
        }
        attach_continuation_pages(&mut enriched, &catalog, &resolved, &mut claimed);

        MediaAssociation {
            questions: enriched,
            diagnostics,
        }
    }
}

/// Image references in one markdown string: parsed destinations plus a
/// count of `![` openings the parser did not turn into images.
fn image_references(markdown: &str) -> (Vec<String>, usize) {
    let mut references = Vec::new();
    for event in Parser::new(markdown) {
        if let Event::Start(Tag::Image { dest_url, .. }) = event {
            references.push(dest_url.trim().to_string());
        }
    }
    let unparsed = markdown.matches("![").count().saturating_sub(references.len());
    (references, unparsed)
}

fn claim_existing(question: &Question, claimed: &mut Claimed) {
    for image in &question.media_refs {
        claimed.insert((image.page_index, image.id.clone()));
    }
    for child in question.sub_questions() {
        claim_existing(child, claimed);
    }
}

/// Post-order: children claim before their parent.
fn attach_direct(
    question: &mut Question,
    catalog: &Catalog<'_>,
    claimed: &mut Claimed,
    resolved: &mut Resolved,
    diagnostics: &mut Vec<MediaDiagnostic>,
) {
    if let Some(children) = question.sub_questions_mut() {
        for child in children {
            attach_direct(child, catalog, claimed, resolved, diagnostics);
        }
    }

    let texts = [question.question_text().to_string(), question.mark_scheme().to_string()];
    for text in &texts {
        let (references, unparsed) = image_references(text);
        if unparsed > 0 {
            let start = text.find("![").unwrap_or(0);
            let excerpt: String = text[start..].chars().take(40).collect();
            debug!(number = %question.number, excerpt = %excerpt, "malformed image reference");
            diagnostics.push(MediaDiagnostic::MalformedReference {
                question_number: question.number.clone(),
                excerpt,
            });
        }
        for reference in references {
            if reference.is_empty() {
                diagnostics.push(MediaDiagnostic::MalformedReference {
                    question_number: question.number.clone(),
                    excerpt: "![]()".to_string(),
                });
                continue;
            }
            match catalog.resolve(&reference, question.source_page) {
                Some((_, image)) => {
                    resolved.insert(question.number.clone());
                    if claimed.insert((image.page_index, image.id.clone())) {
                        question.media_refs.push(image.clone());
                    }
                }
                None => {
                    debug!(number = %question.number, reference = %reference, "unresolved image reference");
                    diagnostics.push(MediaDiagnostic::UnresolvedReference {
                        question_number: question.number.clone(),
                        reference,
                    });
                }
            }
        }
    }
}

/// Returns true when this subtree has a node without page information
/// that still wants images from an ancestor.
fn attach_by_page(question: &mut Question, catalog: &Catalog<'_>, resolved: &Resolved, claimed: &mut Claimed) -> bool {
    if question.is_leaf() {
        if resolved.contains(&question.number) {
            return false;
        }
        return match question.source_page {
            Some(page) => {
                take_page_images(question, page, catalog, claimed);
                false
            }
            None => true,
        };
    }

    let mut orphaned = false;
    if let Some(children) = question.sub_questions_mut() {
        for child in children {
            orphaned |= attach_by_page(child, catalog, resolved, claimed);
        }
    }
    if !orphaned || resolved.contains(&question.number) {
        return false;
    }
    match question.source_page {
        Some(page) => {
            take_page_images(question, page, catalog, claimed);
            false
        }
        None => true,
    }
}

fn take_page_images(question: &mut Question, page: usize, catalog: &Catalog<'_>, claimed: &mut Claimed) {
    let Some(source) = catalog.pages.get(page) else {
        return;
    };
    for image in &source.images {
        if claimed.insert((image.page_index, image.id.clone())) {
            question.media_refs.push(image.clone());
        }
    }
}

fn attach_continuation_pages(
    questions: &mut [Question],
    catalog: &Catalog<'_>,
    resolved: &Resolved,
    claimed: &mut Claimed,
) {
    let mut leaves = Vec::new();
    paged_leaves(questions, &mut Vec::new(), &mut leaves);

    for (position, page) in catalog.pages.iter().enumerate() {
        let unclaimed = page
            .images
            .iter()
            .any(|image| !claimed.contains(&(image.page_index, image.id.clone())));
        if !unclaimed || leaves.iter().any(|(start, _)| *start == position) {
            continue;
        }
        let Some((_, path)) = leaves
            .iter()
            .filter(|(start, _)| *start < position)
            .max_by_key(|(start, _)| *start)
        else {
            continue;
        };
        let Some(question) = node_at(questions, path) else {
            continue;
        };
        if resolved.contains(&question.number) {
            continue;
        }
        debug!(number = %question.number, page = position, "images from a continuation page");
        take_page_images(question, position, catalog, claimed);
    }
}

/// Leaves that carry a page, in document order, with their child-index paths.
fn paged_leaves(questions: &[Question], path: &mut Vec<usize>, out: &mut Vec<(usize, Vec<usize>)>) {
    for (i, question) in questions.iter().enumerate() {
        path.push(i);
        if question.is_leaf() {
            if let Some(page) = question.source_page {
                out.push((page, path.clone()));
            }
        } else {
            paged_leaves(question.sub_questions(), path, out);
        }
        path.pop();
    }
}

fn node_at<'q>(questions: &'q mut [Question], path: &[usize]) -> Option<&'q mut Question> {
    let (first, rest) = path.split_first()?;
    let mut node = questions.get_mut(*first)?;
    for i in rest {
        node = node.sub_questions_mut()?.get_mut(*i)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages() -> Vec<Page> {
        vec![
            Page::new(0, "![img-0.jpeg](img-0.jpeg)\n1 (a) Look at the diagram.")
                .with_image("img-0.jpeg"),
            Page::new(1, "2 Figure").with_image("img-1.jpeg").with_image("img-2.png"),
        ]
    }

    #[test]
    fn direct_reference_goes_to_deepest_node() {
        let questions = vec![Question::composite(
            "1",
            "See ![img-0.jpeg](img-0.jpeg)",
            vec![Question::leaf("1a", "Using ![img-0.jpeg](img-0.jpeg) explain [2]", "AO1", 2, ["AO1"])],
        )];
        let result = MediaAssociator::new().associate(&questions, &pages());
        let q = &result.questions[0];
        assert!(q.media_refs.is_empty());
        assert_eq!(q.find("1a").unwrap().media_refs[0].id, "img-0.jpeg");
        assert!(questions[0].sub_questions()[0].media_refs.is_empty());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn leaf_with_page_takes_unclaimed_images() {
        let questions = vec![Question::leaf("2", "Describe the figure [3]", "AO2", 3, ["AO2"]).with_source_page(1)];
        let result = MediaAssociator::new().associate(&questions, &pages());
        let ids: Vec<&str> = result.questions[0].media_refs.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["img-1.jpeg", "img-2.png"]);
        assert_eq!(result.questions[0].media_refs[1].format, "png");
    }

    #[test]
    fn parent_takes_page_images_only_for_pageless_children() {
        let questions = vec![Question::composite(
            "2",
            "Figure question",
            vec![Question::leaf("2a", "Part", "AO1", 1, ["AO1"])],
        )
        .with_source_page(1)];
        let mut questions = questions;
        questions[0].sub_questions_mut().unwrap()[0].source_page = None;

        let result = MediaAssociator::new().associate(&questions, &pages());
        assert_eq!(result.questions[0].media_refs.len(), 2);
        assert!(result.questions[0].sub_questions()[0].media_refs.is_empty());
    }

    #[test]
    fn bad_references_become_diagnostics() {
        let questions = vec![Question::leaf(
            "3",
            "See ![img-9.jpeg](img-9.jpeg) and ![broken(",
            "AO1",
            1,
            ["AO1"],
        )];
        let result = MediaAssociator::new().associate(&questions, &pages());
        assert!(result.questions[0].media_refs.is_empty());
        assert!(result.diagnostics.contains(&MediaDiagnostic::UnresolvedReference {
            question_number: "3".into(),
            reference: "img-9.jpeg".into(),
        }));
        assert!(result
            .diagnostics
            .iter()
            .any(|d| matches!(d, MediaDiagnostic::MalformedReference { .. })));
    }

    #[test]
    fn unresolved_reference_still_takes_page_images() {
        let questions =
            vec![Question::leaf("2", "Describe ![chart](missing.png) [3]", "AO2", 3, ["AO2"]).with_source_page(1)];
        let result = MediaAssociator::new().associate(&questions, &pages());
        assert_eq!(result.questions[0].media_refs.len(), 2);
        assert_eq!(
            result.diagnostics,
            vec![MediaDiagnostic::UnresolvedReference {
                question_number: "2".into(),
                reference: "missing.png".into(),
            }]
        );
    }

    #[test]
    fn resolved_reference_blocks_page_images() {
        let questions = vec![
            Question::leaf("2", "Use ![img-2.png](img-2.png) [3]", "AO2", 3, ["AO2"]).with_source_page(1),
        ];
        let result = MediaAssociator::new().associate(&questions, &pages());
        let ids: Vec<&str> = result.questions[0].media_refs.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["img-2.png"]);
    }

    #[test]
    fn continuation_page_images_go_to_the_running_question() {
        let pages = vec![
            Page::new(0, "1 Describe [2]\n2 Study the table"),
            Page::new(1, "table continues").with_image("img-1.jpeg"),
            Page::new(2, "3 Compare [4]").with_image("img-3.jpeg"),
        ];
        let questions = vec![
            Question::leaf("1", "Describe [2]", "AO1", 2, ["AO1"]).with_source_page(0),
            Question::leaf("2", "Study the table [4]", "AO2", 4, ["AO2"]).with_source_page(0),
            Question::leaf("3", "Compare [4] ![img-3.jpeg](img-3.jpeg)", "AO3", 4, ["AO3"]).with_source_page(2),
        ];
        let result = MediaAssociator::new().associate(&questions, &pages);
        assert!(result.questions[0].media_refs.is_empty());
        assert_eq!(result.questions[1].media_refs[0].id, "img-1.jpeg");
        assert_eq!(result.questions[1].media_refs[0].page_index, 1);
        assert_eq!(result.questions[2].media_refs.len(), 1);
    }

    #[test]
    fn continuation_stops_at_a_question_with_its_own_reference() {
        let pages = vec![
            Page::new(0, "1 Look at ![img-0.jpeg](img-0.jpeg)").with_image("img-0.jpeg"),
            Page::new(1, "more of the figure").with_image("img-1.jpeg"),
        ];
        let questions = vec![
            Question::leaf("1", "Look at ![img-0.jpeg](img-0.jpeg) [2]", "AO1", 2, ["AO1"]).with_source_page(0),
        ];
        let result = MediaAssociator::new().associate(&questions, &pages);
        let ids: Vec<&str> = result.questions[0].media_refs.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["img-0.jpeg"]);
    }

    #[test]
    fn image_is_claimed_once() {
        let questions = vec![
            Question::leaf("1", "![img-0.jpeg](img-0.jpeg)", "AO1", 1, ["AO1"]),
            Question::leaf("2", "Again ![img-0.jpeg](img-0.jpeg)", "AO1", 1, ["AO1"]),
        ];
        let result = MediaAssociator::new().associate(&questions, &pages());
        assert_eq!(result.questions[0].media_refs.len(), 1);
        assert!(result.questions[1].media_refs.is_empty());
    }
}
