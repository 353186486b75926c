//! Bounded page slices used as model input

use crate::model::{number_segments, Page};
use regex_lite::Regex;
use thiserror::Error;

/// Default number of pages per window.
pub const DEFAULT_WINDOW_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window start {start} is past the end of a {len}-page document")]
    OutOfBounds { start: usize, len: usize },
}

/// A slice of consecutive pages starting at `start`.
///
/// `end` is exclusive; an empty window has `start == end == len(document)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentWindow<'a> {
    pub pages: &'a [Page],
    pub start: usize,
    pub end: usize,
}

impl<'a> ContentWindow<'a> {
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Position of the last page in the window, if any.
    pub fn last_position(&self) -> Option<usize> {
        self.end.checked_sub(1).filter(|_| !self.is_empty())
    }

    /// Pages paired with their position in the document
    pub fn positioned(&self) -> impl Iterator<Item = (usize, &'a Page)> {
        let start = self.start;
        self.pages.iter().enumerate().map(move |(i, p)| (start + i, p))
    }

    /// Position of the page where question `number` starts, if its number
    /// is printed at the start of a line in this window.
    ///
    /// A part such as `1b` is looked for as `(b)`, `b)` or `1(b)` on the
    /// page of its top-level number or a later one; the top-level page is
    /// used when the part label is not found.
    pub fn page_of(&self, number: &str) -> Option<usize> {
        let segments = number_segments(number);
        let top = regex_lite::escape(segments.first()?);
        let top_line = line_start(&format!(r"(?:q(?:uestion)?\s*)?{}\b", top))?;
        let (top_page, _) = self.positioned().find(|(_, page)| top_line.is_match(&page.markdown))?;

        let Some(part) = segments.get(1) else {
            return Some(top_page);
        };
        let label = regex_lite::escape(part.trim_matches(|c: char| c == '(' || c == ')'));
        let Some(part_line) = line_start(&format!(r"(?:{}\s*)?\(?{}\)", top, label)) else {
            return Some(top_page);
        };
        let part_page = self
            .positioned()
            .skip(top_page - self.start)
            .find(|(_, page)| part_line.is_match(&page.markdown))
            .map(|(position, _)| position);
        Some(part_page.unwrap_or(top_page))
    }
}

fn line_start(pattern: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?mi)^\s*{}", pattern)).ok()
}

/// Cuts fixed-size page windows out of a document.
#[derive(Debug, Clone, Copy)]
pub struct ContentWindowBuilder {
    window_size: usize,
}

impl ContentWindowBuilder {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Build the window starting at `start`.
    ///
    /// `start == document.len()` yields an empty window (exhaustion); a
    /// larger start is an error. Near the end of a document the window may
    /// hold fewer than `window_size` pages.
    pub fn build<'a>(&self, document: &'a [Page], start: usize) -> Result<ContentWindow<'a>, WindowError> {
        if start > document.len() {
            return Err(WindowError::OutOfBounds {
                start,
                len: document.len(),
            });
        }
        let end = (start + self.window_size).min(document.len());
        Ok(ContentWindow {
            pages: &document[start..end],
            start,
            end,
        })
    }
}

impl Default for ContentWindowBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(n: usize) -> Vec<Page> {
        (0..n).map(|i| Page::new(i, format!("page {}", i))).collect()
    }

    #[test]
    fn window_takes_two_pages() {
        let pages = doc(5);
        let w = ContentWindowBuilder::default().build(&pages, 1).unwrap();
        assert_eq!(w.pages.len(), 2);
        assert_eq!((w.start, w.end), (1, 3));
        assert_eq!(w.last_position(), Some(2));
    }

    #[test]
    fn short_window_at_document_end() {
        let pages = doc(3);
        let w = ContentWindowBuilder::default().build(&pages, 2).unwrap();
        assert_eq!(w.pages.len(), 1);
        assert_eq!(w.end, 3);
    }

    #[test]
    fn start_at_length_is_empty() {
        let pages = doc(3);
        let w = ContentWindowBuilder::default().build(&pages, 3).unwrap();
        assert!(w.is_empty());
        assert_eq!(w.last_position(), None);

        let err = ContentWindowBuilder::default().build(&pages, 4).unwrap_err();
        assert_eq!(err, WindowError::OutOfBounds { start: 4, len: 3 });
    }

    #[test]
    fn positioned_pages_carry_document_offsets() {
        let pages = doc(4);
        let w = ContentWindowBuilder::new(3).build(&pages, 2).unwrap();
        let positions: Vec<usize> = w.positioned().map(|(i, _)| i).collect();
        assert_eq!(positions, vec![2, 3]);
    }

    #[test]
    fn page_of_finds_where_a_question_starts() {
        let pages = vec![
            Page::new(0, "Answer all questions."),
            Page::new(1, "1 (a) Define abstraction. [2]\n10 marks available"),
            Page::new(2, "(b) Explain recursion. [3]\n\nQuestion 2 Trace the table."),
        ];
        let w = ContentWindowBuilder::new(3).build(&pages, 0).unwrap();
        assert_eq!(w.page_of("1"), Some(1));
        assert_eq!(w.page_of("1a"), Some(1));
        assert_eq!(w.page_of("1b"), Some(2));
        assert_eq!(w.page_of("2"), Some(2));
        assert_eq!(w.page_of("3"), None);
        // A part label that is never printed falls back to its question's page.
        assert_eq!(w.page_of("1c(i)"), Some(1));

        let later = ContentWindowBuilder::new(2).build(&pages, 1).unwrap();
        assert_eq!(later.page_of("2"), Some(2));
        assert_eq!(later.page_of("1b"), Some(2));
    }
}
