//! Question paper / mark scheme pairing
//!
//! The resolver is the only code that writes `related_documents`, and it
//! always writes both sides of a link. Pairing is tried in a fixed order:
//!
//! 1. id pattern: `s23-2500u20-1a` → `s23-2500u20-1-ms`
//! 2. suffix strip: `<anything>-<digits><letter>` → `<anything>-<digits>-ms`
//! 3. plain suffix: `2500U20-1` → `2500U20-1-ms`
//! 4. mark scheme side: `<id>-ms` → `<id>`
//! 5. metadata: same (unit, year, qualification, subject), both unpaired
//!
//! Every id-based pass runs over all entries before the metadata pass, and
//! entries are visited in id order, so the result does not depend on the
//! order entries arrived in.

use super::unit::derive_unit;
use crate::model::{DocumentType, IndexEntry};
use regex_lite::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\w+)-(\d+[a-z]*\d*)-(\d+)([a-z])$").expect("valid pairing id regex")
});
static LETTER_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.*-\d+)[a-z]$").expect("valid letter suffix regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PairingHeuristic {
    IdPattern,
    SuffixStrip,
    PlainSuffix,
    MarkSchemeSuffix,
    Metadata,
}

impl std::fmt::Display for PairingHeuristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::IdPattern => "id pattern",
            Self::SuffixStrip => "suffix strip",
            Self::PlainSuffix => "plain suffix",
            Self::MarkSchemeSuffix => "mark scheme suffix",
            Self::Metadata => "metadata",
        })
    }
}

/// A link made during one resolve pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    pub question_paper: String,
    pub mark_scheme: String,
    pub heuristic: PairingHeuristic,
}

/// More than one partner was possible; the first in id order was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipConflict {
    pub entry_id: String,
    pub heuristic: PairingHeuristic,
    /// Partner that was linked, if any
    pub chosen: Option<String>,
    /// Partners that matched but were not linked
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub links: Vec<ResolvedLink>,
    pub conflicts: Vec<RelationshipConflict>,
    /// (entry, related id) pairs pointing at ids not in the index
    pub dangling: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RelationshipResolver;

struct Pairing<'e> {
    entries: &'e mut [IndexEntry],
    by_id: HashMap<String, usize>,
    report: ResolveReport,
}

impl RelationshipResolver {
    pub fn new() -> Self {
        Self
    }

    /// Link question papers with their mark schemes, in place.
    ///
    /// Re-running on already linked entries changes nothing.
    pub fn resolve(&self, entries: &mut [IndexEntry]) -> ResolveReport {
        let mut by_id = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            by_id.entry(entry.id.to_lowercase()).or_insert(i);
        }
        let mut pairing = Pairing {
            entries,
            by_id,
            report: ResolveReport::default(),
        };

        pairing.symmetrize();

        let mut order: Vec<usize> = (0..pairing.entries.len()).collect();
        order.sort_by(|a, b| pairing.entries[*a].id.cmp(&pairing.entries[*b].id));

        for &i in &order {
            if pairing.entries[i].doc_type == DocumentType::QuestionPaper && !pairing.has_partner(i) {
                pairing.pair_by_id(i);
            }
        }
        for &i in &order {
            if pairing.entries[i].doc_type == DocumentType::MarkScheme && !pairing.has_partner(i) {
                pairing.pair_mark_scheme_by_id(i);
            }
        }
        for &i in &order {
            if pairing.entries[i].doc_type == DocumentType::QuestionPaper && !pairing.has_partner(i) {
                pairing.pair_by_metadata(i, &order);
            }
        }

        if !pairing.report.links.is_empty() {
            info!(links = pairing.report.links.len(), "linked question papers and mark schemes");
        }
        pairing.report
    }
}

impl<'e> Pairing<'e> {
    fn lookup(&self, id: &str) -> Option<usize> {
        self.by_id.get(&id.to_lowercase()).copied()
    }

    /// Make every existing link two-sided and canonicalise id case.
    fn symmetrize(&mut self) {
        for i in 0..self.entries.len() {
            let related: Vec<String> = self.entries[i].related_documents.iter().cloned().collect();
            for other_id in related {
                match self.lookup(&other_id) {
                    Some(j) if j != i => {
                        let canonical = self.entries[j].id.clone();
                        if canonical != other_id {
                            self.entries[i].related_documents.remove(&other_id);
                            self.entries[i].related_documents.insert(canonical);
                        }
                        let own = self.entries[i].id.clone();
                        self.entries[j].related_documents.insert(own);
                    }
                    Some(_) => {
                        self.entries[i].related_documents.remove(&other_id);
                    }
                    None => {
                        debug!(entry_id = %self.entries[i].id, related = %other_id, "related document not in index");
                        self.report
                            .dangling
                            .push((self.entries[i].id.clone(), other_id));
                    }
                }
            }
        }
    }

    /// True when the entry already links to an entry of the other type.
    fn has_partner(&self, i: usize) -> bool {
        let wanted = self.entries[i].doc_type.counterpart();
        self.entries[i]
            .related_documents
            .iter()
            .filter_map(|id| self.lookup(id))
            .any(|j| self.entries[j].doc_type == wanted)
    }

    fn link(&mut self, qp: usize, ms: usize, heuristic: PairingHeuristic) {
        let qp_id = self.entries[qp].id.clone();
        let ms_id = self.entries[ms].id.clone();
        debug!(question_paper = %qp_id, mark_scheme = %ms_id, heuristic = %heuristic, "linking documents");
        self.entries[qp].related_documents.insert(ms_id.clone());
        self.entries[ms].related_documents.insert(qp_id.clone());
        self.report.links.push(ResolvedLink {
            question_paper: qp_id,
            mark_scheme: ms_id,
            heuristic,
        });
    }

    fn conflict(&mut self, entry: usize, heuristic: PairingHeuristic, chosen: Option<String>, rejected: Vec<String>) {
        let entry_id = self.entries[entry].id.clone();
        warn!(
            entry_id = %entry_id,
            heuristic = %heuristic,
            chosen = ?chosen,
            rejected = ?rejected,
            "relationship conflict"
        );
        self.report.conflicts.push(RelationshipConflict {
            entry_id,
            heuristic,
            chosen,
            rejected,
        });
    }

    fn pair_by_id(&mut self, qp: usize) {
        let id = self.entries[qp].id.clone();
        let candidates = [
            (
                PairingHeuristic::IdPattern,
                ID_PATTERN
                    .is_match(&id)
                    .then(|| ID_PATTERN.replace(&id, "$1-$2-$3-ms").into_owned()),
            ),
            (
                PairingHeuristic::SuffixStrip,
                LETTER_SUFFIX
                    .is_match(&id)
                    .then(|| LETTER_SUFFIX.replace(&id, "$1-ms").into_owned()),
            ),
            (PairingHeuristic::PlainSuffix, Some(format!("{}-ms", id))),
        ];

        for (heuristic, candidate) in candidates {
            let Some(candidate) = candidate else { continue };
            let Some(ms) = self.lookup(&candidate) else { continue };
            if self.entries[ms].doc_type != DocumentType::MarkScheme {
                continue;
            }
            if self.has_partner(ms) {
                let taken = self.entries[ms].id.clone();
                self.conflict(qp, heuristic, None, vec![taken]);
                return;
            }
            self.link(qp, ms, heuristic);
            return;
        }
    }

    fn pair_mark_scheme_by_id(&mut self, ms: usize) {
        let id = self.entries[ms].id.to_lowercase();
        let Some(stem) = id.strip_suffix("-ms").or_else(|| id.strip_suffix("_ms")) else {
            return;
        };
        let Some(qp) = self.lookup(stem) else { return };
        if self.entries[qp].doc_type != DocumentType::QuestionPaper {
            return;
        }
        if self.has_partner(qp) {
            let taken = self.entries[qp].id.clone();
            self.conflict(ms, PairingHeuristic::MarkSchemeSuffix, None, vec![taken]);
            return;
        }
        self.link(qp, ms, PairingHeuristic::MarkSchemeSuffix);
    }

    fn pair_by_metadata(&mut self, qp: usize, order: &[usize]) {
        let unit = derive_unit(&self.entries[qp]);
        if !unit.is_assigned() {
            return;
        }
        let key = slot_key(&self.entries[qp], &unit.unit);
        let matches: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&j| {
                let other = &self.entries[j];
                other.doc_type == DocumentType::MarkScheme
                    && !self.has_partner(j)
                    && derive_unit(other).is_assigned()
                    && slot_key(other, &derive_unit(other).unit) == key
            })
            .collect();

        let Some((&first, rest)) = matches.split_first() else {
            return;
        };
        self.link(qp, first, PairingHeuristic::Metadata);
        if !rest.is_empty() {
            let chosen = Some(self.entries[first].id.clone());
            let rejected = rest.iter().map(|&j| self.entries[j].id.clone()).collect();
            self.conflict(qp, PairingHeuristic::Metadata, chosen, rejected);
        }
    }
}

fn slot_key(entry: &IndexEntry, unit: &str) -> (String, i32, String, String) {
    (
        unit.to_string(),
        entry.year,
        entry.qualification.to_lowercase(),
        entry.subject.to_lowercase(),
    )
}

/// Group resolver links by question paper, for reporting
pub fn partners_by_question_paper(entries: &[IndexEntry]) -> BTreeMap<String, Vec<String>> {
    let types: HashMap<&str, DocumentType> = entries.iter().map(|e| (e.id.as_str(), e.doc_type)).collect();
    entries
        .iter()
        .filter(|e| e.is_question_paper())
        .map(|e| {
            let partners = e
                .related_documents
                .iter()
                .filter(|id| types.get(id.as_str()) == Some(&DocumentType::MarkScheme))
                .cloned()
                .collect();
            (e.id.clone(), partners)
        })
        .collect()
}
