//! Markdown assembly for research output.
//!
//! Pure functions: the caller supplies the clock so output is deterministic
//! under test.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};

use crate::util::{compact_timestamp, display_timestamp};

use super::session::AgentMessage;

/// A named markdown document ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub filename: String,
    pub content: String,
}

/// Render one agent response as a markdown document.
///
/// Returns `None` when there is no response or it carries neither text nor
/// citations. Intermediate documents get a generation timestamp line under
/// the title.
pub fn render(
    message: Option<&AgentMessage>,
    filename: &str,
    title: &str,
    intermediate: bool,
    generated_at: DateTime<Utc>,
) -> Option<Document> {
    let message = message?;
    if message.text_segments.is_empty() && message.url_citations.is_empty() {
        return None;
    }

    let mut content = format!("# {}\n\n", title);
    if intermediate {
        content.push_str(&format!(
            "*Generated on: {}*\n\n---\n\n",
            display_timestamp(generated_at)
        ));
    }

    let body = message
        .text_segments
        .iter()
        .map(|segment| segment.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    content.push_str(&body);

    if !message.url_citations.is_empty() {
        content.push_str("\n\n## References\n");
        let mut seen = HashSet::new();
        for citation in &message.url_citations {
            if !seen.insert(citation.url.as_str()) {
                continue;
            }
            let label = citation.title.as_deref().unwrap_or(&citation.url);
            content.push_str(&format!("- [{}]({})\n", label, citation.url));
        }
    }

    Some(Document {
        filename: filename.to_string(),
        content,
    })
}

/// Merge intermediate documents into a single summary with a table of
/// contents. Returns `None` for an empty input.
///
/// The filename timestamp never matches one already used by an input
/// document; it moves forward a second at a time until it is unused.
pub fn consolidate(documents: &[Document], generated_at: DateTime<Utc>) -> Option<Document> {
    if documents.is_empty() {
        return None;
    }

    let mut content = String::from("# Consolidated Deep Research Summary\n\n");
    content.push_str(&format!(
        "*Generated on: {}*\n\n",
        display_timestamp(generated_at)
    ));
    content.push_str(
        "This document consolidates all research steps performed during the deep research process.\n\n",
    );
    content.push_str("---\n\n");

    content.push_str("## Table of Contents\n\n");
    for (i, doc) in documents.iter().enumerate() {
        let title = step_title(&doc.filename);
        content.push_str(&format!("{}. [{}](#{})\n", i + 1, title, anchor(&title)));
    }
    content.push_str("\n---\n\n");

    for doc in documents {
        content.push_str(&format!("## {}\n\n", step_title(&doc.filename)));
        content.push_str(&strip_heading(&doc.content));
        content.push_str("\n\n---\n\n");
    }

    Some(Document {
        filename: format!(
            "consolidated_research_summary_{}.md",
            unused_timestamp(documents, generated_at)
        ),
        content,
    })
}

fn unused_timestamp(documents: &[Document], from: DateTime<Utc>) -> String {
    let mut at = from;
    loop {
        let stamp = compact_timestamp(at);
        if !documents.iter().any(|doc| doc.filename.contains(&stamp)) {
            return stamp;
        }
        at += TimeDelta::seconds(1);
    }
}

/// `research_step_01_x.md` → `Research Step 01 X`.
pub fn step_title(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    title_case(&stem.replace('_', " "))
}

/// Markdown heading anchor for a title.
pub fn anchor(title: &str) -> String {
    title.to_lowercase().replace(' ', "-")
}

/// Capitalize each letter that follows a non-letter; lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_letter = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if prev_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_letter = true;
        } else {
            out.push(c);
            prev_letter = false;
        }
    }
    out
}

fn strip_heading(content: &str) -> String {
    match content.split_once('\n') {
        Some((first, rest)) if first.starts_with('#') => rest.trim().to_string(),
        None if content.starts_with('#') => String::new(),
        _ => content.to_string(),
    }
}
