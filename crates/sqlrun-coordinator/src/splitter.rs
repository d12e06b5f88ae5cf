//! Statement splitting
//!
//! Just enough SQL lexing to cut a document on `;` without being fooled by
//! quoted text or comments.

use serde::Serialize;
use std::ops::Range;

/// One statement cut from a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedStatement {
    pub sql: String,
    /// Position among all statements of the document
    pub statement_index: usize,
    /// Byte range in the document, terminator excluded
    #[serde(skip)]
    pub span: Range<usize>,
}

/// Turns document text into executable statements
pub trait StatementParser: Send + Sync {
    /// Statements overlapping `selection`, or all of them when `None`
    fn parse(&self, document: &str, selection: Option<Range<usize>>) -> Vec<ParsedStatement>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SemicolonSplitter;

#[derive(Clone, Copy, PartialEq)]
enum Lex {
    Code,
    Quoted(u8),
    LineComment,
    BlockComment,
}

impl SemicolonSplitter {
    pub fn new() -> Self {
        Self
    }

    /// Byte ranges of every non-empty statement
    fn spans(document: &str) -> Vec<Range<usize>> {
        let bytes = document.as_bytes();
        let mut spans = Vec::new();
        let mut state = Lex::Code;
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            let next = bytes.get(i + 1).copied();
            match state {
                Lex::Code => match b {
                    b'\'' | b'"' | b'`' => state = Lex::Quoted(b),
                    b'-' if next == Some(b'-') => {
                        state = Lex::LineComment;
                        i += 1;
                    }
                    b'/' if next == Some(b'*') => {
                        state = Lex::BlockComment;
                        i += 1;
                    }
                    b';' => {
                        spans.push(start..i);
                        start = i + 1;
                    }
                    _ => {}
                },
                Lex::Quoted(quote) => {
                    if b == quote {
                        // Doubled quote is an escaped quote
                        if next == Some(quote) {
                            i += 1;
                        } else {
                            state = Lex::Code;
                        }
                    }
                }
                Lex::LineComment => {
                    if b == b'\n' {
                        state = Lex::Code;
                    }
                }
                Lex::BlockComment => {
                    if b == b'*' && next == Some(b'/') {
                        state = Lex::Code;
                        i += 1;
                    }
                }
            }
            i += 1;
        }
        spans.push(start..bytes.len());

        spans
            .into_iter()
            .filter(|span| has_code(&document[span.clone()]))
            .map(|span| trim_span(document, span))
            .collect()
    }
}

impl StatementParser for SemicolonSplitter {
    fn parse(&self, document: &str, selection: Option<Range<usize>>) -> Vec<ParsedStatement> {
        Self::spans(document)
            .into_iter()
            .enumerate()
            .filter(|(_, span)| match &selection {
                Some(sel) if sel.start == sel.end => span.start <= sel.start && sel.start <= span.end,
                Some(sel) => span.start < sel.end && sel.start < span.end,
                None => true,
            })
            .map(|(statement_index, span)| ParsedStatement {
                sql: document[span.clone()].to_string(),
                statement_index,
                span,
            })
            .collect()
    }
}

/// Whether the text has anything besides whitespace and comments
fn has_code(text: &str) -> bool {
    let mut rest = text.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else {
            return !rest.is_empty();
        }
    }
}

fn trim_span(document: &str, span: Range<usize>) -> Range<usize> {
    let text = &document[span.clone()];
    let start = span.start + (text.len() - text.trim_start().len());
    let end = span.end - (text.len() - text.trim_end().len());
    start..end
}
