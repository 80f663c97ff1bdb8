use serde::{Deserialize, Serialize};
use tracing::debug;

use super::matcher::{InstrPattern, find_pattern, format_patterns};
use super::{InstrId, InstructionStream, Label, StreamInstruction};
use crate::error::{Error, Result};

/// Where the cursor lands relative to a matched span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveType {
    /// In front of the first matched instruction.
    #[default]
    Before,
    /// In front of the last matched instruction.
    Last,
    /// Behind the last matched instruction.
    After,
}

/// Matched range of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Insertion point in a stream, sitting in front of the instruction at
/// [`Cursor::index`].
///
/// Labels marked at the cursor follow it until it moves: the first
/// instruction emitted afterwards becomes their target.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    index: usize,
    pending_labels: Vec<Label>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn goto(&mut self, stream: &InstructionStream, index: usize) -> Result<()> {
        if index > stream.len() {
            return Err(Error::corruption(format!(
                "cursor position {} is past the end of the stream ({} instructions)",
                index,
                stream.len()
            )));
        }
        self.index = index;
        self.pending_labels.clear();
        Ok(())
    }

    /// Search forward from the cursor; on a match, move according to `move_type`.
    pub fn try_seek_forward(
        &mut self,
        stream: &InstructionStream,
        patterns: &[InstrPattern],
        move_type: MoveType,
    ) -> Option<Span> {
        let start = find_pattern(stream, self.index, patterns)?;
        let span = Span {
            start,
            len: patterns.len(),
        };
        self.index = match move_type {
            MoveType::Before => span.start,
            MoveType::Last => span.end().saturating_sub(1).max(span.start),
            MoveType::After => span.end(),
        };
        self.pending_labels.clear();
        debug!(
            "Matched {} instructions at {}, cursor now at {}",
            span.len, span.start, self.index
        );
        Some(span)
    }

    /// Like [`Cursor::try_seek_forward`], but a missing anchor is an error.
    pub fn seek_forward(
        &mut self,
        stream: &InstructionStream,
        patterns: &[InstrPattern],
        move_type: MoveType,
    ) -> Result<Span> {
        let from = self.index;
        self.try_seek_forward(stream, patterns, move_type)
            .ok_or_else(|| {
                Error::not_found(
                    "Anchor",
                    format_patterns(patterns),
                    format!("instructions {}..{}", from, stream.len()),
                    stream
                        .iter()
                        .skip(from)
                        .take(patterns.len().max(1) * 4)
                        .map(|(_, instr)| instr.to_string()),
                )
            })
    }

    /// Bind `label` to the cursor position.
    ///
    /// The label targets the instruction after the cursor until something is
    /// emitted here, then it targets the first emitted instruction.
    pub fn mark_label(&mut self, stream: &mut InstructionStream, label: Label) -> Result<()> {
        match stream.id_at(self.index) {
            Some(id) => stream.bind_label(label, id)?,
            None => stream.unbind_label(label)?,
        }
        if !self.pending_labels.contains(&label) {
            self.pending_labels.push(label);
        }
        Ok(())
    }

    /// Insert instructions at the cursor and move past them.
    pub fn emit(
        &mut self,
        stream: &mut InstructionStream,
        instrs: Vec<StreamInstruction>,
    ) -> Result<Vec<InstrId>> {
        let ids = stream.insert(self.index, instrs)?;
        if let Some(&first) = ids.first() {
            for label in self.pending_labels.drain(..) {
                stream.bind_label(label, first)?;
            }
        }
        self.index += ids.len();
        Ok(ids)
    }

    /// Remove `count` instructions after the cursor.
    ///
    /// Pending labels move on to whatever follows the removed range.
    pub fn remove(
        &mut self,
        stream: &mut InstructionStream,
        count: usize,
    ) -> Result<Vec<StreamInstruction>> {
        let previous: Vec<(Label, Option<InstrId>)> = self
            .pending_labels
            .iter()
            .map(|&label| (label, stream.label_target(label)))
            .collect();
        for &label in &self.pending_labels {
            stream.unbind_label(label)?;
        }

        let removed = match stream.remove_range(self.index, count) {
            Ok(removed) => removed,
            Err(e) => {
                for (label, target) in previous {
                    if let Some(id) = target {
                        stream.bind_label(label, id)?;
                    }
                }
                return Err(e);
            }
        };

        if let Some(id) = stream.id_at(self.index) {
            for &label in &self.pending_labels {
                stream.bind_label(label, id)?;
            }
        }
        Ok(removed)
    }
}
