//! Result cursor with one row of lookahead.
//!
//! Construction buffers the column definitions and prefetches the first row,
//! so `has_next` is always known without touching the socket. Each `next`
//! promotes the lookahead row to "current" and fetches the following one.

use std::sync::Arc;

use drizzle_core::error::{CursorError, CursorErrorKind, QueryError, QueryErrorKind};
use drizzle_core::{Error, Result};

use crate::column::ColumnDescriptor;
use crate::connection::{SessionSlot, wire_error};
use crate::wire::{RawRow, WireResult, drive};

/// Iterator over the rows of one statement's result.
#[derive(Debug)]
pub struct ResultCursor {
    slot: Arc<SessionSlot>,
    result: WireResult,
    columns: Vec<ColumnDescriptor>,
    current: Option<RawRow>,
    lookahead: Option<RawRow>,
    index: Option<u64>,
}

impl ResultCursor {
    pub(crate) fn new(slot: Arc<SessionSlot>, result: WireResult) -> Result<Self> {
        slot.set_result_open(true);
        let mut cursor = Self {
            slot,
            result,
            columns: Vec::new(),
            current: None,
            lookahead: None,
            index: None,
        };
        cursor.buffer_columns()?;
        cursor.prefetch()?;
        Ok(cursor)
    }

    fn buffer_columns(&mut self) -> Result<()> {
        let mut guard = self.slot.lock();
        let Some(session) = guard.as_mut() else {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::NotConnected,
                "Invalid result",
            )));
        };
        if let Err(err) = drive(session, |s| s.poll_columns(&mut self.result)) {
            self.slot.discard_if_broken(&mut guard, &err);
            return Err(wire_error(err, Some("Could not buffer columns")));
        }
        self.columns = self
            .result
            .columns()
            .iter()
            .map(ColumnDescriptor::from)
            .collect();
        Ok(())
    }

    fn prefetch(&mut self) -> Result<()> {
        if self.result.is_finished() {
            self.lookahead = None;
            return Ok(());
        }
        let mut guard = self.slot.lock();
        let Some(session) = guard.as_mut() else {
            return Err(wire_error(
                crate::wire::WireError::LostConnection,
                Some("Could not prefetch next row"),
            ));
        };
        match drive(session, |s| s.poll_row(&mut self.result)) {
            Ok(row) => {
                if self.result.is_finished() {
                    self.slot.track_status(session);
                }
                self.lookahead = row;
                Ok(())
            }
            Err(err) => {
                self.lookahead = None;
                self.slot.discard_if_broken(&mut guard, &err);
                Err(wire_error(err, Some("Could not prefetch next row")))
            }
        }
    }

    /// Is another row available?
    pub fn has_next(&self) -> bool {
        self.lookahead.is_some()
    }

    /// Advance to the next row.
    ///
    /// Returns `Ok(None)`, without side effects, once the rows are exhausted.
    /// If fetching the row after this one fails the error is returned and the
    /// advance still counts.
    pub fn next(&mut self) -> Result<Option<&RawRow>> {
        if self.lookahead.is_none() {
            return Ok(None);
        }
        self.current = self.lookahead.take();
        self.index = Some(self.index.map_or(0, |i| i + 1));
        tracing::trace!(index = ?self.index, "advanced cursor");
        self.prefetch()?;
        Ok(self.current.as_ref())
    }

    /// The row most recently returned by `next`.
    pub fn current(&self) -> Option<&RawRow> {
        self.current.as_ref()
    }

    /// Zero-based index of the current row.
    pub fn index(&self) -> Result<u64> {
        self.index.ok_or_else(|| {
            Error::Cursor(CursorError {
                kind: CursorErrorKind::NotOnRow,
                message: "Not standing on a row".to_string(),
            })
        })
    }

    pub fn column(&self, i: usize) -> Result<&ColumnDescriptor> {
        self.columns.get(i).ok_or_else(|| {
            Error::Cursor(CursorError {
                kind: CursorErrorKind::ColumnOutOfRange,
                message: "Wrong column index".to_string(),
            })
        })
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.result.column_count()
    }

    pub fn insert_id(&self) -> u64 {
        self.result.insert_id()
    }

    pub fn affected_count(&self) -> u64 {
        self.result.affected_rows()
    }

    pub fn warning_count(&self) -> u16 {
        self.result.warnings()
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        self.current = None;
        self.lookahead = None;
        if !self.result.is_finished() {
            let mut guard = self.slot.lock();
            if let Some(session) = guard.as_mut() {
                let result = &mut self.result;
                let drained = drive(session, |s| s.poll_columns(result)).and_then(|()| {
                    let mut skipped = 0u64;
                    while drive(session, |s| s.poll_row(result))?.is_some() {
                        skipped += 1;
                    }
                    Ok(skipped)
                });
                match drained {
                    Ok(skipped) => {
                        self.slot.track_status(session);
                        if skipped > 0 {
                            tracing::trace!(skipped, "drained unread rows");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to drain result; dropping session");
                        self.slot.discard_if_broken(&mut guard, &err);
                    }
                }
            }
        }
        self.slot.set_result_open(false);
    }
}
