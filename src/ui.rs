// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use console::Style;
use indicatif::MultiProgress;
use memchr::memrchr;
use std::io::{self, Write};

/// Writes whole lines to `inner` with the progress bars hidden.
///
/// Partial lines stay buffered until a newline arrives or the writer is
/// flushed.
pub struct SuspendingWriter<T: Write> {
    inner: T,
    bars: MultiProgress,
    pending: Vec<u8>,
}

impl<T: Write> SuspendingWriter<T> {
    pub fn new(inner: T, bars: MultiProgress) -> Self {
        Self {
            inner,
            bars,
            pending: Vec::new(),
        }
    }

    fn write_pending(&mut self, end: usize) -> io::Result<()> {
        let chunk: Vec<u8> = self.pending.drain(..end).collect();
        let inner = &mut self.inner;
        self.bars.suspend(|| inner.write_all(&chunk))
    }
}

impl<T: Write> Write for SuspendingWriter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if let Some(newline) = memrchr(b'\n', &self.pending) {
            self.write_pending(newline + 1)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.write_pending(self.pending.len())?;
        }
        self.inner.flush()
    }
}

impl<T: Write> Drop for SuspendingWriter<T> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Styled text in one table cell.
pub(crate) struct Cell {
    text: String,
    style: Style,
}

impl Cell {
    pub(crate) fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }

    fn width(&self) -> usize {
        console::measure_text_width(&self.text)
    }
}

/// Report rows printed in padded columns under underlined titles.
pub(crate) struct Table {
    titles: Vec<Cell>,
    rows: Vec<Vec<Cell>>,
    right_aligned: Vec<usize>,
    show_titles: bool,
}

impl Table {
    pub(crate) fn titled(titles: &[&str], no_header: bool) -> Self {
        Self {
            titles: titles
                .iter()
                .map(|title| Cell::new(*title, Style::new().underlined()))
                .collect(),
            rows: Vec::new(),
            right_aligned: Vec::new(),
            show_titles: !no_header,
        }
    }

    /// Pad the cells of `column` on the left.
    pub(crate) fn align_right(mut self, column: usize) -> Self {
        self.right_aligned.push(column);
        self
    }

    pub(crate) fn push(&mut self, row: Vec<Cell>) {
        self.rows.push(row);
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.titles.iter().map(Cell::width).collect();
        for row in &self.rows {
            if widths.len() < row.len() {
                widths.resize(row.len(), 0);
            }
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.width());
            }
        }
        widths
    }

    fn write_row<W: Write>(&self, writer: &mut W, row: &[Cell], widths: &[usize]) -> io::Result<()> {
        let line: Vec<String> = row
            .iter()
            .zip(widths)
            .enumerate()
            .map(|(column, (cell, &width))| {
                let padded = if self.right_aligned.contains(&column) {
                    format!("{:>width$}", cell.text)
                } else {
                    format!("{:<width$}", cell.text)
                };
                cell.style.apply_to(padded).to_string()
            })
            .collect();
        writeln!(writer, "{}", line.join(" "))
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let widths = self.widths();
        if self.show_titles {
            self.write_row(writer, &self.titles, &widths)?;
        }
        for row in &self.rows {
            self.write_row(writer, row, &widths)?;
        }
        Ok(())
    }
}
