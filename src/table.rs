use thiserror::Error;

/// One result row: column name to display value, in the order the database
/// returned the columns. `None` is SQL NULL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, Option<String>)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.push(column, value.map(Into::into));
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: Option<String>) {
        self.cells.push((column.into(), value));
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    /// Cells in database order; names may repeat.
    pub fn cells(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.cells
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("row {row} has no column `{column}`")]
    MissingColumn { row: usize, column: String },
    #[error("row {row} has {extra} column(s) beyond the header")]
    ExtraColumns { row: usize, extra: usize },
    #[error("first row has no columns")]
    NoColumns,
}

fn width(value: &str) -> usize {
    value.chars().count()
}

fn pad(out: &mut String, value: &str, width_to: usize) {
    out.push_str(value);
    for _ in width(value)..width_to {
        out.push(' ');
    }
}

/// Fixed-width rendering: header from the first row's columns, a dash line
/// sized to each column's widest value, then one left-justified line per row.
/// An empty row slice renders as an empty string.
pub fn format_table(rows: &[Row]) -> Result<String, FormatError> {
    let Some(first) = rows.first() else {
        return Ok(String::new());
    };
    let header: Vec<&str> = first.columns().collect();
    if header.is_empty() {
        return Err(FormatError::NoColumns);
    }

    let mut grid: Vec<Vec<&str>> = Vec::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let mut line = Vec::with_capacity(header.len());
        let mut cells = row.cells();
        for column in &header {
            match cells.next() {
                Some((name, value)) if name == *column => line.push(value.unwrap_or("")),
                _ => {
                    return Err(FormatError::MissingColumn {
                        row: idx,
                        column: column.to_string(),
                    });
                }
            }
        }
        let extra = cells.count();
        if extra > 0 {
            return Err(FormatError::ExtraColumns { row: idx, extra });
        }
        grid.push(line);
    }

    let widths: Vec<usize> = header
        .iter()
        .enumerate()
        .map(|(col, name)| {
            grid.iter()
                .map(|line| width(line[col]))
                .chain(std::iter::once(width(name)))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    let mut write_line = |cells: &[&str]| {
        for (col, cell) in cells.iter().enumerate() {
            if col > 0 {
                out.push(' ');
            }
            pad(&mut out, cell, widths[col]);
        }
        out.push('\n');
    };

    write_line(&header[..]);
    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let dash_refs: Vec<&str> = dashes.iter().map(String::as_str).collect();
    write_line(&dash_refs[..]);
    for line in &grid {
        write_line(&line[..]);
    }

    if out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

/// Render several result sets, separated by a blank line.
pub fn format_result_sets(sets: &[Vec<Row>]) -> Result<String, FormatError> {
    let mut out = String::new();
    for (idx, rows) in sets.iter().enumerate() {
        if idx > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&format_table(rows)?);
    }
    Ok(out)
}
