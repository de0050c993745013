//! Output formatting: table, JSON, plain.
//!
//! Table uses `tabled`, structured formats use serde, plain emits one
//! identifier per line.

use std::io::{self, Write};

use tabled::{Table, Tabled, settings::Style};

use crate::cli::OutputFormat;
use crate::error::CliError;

/// Render rows that double as their own serde representation.
pub fn render_list<R>(
    format: OutputFormat,
    rows: &[R],
    id_fn: impl Fn(&R) -> String,
) -> Result<String, CliError>
where
    R: Tabled + serde::Serialize,
{
    Ok(match format {
        OutputFormat::Table => Table::new(rows).with(Style::rounded()).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(rows)?,
        OutputFormat::JsonCompact => serde_json::to_string(rows)?,
        OutputFormat::Plain => rows.iter().map(id_fn).collect::<Vec<_>>().join("\n"),
    })
}

/// Render a single summary value. Table and plain use `text`.
pub fn render_single<T: serde::Serialize>(
    format: OutputFormat,
    data: &T,
    text: impl FnOnce(&T) -> String,
) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Table | OutputFormat::Plain => text(data),
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::JsonCompact => serde_json::to_string(data)?,
    })
}

pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Tabled, serde::Serialize)]
    struct Row {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "State")]
        state: String,
    }

    fn rows() -> Vec<Row> {
        vec![
            Row {
                id: "CVD-1".into(),
                state: "IDLE".into(),
            },
            Row {
                id: "CVD-2".into(),
                state: "ALARM".into(),
            },
        ]
    }

    #[test]
    fn plain_lists_identifiers() {
        let out = render_list(OutputFormat::Plain, &rows(), |r| r.id.clone()).unwrap();
        assert_eq!(out, "CVD-1\nCVD-2");
    }

    #[test]
    fn table_has_headers_and_values() {
        let out = render_list(OutputFormat::Table, &rows(), |r| r.id.clone()).unwrap();
        assert!(out.contains("State"));
        assert!(out.contains("ALARM"));
    }

    #[test]
    fn compact_json_is_one_line() {
        let out = render_list(OutputFormat::JsonCompact, &rows(), |r| r.id.clone()).unwrap();
        assert_eq!(
            out,
            r#"[{"id":"CVD-1","state":"IDLE"},{"id":"CVD-2","state":"ALARM"}]"#
        );
    }
}
