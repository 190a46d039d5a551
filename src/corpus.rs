use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Result, RetrievalError};
use crate::record::CorpusRecord;

/// One JSON Lines row. Column names match the support spreadsheet export.
#[derive(Deserialize)]
struct CorpusRow {
    #[serde(default)]
    id: Option<u64>,
    #[serde(alias = "Query")]
    query: String,
    #[serde(alias = "Solution", default)]
    solution: Option<String>,
}

/// Parses JSON Lines corpus rows. Rows without an `id` get their 1-based row
/// number, or the next free number when that one is claimed by an explicit
/// id. Rows repeating an earlier explicit id are skipped.
pub fn parse_corpus<R: BufRead>(reader: R) -> Result<Vec<CorpusRecord>> {
    let mut rows = Vec::new();
    for (line_index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }
        let row: CorpusRow = serde_json::from_str(&line).map_err(|e| RetrievalError::CorpusFormat {
            line: line_index + 1,
            reason: e.to_string(),
        })?;
        rows.push((line_index + 1, row));
    }

    let explicit_ids: HashSet<u64> = rows.iter().filter_map(|(_, row)| row.id).collect();
    let mut seen_ids = HashSet::new();
    let mut records = Vec::with_capacity(rows.len());

    for (row_index, (line, row)) in rows.into_iter().enumerate() {
        let id = match row.id {
            Some(id) => {
                if !seen_ids.insert(id) {
                    warn!("Duplicate record id {} on line {}. Skipping.", id, line);
                    continue;
                }
                id
            }
            None => {
                let mut id = row_index as u64 + 1;
                while explicit_ids.contains(&id) || seen_ids.contains(&id) {
                    id += 1;
                }
                if id != row_index as u64 + 1 {
                    debug!("Row on line {} takes id {}; its row number is already used", line, id);
                }
                seen_ids.insert(id);
                id
            }
        };

        records.push(CorpusRecord {
            id,
            query: row.query,
            solution: row.solution.unwrap_or_default(),
        });
    }

    Ok(records)
}

pub fn load_corpus(path: &Path) -> Result<Vec<CorpusRecord>> {
    let file = File::open(path)?;
    let records = parse_corpus(BufReader::new(file))?;
    info!("Read {} corpus records from {}", records.len(), path.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_and_assigns_missing_ids() {
        let input = r#"{"query": "reset password", "solution": "click forgot password"}

{"Query": "update billing info", "Solution": "go to billing page"}
{"id": 40, "query": "cancel plan"}
"#;
        let records = parse_corpus(input.as_bytes()).unwrap();
        assert_eq!(
            records,
            vec![
                CorpusRecord::new(1, "reset password", "click forgot password"),
                CorpusRecord::new(2, "update billing info", "go to billing page"),
                CorpusRecord::new(40, "cancel plan", ""),
            ]
        );
    }

    #[test]
    fn skips_duplicate_ids() {
        let input = "{\"id\": 7, \"query\": \"a\", \"solution\": \"x\"}\n{\"id\": 7, \"query\": \"b\", \"solution\": \"y\"}\n";
        let records = parse_corpus(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].query, "a");
    }

    #[test]
    fn implicit_ids_avoid_explicit_ones() {
        let input = r#"{"id": 2, "query": "reset password", "solution": "click forgot password"}
{"query": "update billing info", "solution": "go to billing page"}
{"query": "cancel plan"}
{"id": 1, "query": "change email"}
"#;
        let records = parse_corpus(input.as_bytes()).unwrap();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 1]);
        assert_eq!(records[1].query, "update billing info");
    }

    #[test]
    fn reports_the_offending_line() {
        let input = "{\"query\": \"ok\", \"solution\": \"fine\"}\nnot json\n";
        match parse_corpus(input.as_bytes()) {
            Err(RetrievalError::CorpusFormat { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn missing_query_column_is_rejected() {
        let input = "{\"solution\": \"orphan\"}\n";
        assert!(matches!(
            parse_corpus(input.as_bytes()),
            Err(RetrievalError::CorpusFormat { line: 1, .. })
        ));
    }

    #[test]
    fn empty_input_gives_empty_corpus() {
        assert!(parse_corpus("".as_bytes()).unwrap().is_empty());
    }
}
