//! Turn delimited text from file-based sources into raw records.
use std::collections::HashSet;

use thiserror::Error;

use crate::model::{CanonicalField, RawRecord, SourceConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("delimiter {0:?} is not a single ASCII character")]
    InvalidDelimiter(char),
    #[error("malformed input on line {line}: {message}")]
    Malformed { line: u64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub delimiter: u8,
    pub has_header: bool,
}

impl ParseOptions {
    pub fn from_config(config: &SourceConfig) -> Result<Self, ParseError> {
        if !config.delimiter.is_ascii() {
            return Err(ParseError::InvalidDelimiter(config.delimiter));
        }
        Ok(Self {
            delimiter: config.delimiter as u8,
            has_header: config.has_header,
        })
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
        }
    }
}

/// Name of the field at `position` when no header is declared: the canonical fields in
/// order, then `field_<position>`.
fn positional_name(position: usize) -> String {
    match CanonicalField::ALL.get(position) {
        Some(field) => field.as_str().to_owned(),
        None => format!("field_{}", position),
    }
}

/// Header names as keys. An empty or repeated name would drop or overwrite a value, so
/// those columns are keyed by `field_<position>` instead.
fn header_names(cells: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    cells
        .into_iter()
        .enumerate()
        .map(|(position, name)| {
            if name.is_empty() || !seen.insert(name.clone()) {
                format!("field_{}", position)
            } else {
                name
            }
        })
        .collect()
}

/// Parse delimited text into an ordered sequence of raw records.
///
/// With a header, the first line names the fields; values past the end of the header (or
/// under an empty or repeated header cell) are keyed by `field_<position>`. Without one,
/// fields are named positionally. Rows may be shorter than the header, in which case the
/// missing fields are simply absent. Lines with no content are skipped.
pub fn parse_rows(text: &str, options: ParseOptions) -> Result<Vec<RawRecord>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut records = reader.records();

    let header: Option<Vec<String>> = if options.has_header {
        match records.next() {
            Some(result) => Some(header_names(
                result.map_err(malformed)?.iter().map(str::to_owned).collect(),
            )),
            None => return Ok(Vec::new()),
        }
    } else {
        None
    };

    let mut rows = Vec::new();
    for result in records {
        let record = result.map_err(malformed)?;
        if record.iter().all(str::is_empty) {
            continue;
        }

        let row: RawRecord = record
            .iter()
            .enumerate()
            .map(|(position, value)| {
                let name = match header.as_ref().and_then(|h| h.get(position)) {
                    Some(name) => name.clone(),
                    None if header.is_some() => format!("field_{}", position),
                    None => positional_name(position),
                };
                (name, value.to_owned())
            })
            .collect();

        rows.push(row);
    }

    Ok(rows)
}

fn malformed(error: csv::Error) -> ParseError {
    let line = error.position().map(|p| p.line()).unwrap_or(0);
    ParseError::Malformed {
        line,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_with_header() {
        let text = "first_name,last_name,email\nJane,Doe,jane@x.com\n";

        let rows = parse_rows(text, ParseOptions::default()).unwrap();

        assert_eq!(
            rows,
            vec![record(&[
                ("first_name", "Jane"),
                ("last_name", "Doe"),
                ("email", "jane@x.com"),
            ])]
        );
    }

    #[test]
    fn test_repeated_header_keeps_every_value() {
        let text = "email,email,,phone\na@x.com,b@x.com,note,555\n";

        let rows = parse_rows(text, ParseOptions::default()).unwrap();

        assert_eq!(
            rows,
            vec![record(&[
                ("email", "a@x.com"),
                ("field_1", "b@x.com"),
                ("field_2", "note"),
                ("phone", "555"),
            ])]
        );
    }

    #[test]
    fn test_parse_without_header_is_positional() {
        let options = ParseOptions {
            delimiter: b';',
            has_header: false,
        };

        let rows = parse_rows("Jane;Doe;jane@x.com;555-0100;VIP\n", options).unwrap();

        assert_eq!(
            rows,
            vec![record(&[
                ("first_name", "Jane"),
                ("last_name", "Doe"),
                ("email", "jane@x.com"),
                ("phone", "555-0100"),
                ("field_4", "VIP"),
            ])]
        );
    }

    #[test]
    fn test_parse_ragged_rows_and_blank_lines() {
        let text = "Name,Email\n\nAda\nGrace,grace@x.com,extra\n";

        let rows = parse_rows(text, ParseOptions::default()).unwrap();

        assert_eq!(
            rows,
            vec![
                record(&[("Name", "Ada")]),
                record(&[("Name", "Grace"), ("Email", "grace@x.com"), ("field_2", "extra")]),
            ]
        );
    }

    #[test]
    fn test_parse_trims_and_handles_quotes() {
        let text = "email , company\n\"a@x.com\",\"Acme, Inc\"\n";

        let rows = parse_rows(text, ParseOptions::default()).unwrap();

        assert_eq!(rows, vec![record(&[("email", "a@x.com"), ("company", "Acme, Inc")])]);
    }

    #[test]
    fn test_parse_header_only_and_empty_text() {
        assert!(parse_rows("email\n", ParseOptions::default())
            .unwrap()
            .is_empty());
        assert!(parse_rows("", ParseOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = SourceConfig {
            delimiter: '\t',
            has_header: false,
            ..Default::default()
        };
        assert_eq!(
            ParseOptions::from_config(&config),
            Ok(ParseOptions {
                delimiter: b'\t',
                has_header: false,
            })
        );

        config.delimiter = '¦';
        assert_eq!(
            ParseOptions::from_config(&config),
            Err(ParseError::InvalidDelimiter('¦'))
        );
    }
}
