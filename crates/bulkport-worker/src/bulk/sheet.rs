//! Streaming spreadsheet reader
//!
//! Reads delimited text one record at a time; memory use is bounded by the
//! longest row, not the file.

use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord, Trim};
use tokio::io::AsyncRead;

use super::processor::Row;
use super::{BulkError, Result};

/// One data row; `number` is 1-based and excludes the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub number: u64,
    pub cells: Row,
}

/// Field delimiter for a file name
pub fn delimiter_for(file_name: &str) -> Result<u8> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "tsv" | "tab" => Ok(b'\t'),
        "xls" | "xlsx" | "xlsm" | "ods" => Err(BulkError::Parse(format!(
            "'{}' is a binary spreadsheet; export it as CSV or TSV",
            file_name
        ))),
        _ => Ok(b','),
    }
}

/// `Media URLs` → `media_urls`
fn normalize_header(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect()
}

pub struct SheetReader<R> {
    records: AsyncReader<R>,
    headers: Vec<String>,
    template: Row,
    record: StringRecord,
    next_number: u64,
}

impl<R> SheetReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read the header line; `template` supplies defaults for missing cells
    pub async fn open(reader: R, file_name: &str, template: Row) -> Result<Self> {
        let mut records = AsyncReaderBuilder::new()
            .delimiter(delimiter_for(file_name)?)
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .create_reader(reader);

        let headers: Vec<String> = records
            .headers()
            .await?
            .iter()
            .map(normalize_header)
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(BulkError::Parse(format!("'{}' has no header row", file_name)));
        }

        Ok(Self {
            records,
            headers,
            template,
            record: StringRecord::new(),
            next_number: 1,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Next non-blank row, or `None` at end of input
    pub async fn next_row(&mut self) -> Result<Option<SheetRow>> {
        loop {
            if !self.records.read_record(&mut self.record).await? {
                return Ok(None);
            }
            if self.record.iter().all(str::is_empty) {
                continue;
            }

            let mut cells = self.template.clone();
            for (header, value) in self.headers.iter().zip(self.record.iter()) {
                if header.is_empty() {
                    continue;
                }
                if !value.is_empty() || !cells.contains_key(header) {
                    cells.insert(header.clone(), value.to_string());
                }
            }

            let number = self.next_number;
            self.next_number += 1;
            return Ok(Some(SheetRow { number, cells }));
        }
    }
}
