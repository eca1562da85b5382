//! File Reader - Decodes one delimited file into a relation under an encoding fallback policy

use crate::error::{IngestError, Result};
use crate::ingestion::record::Relation;
use csv::ReaderBuilder;
use encoding_rs::Encoding;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A decoded input file.
#[derive(Clone, Debug)]
pub struct DecodedFile {
    pub path: PathBuf,
    /// Encoding that finally decoded the bytes
    pub encoding: &'static str,
    /// True when the primary encoding failed and a fallback was used
    pub degraded: bool,
    pub relation: Relation,
}

/// Reads flat files, trying each configured encoding in order.
pub struct FileReader {
    encodings: Vec<&'static Encoding>,
}

impl FileReader {
    /// Build a reader from WHATWG encoding labels (e.g. `utf-8`, `latin1`).
    pub fn new<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let encodings = labels
            .iter()
            .map(|label| {
                Encoding::for_label(label.as_ref().trim().as_bytes()).ok_or_else(|| {
                    IngestError::Config(format!("Unknown encoding label: {}", label.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if encodings.is_empty() {
            return Err(IngestError::Config("At least one encoding is required".to_string()));
        }

        Ok(Self { encodings })
    }

    pub fn read(&self, path: &Path) -> Result<DecodedFile> {
        let bytes = std::fs::read(path).map_err(|source| IngestError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.decode(path, &bytes)
    }

    /// Decode raw bytes; `path` is only used for reporting.
    pub fn decode(&self, path: &Path, bytes: &[u8]) -> Result<DecodedFile> {
        for (attempt, encoding) in self.encodings.iter().copied().enumerate() {
            let Some(text) = decode_strict(encoding, bytes) else {
                debug!("{} is not valid {}", path.display(), encoding.name());
                continue;
            };

            let degraded = attempt > 0;
            if degraded {
                warn!(
                    "{} was read with '{}' encoding after '{}' failed",
                    path.display(),
                    encoding.name(),
                    self.encodings[0].name()
                );
            }

            let relation = parse_delimited(path, &text)?;
            return Ok(DecodedFile {
                path: path.to_path_buf(),
                encoding: encoding.name(),
                degraded,
                relation,
            });
        }

        Err(IngestError::Decode {
            path: path.to_path_buf(),
            tried: self
                .encodings
                .iter()
                .map(|e| e.name())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    let body = match Encoding::for_bom(bytes) {
        Some((bom_encoding, bom_len)) if bom_encoding == encoding => &bytes[bom_len..],
        _ => bytes,
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(|text| text.into_owned())
}

fn parse_delimited(path: &Path, text: &str) -> Result<Relation> {
    if text.trim().is_empty() {
        return Ok(Relation::default());
    }

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = rdr
        .headers()
        .map_err(|source| IngestError::Parse {
            path: path.to_path_buf(),
            source,
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    let headers = dedupe_headers(headers);

    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|source| IngestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if record.len() > headers.len() {
            return Err(IngestError::RaggedRow {
                path: path.to_path_buf(),
                line: record.position().map(|p| p.line()).unwrap_or(0),
                expected: headers.len(),
                found: record.len(),
            });
        }
        records.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }

    Ok(Relation::from_text(headers, records))
}

/// Suffix repeated header names with `.1`, `.2`, ...
///
/// Names compare ignoring ASCII case, since the store's identifiers do.
fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(headers.len());
    for header in headers {
        let mut candidate = header.clone();
        let mut suffix = 0;
        while seen.contains(&candidate.to_ascii_lowercase()) {
            suffix += 1;
            candidate = format!("{}.{}", header, suffix);
        }
        seen.insert(candidate.to_ascii_lowercase());
        out.push(candidate);
    }
    out
}
