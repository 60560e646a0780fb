//! Raw archive to columnar artifacts
//!
//! A bulk download is a zip of tab-delimited schedule files, one `.txt` per
//! schedule. [`TsvZipConverter`] unpacks it and rewrites every schedule as a
//! [`ColumnarArtifact`] without touching cell contents: the files are Latin-1,
//! so each byte maps to exactly one character and nothing is lost.

use crate::artifact::{artifact_file_name, ColumnarArtifact, TableArtifact};
use crate::error::{Result, SyncError};
use crate::period::Period;
use async_trait::async_trait;
use cdr_common::checksum::sha256_file;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Written into the extraction directory once unpacking has finished
const EXTRACTED_MARKER: &str = ".extracted";

#[async_trait]
pub trait StagingConverter: Send + Sync {
    /// Produce one artifact per logical table found in `archive`
    ///
    /// `extract_dir` receives the unpacked originals and `artifact_dir` the
    /// artifacts. Any table failing to convert fails the whole period.
    async fn convert(
        &self,
        period: &Period,
        archive: &Path,
        extract_dir: &Path,
        artifact_dir: &Path,
    ) -> Result<Vec<TableArtifact>>;
}

/// Converter for zipped tab-delimited schedule files
#[derive(Debug, Clone, Default)]
pub struct TsvZipConverter;

impl TsvZipConverter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StagingConverter for TsvZipConverter {
    async fn convert(
        &self,
        period: &Period,
        archive: &Path,
        extract_dir: &Path,
        artifact_dir: &Path,
    ) -> Result<Vec<TableArtifact>> {
        let task_period = period.clone();
        let archive = archive.to_path_buf();
        let extract_dir = extract_dir.to_path_buf();
        let artifact_dir = artifact_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            convert_archive(&task_period, &archive, &extract_dir, &artifact_dir)
        })
        .await
        .map_err(|e| SyncError::conversion(period, None, format!("conversion task failed: {}", e)))?
    }
}

fn convert_archive(
    period: &Period,
    archive: &Path,
    extract_dir: &Path,
    artifact_dir: &Path,
) -> Result<Vec<TableArtifact>> {
    extract_archive(period, archive, extract_dir)?;

    let files = schedule_files(extract_dir)?;
    if files.is_empty() {
        return Err(SyncError::conversion(
            period,
            None,
            "archive contains no .txt schedule files",
        ));
    }
    info!(period = %period, schedules = files.len(), "Converting schedules");

    std::fs::create_dir_all(artifact_dir)?;
    let mut seen = HashSet::new();
    let mut artifacts = Vec::with_capacity(files.len());

    for file in files {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let table = table_name(&stem, period);

        if !seen.insert(table.clone()) {
            return Err(SyncError::conversion(
                period,
                Some(table.as_str()),
                format!("{} maps to a table name already in use", file.display()),
            ));
        }

        let artifact = read_schedule(period, &table, &file)?;
        let path = artifact_dir.join(artifact_file_name(&table));
        artifact
            .write(&path)
            .map_err(|e| SyncError::conversion(period, Some(table.as_str()), e))?;
        let checksum = sha256_file(&path)
            .map_err(|e| SyncError::conversion(period, Some(table.as_str()), e))?;

        debug!(
            period = %period,
            table = %table,
            rows = artifact.row_count(),
            columns = artifact.columns.len(),
            "Schedule converted"
        );

        artifacts.push(TableArtifact {
            table_name: table,
            path,
            row_count: artifact.row_count() as u64,
            checksum,
        });
    }

    Ok(artifacts)
}

/// Unpack `archive` into `extract_dir` unless a finished extraction is already there
fn extract_archive(period: &Period, archive: &Path, extract_dir: &Path) -> Result<()> {
    if extract_dir.join(EXTRACTED_MARKER).exists() {
        info!(period = %period, dir = %extract_dir.display(), "Reusing extracted archive");
        return Ok(());
    }

    if extract_dir.exists() {
        std::fs::remove_dir_all(extract_dir)?;
    }
    std::fs::create_dir_all(extract_dir)?;

    let file = File::open(archive)
        .map_err(|e| SyncError::conversion(period, None, format!("cannot open archive: {}", e)))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| SyncError::conversion(period, None, format!("not a zip archive: {}", e)))?;
    zip.extract(extract_dir)
        .map_err(|e| SyncError::conversion(period, None, format!("extraction failed: {}", e)))?;

    std::fs::write(extract_dir.join(EXTRACTED_MARKER), b"")?;
    debug!(period = %period, entries = zip.len(), "Archive extracted");
    Ok(())
}

fn schedule_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_txt = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if is_txt && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Table name for a schedule file stem
///
/// The period's `mmddyyyy` token is dropped so one schedule lands in the same
/// table every quarter, then every non-alphanumeric run becomes one `_`:
/// `FFIEC CDR Call Schedule RCCII 03312024(1 of 2)` becomes
/// `FFIEC_CDR_Call_Schedule_RCCII_1_of_2`.
pub fn table_name(stem: &str, period: &Period) -> String {
    let date_token = period.date().format("%m%d%Y").to_string();
    let stem = stem.replace(&date_token, " ");

    let mut name = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_alphanumeric() {
            name.push(c);
        } else if !name.is_empty() && !name.ends_with('_') {
            name.push('_');
        }
    }

    let name = name.trim_end_matches('_');
    if name.is_empty() {
        "schedule".to_string()
    } else {
        name.to_string()
    }
}

/// Header de-duplication in the style of pandas `read_csv`
///
/// A blank header becomes `Unnamed: {index}`; repeats get `.1`, `.2`, ...
pub fn dedupe_headers(raw: Vec<String>) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    let mut headers = Vec::with_capacity(raw.len());

    for (idx, name) in raw.into_iter().enumerate() {
        let base = if name.is_empty() {
            format!("Unnamed: {}", idx)
        } else {
            name
        };

        let mut candidate = base.clone();
        let mut suffix = 0;
        while used.contains(&candidate) {
            suffix += 1;
            candidate = format!("{}.{}", base, suffix);
        }
        used.insert(candidate.clone());
        headers.push(candidate);
    }

    headers
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn read_schedule(period: &Period, table: &str, path: &Path) -> Result<ColumnarArtifact> {
    let err = |reason: String| SyncError::conversion(period, Some(table), reason);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| err(format!("cannot open {}: {}", path.display(), e)))?;

    let raw_headers: Vec<String> = reader
        .byte_headers()
        .map_err(|e| err(format!("cannot read header: {}", e)))?
        .iter()
        .map(latin1)
        .collect();
    if raw_headers.is_empty() {
        return Err(err("schedule file is empty".to_string()));
    }
    let headers = dedupe_headers(raw_headers);
    let width = headers.len();

    let mut rows = Vec::new();
    for (idx, record) in reader.byte_records().enumerate() {
        let record = record.map_err(|e| err(format!("row {}: {}", idx + 1, e)))?;
        if record.len() > width {
            return Err(err(format!(
                "row {} has {} fields, header has {}",
                idx + 1,
                record.len(),
                width
            )));
        }

        let mut row: Vec<String> = record.iter().map(latin1).collect();
        // Short rows are padded the way pandas fills missing trailing fields.
        row.resize(width, String::new());
        rows.push(row);
    }

    ColumnarArtifact::from_rows(table, period.id(), headers, rows)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, content) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    struct Dirs {
        _root: TempDir,
        archive: PathBuf,
        extract: PathBuf,
        artifacts: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        Dirs {
            archive: root.path().join("call_03-31-2024.zip"),
            extract: root.path().join("extracted"),
            artifacts: root.path().join("artifacts"),
            _root: root,
        }
    }

    fn q1() -> Period {
        Period::parse("3/31/2024").unwrap()
    }

    #[test]
    fn test_table_names() {
        let period = q1();
        assert_eq!(
            table_name("FFIEC CDR Call Schedule RC 03312024", &period),
            "FFIEC_CDR_Call_Schedule_RC"
        );
        assert_eq!(
            table_name("FFIEC CDR Call Schedule RCCII 03312024(1 of 2)", &period),
            "FFIEC_CDR_Call_Schedule_RCCII_1_of_2"
        );
        assert_eq!(table_name("Readme", &period), "Readme");
        assert_eq!(table_name("()", &period), "schedule");
    }

    #[test]
    fn test_headers_deduped_like_pandas() {
        let raw = ["IDRSSD", "RCON2170", "RCON2170", "", "RCON2170.1", "RCON2170"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            dedupe_headers(raw),
            vec!["IDRSSD", "RCON2170", "RCON2170.1", "Unnamed: 3", "RCON2170.1.1", "RCON2170.2"]
        );
    }

    #[tokio::test]
    async fn test_converts_every_schedule_verbatim() {
        let dirs = dirs();
        write_zip(
            &dirs.archive,
            &[
                (
                    "FFIEC CDR Call Schedule RC 03312024.txt",
                    &b"IDRSSD\tRCFD2170\tRCFD2170\n\"IDRSSD\"\tTOTAL ASSETS\tTOTAL ASSETS\n37\t 1000 \t\n"[..],
                ),
                ("FFIEC CDR Call Bulk POR 03312024.txt", &b"IDRSSD\tName\n37\tBanco Espa\xf1ol\n42\n"[..]),
                ("Readme.pdf", &b"%PDF"[..]),
            ],
        );

        let artifacts = TsvZipConverter::new()
            .convert(&q1(), &dirs.archive, &dirs.extract, &dirs.artifacts)
            .await
            .unwrap();

        let names: Vec<&str> = artifacts.iter().map(|a| a.table_name.as_str()).collect();
        assert_eq!(names, vec!["FFIEC_CDR_Call_Bulk_POR", "FFIEC_CDR_Call_Schedule_RC"]);

        let por = ColumnarArtifact::read(&artifacts[0].path).unwrap();
        assert_eq!(por.period, "03-31-2024");
        assert_eq!(por.rows(0..2), vec![vec!["37", "Banco Espa\u{f1}ol"], vec!["42", ""]]);

        let rc = ColumnarArtifact::read(&artifacts[1].path).unwrap();
        assert_eq!(rc.column_names(), vec!["IDRSSD", "RCFD2170", "RCFD2170.1"]);
        assert_eq!(artifacts[1].row_count, 2);
        assert_eq!(rc.rows(1..2), vec![vec!["37", " 1000 ", ""]]);
        assert_eq!(artifacts[1].checksum, sha256_file(&artifacts[1].path).unwrap());
    }

    #[tokio::test]
    async fn test_bad_schedule_fails_period_with_table_name() {
        let dirs = dirs();
        write_zip(
            &dirs.archive,
            &[
                ("FFIEC CDR Call Schedule RC 03312024.txt", &b"a\tb\n1\t2\n"[..]),
                ("FFIEC CDR Call Schedule RI 03312024.txt", &b"a\tb\n1\t2\t3\n"[..]),
            ],
        );

        let err = TsvZipConverter::new()
            .convert(&q1(), &dirs.archive, &dirs.extract, &dirs.artifacts)
            .await
            .unwrap_err();

        match err {
            SyncError::Conversion { table, .. } => {
                assert_eq!(table.as_deref(), Some("FFIEC_CDR_Call_Schedule_RI"))
            },
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_not_a_zip() {
        let dirs = dirs();
        std::fs::write(&dirs.archive, b"<html>maintenance</html>").unwrap();

        let err = TsvZipConverter::new()
            .convert(&q1(), &dirs.archive, &dirs.extract, &dirs.artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conversion { table: None, .. }));
    }

    #[tokio::test]
    async fn test_finished_extraction_is_reused() {
        let dirs = dirs();
        write_zip(&dirs.archive, &[("RC 03312024.txt", &b"a\n1\n"[..])]);
        let converter = TsvZipConverter::new();
        converter
            .convert(&q1(), &dirs.archive, &dirs.extract, &dirs.artifacts)
            .await
            .unwrap();

        // The archive is gone but the marked extraction is enough.
        std::fs::remove_file(&dirs.archive).unwrap();
        let artifacts = converter
            .convert(&q1(), &dirs.archive, &dirs.extract, &dirs.artifacts)
            .await
            .unwrap();
        assert_eq!(artifacts[0].table_name, "RC");
        assert_eq!(artifacts[0].row_count, 1);
    }
}
