//! On-disk output artifacts: one `.eml` per archived message.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::ai::{Classification, Extraction};

pub const CLASSIFICATION_HEADER: &str = "X-Mailvault-Classification";
pub const EXTRACTION_HEADER: &str = "X-Mailvault-Extraction";

const MAX_SUBJECT_CHARS: usize = 100;
const MAX_SLUG_CHARS: usize = 60;
const HEADER_FOLD_WIDTH: usize = 76;

static ILLEGAL_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|]"#).expect("valid regex"));
static REPEATED_UNDERSCORES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_{2,}").expect("valid regex"));
static SLUG_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode AI metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed {header} header: {message}")]
    Decode { header: &'static str, message: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Filename-safe subject: illegal characters become `_`, control characters
/// are dropped, at most 100 characters.
pub fn sanitize_subject(subject: Option<&str>) -> String {
    let subject = subject.map(str::trim).unwrap_or_default();
    if subject.is_empty() {
        return "No_Subject".to_string();
    }
    let replaced = ILLEGAL_FILENAME_CHARS.replace_all(subject, "_");
    let printable: String = replaced.chars().filter(|c| !c.is_control()).collect();
    let collapsed = REPEATED_UNDERSCORES.replace_all(&printable, "_");
    let trimmed: String = collapsed.trim().chars().take(MAX_SUBJECT_CHARS).collect();
    if trimmed.is_empty() {
        "No_Subject".to_string()
    } else {
        trimmed.trim_end().to_string()
    }
}

/// Lowercase ASCII slug joined with `-`.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let slug = SLUG_SEPARATORS.replace_all(&lowered, "-");
    let slug: String = slug.trim_matches('-').chars().take(MAX_SLUG_CHARS).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "no-subject".to_string()
    } else {
        slug.to_string()
    }
}

fn id_suffix(message_id: &str) -> String {
    let chars: Vec<char> = message_id.chars().collect();
    let start = chars.len().saturating_sub(8);
    chars[start..]
        .iter()
        .map(|c| if c.is_ascii_alphanumeric() || *c == '-' { *c } else { '_' })
        .collect()
}

fn date_prefix(received: Option<DateTime<Utc>>) -> String {
    match received {
        Some(at) => at.format("%Y%m%d_%H%M").to_string(),
        None => "00000000_0000".to_string(),
    }
}

/// `YYYYMMDD_HHMM_<subject>_<id8>.eml`, times in UTC.
pub fn archive_filename(
    subject: Option<&str>,
    received: Option<DateTime<Utc>>,
    message_id: &str,
) -> String {
    format!(
        "{}_{}_{}.eml",
        date_prefix(received),
        sanitize_subject(subject),
        id_suffix(message_id)
    )
}

/// Clean renamed form: `YYYYMMDD_HHMM_[<category>_]<slug>_<id8>.eml`.
pub fn slug_filename(
    subject: Option<&str>,
    received: Option<DateTime<Utc>>,
    message_id: &str,
    category: Option<&str>,
) -> String {
    let category = category
        .map(slugify)
        .filter(|c| c != "no-subject")
        .map(|c| format!("{c}_"))
        .unwrap_or_default();
    format!(
        "{}_{}{}_{}.eml",
        date_prefix(received),
        category,
        slugify(subject.unwrap_or_default()),
        id_suffix(message_id)
    )
}

fn line_ending(raw: &[u8]) -> &'static [u8] {
    match raw.iter().position(|b| *b == b'\n') {
        Some(pos) if pos > 0 && raw[pos - 1] == b'\r' => b"\r\n",
        _ => b"\n",
    }
}

/// Splits at the blank line ending the header block. The head keeps its
/// final line ending; the body starts with the blank line.
fn split_message(raw: &[u8]) -> (&[u8], &[u8], &'static [u8]) {
    let eol = line_ending(raw);
    let separator = [eol, eol].concat();
    match raw
        .windows(separator.len())
        .position(|window| window == separator.as_slice())
    {
        Some(pos) => (&raw[..pos + eol.len()], &raw[pos + eol.len()..], eol),
        None => (raw, &[], eol),
    }
}

fn ai_header_name(line: &[u8]) -> Option<&'static str> {
    let colon = line.iter().position(|b| *b == b':')?;
    let name = std::str::from_utf8(&line[..colon]).ok()?.trim();
    [CLASSIFICATION_HEADER, EXTRACTION_HEADER]
        .into_iter()
        .find(|header| header.eq_ignore_ascii_case(name))
}

fn push_header(out: &mut Vec<u8>, name: &str, payload: &[u8], eol: &[u8]) {
    let encoded = STANDARD.encode(payload);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    let first = HEADER_FOLD_WIDTH.saturating_sub(name.len() + 2).max(1);
    let (head, mut rest) = encoded.split_at(first.min(encoded.len()));
    out.extend_from_slice(head.as_bytes());
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(HEADER_FOLD_WIDTH.min(rest.len()));
        out.extend_from_slice(eol);
        out.push(b' ');
        out.extend_from_slice(chunk.as_bytes());
        rest = tail;
    }
    out.extend_from_slice(eol);
}

/// Adds base64 JSON headers carrying the AI results. Any previously embedded
/// headers are replaced, so embedding twice yields the same bytes.
pub fn embed_ai_headers(
    raw: &[u8],
    classification: Option<&Classification>,
    extraction: Option<&Extraction>,
) -> Result<Vec<u8>, ArchiveError> {
    let (head, body, eol) = split_message(raw);
    let mut out = Vec::with_capacity(raw.len() + 1024);

    let mut skipping = false;
    for line in head.split_inclusive(|b| *b == b'\n') {
        let continuation = matches!(line.first(), Some(b' ' | b'\t'));
        if continuation && skipping {
            continue;
        }
        skipping = ai_header_name(line).is_some();
        if !skipping {
            out.extend_from_slice(line);
        }
    }
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.extend_from_slice(eol);
    }

    if let Some(classification) = classification {
        let json = serde_json::to_vec(classification)?;
        push_header(&mut out, CLASSIFICATION_HEADER, &json, eol);
    }
    if let Some(extraction) = extraction {
        let json = serde_json::to_vec(extraction)?;
        push_header(&mut out, EXTRACTION_HEADER, &json, eol);
    }
    out.extend_from_slice(body);
    Ok(out)
}

/// AI results previously embedded with [`embed_ai_headers`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EmbeddedAi {
    pub classification: Option<Classification>,
    pub extraction: Option<Extraction>,
}

pub fn read_ai_headers(raw: &[u8]) -> Result<EmbeddedAi, ArchiveError> {
    let (head, _, _) = split_message(raw);
    let mut values: Vec<(&'static str, String)> = Vec::new();
    let mut current: Option<usize> = None;

    for line in head.split_inclusive(|b| *b == b'\n') {
        let text = String::from_utf8_lossy(line);
        if matches!(line.first(), Some(b' ' | b'\t')) {
            if let Some(idx) = current {
                values[idx].1.push_str(text.trim());
            }
            continue;
        }
        current = None;
        if let Some(name) = ai_header_name(line) {
            let value = text.split_once(':').map(|(_, v)| v.trim()).unwrap_or_default();
            values.push((name, value.to_string()));
            current = Some(values.len() - 1);
        }
    }

    let mut embedded = EmbeddedAi::default();
    for (header, value) in values {
        let decoded = STANDARD
            .decode(value.as_bytes())
            .map_err(|err| ArchiveError::Decode {
                header,
                message: err.to_string(),
            })?;
        let decode_err = |err: serde_json::Error| ArchiveError::Decode {
            header,
            message: err.to_string(),
        };
        if header == CLASSIFICATION_HEADER {
            embedded.classification = Some(serde_json::from_slice(&decoded).map_err(decode_err)?);
        } else {
            embedded.extraction = Some(serde_json::from_slice(&decoded).map_err(decode_err)?);
        }
    }
    Ok(embedded)
}

/// Where a recorded artifact is now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLocation {
    /// Still at the recorded path.
    Present,
    /// Found under the current download directory with the same filename.
    Moved(PathBuf),
    Missing,
}

/// Writes artifacts into the download directory.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    download_dir: PathBuf,
}

impl ArchiveWriter {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub async fn ensure_dir(&self) -> Result<(), ArchiveError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(io_error(&self.download_dir))
    }

    /// Writes `bytes` to `filename` inside the download directory via a
    /// temporary file and rename, so readers never see a partial artifact.
    /// A name already holding a different artifact gets a `_2`, `_3`, ...
    /// suffix.
    pub async fn write(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, ArchiveError> {
        let path = unclaimed_path(&self.download_dir, filename, bytes, None).await?;
        write_atomic(&path, bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(path)
    }

    /// Rewrites an existing artifact, possibly under a new filename. The
    /// old file is removed once the new one is in place.
    pub async fn replace(
        &self,
        current: &Path,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArchiveError> {
        let dir = current.parent().unwrap_or(self.download_dir.as_path());
        let target = unclaimed_path(dir, filename, bytes, Some(current)).await?;
        write_atomic(&target, bytes).await?;
        if target != current {
            match tokio::fs::remove_file(current).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(current)(err)),
            }
            info!(from = %current.display(), to = %target.display(), "artifact renamed");
        }
        Ok(target)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>, ArchiveError> {
        tokio::fs::read(path).await.map_err(io_error(path))
    }

    /// Looks for a recorded artifact, falling back to the same filename
    /// under the current download directory.
    pub async fn heal_path(&self, recorded: &Path) -> FileLocation {
        if file_exists(recorded).await {
            return FileLocation::Present;
        }
        let Some(name) = recorded.file_name() else {
            return FileLocation::Missing;
        };
        let candidate = self.download_dir.join(name);
        if candidate != recorded && file_exists(&candidate).await {
            FileLocation::Moved(candidate)
        } else {
            FileLocation::Missing
        }
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// `dir/filename`, or the first free `stem_N.ext` when that name is taken by
/// another artifact. Identical content and `own` (the artifact being
/// rewritten) don't count as taken.
async fn unclaimed_path(
    dir: &Path,
    filename: &str,
    bytes: &[u8],
    own: Option<&Path>,
) -> Result<PathBuf, ArchiveError> {
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };
    let mut candidate = dir.join(filename);
    let mut n = 1u32;
    loop {
        if own == Some(candidate.as_path()) {
            return Ok(candidate);
        }
        match tokio::fs::read(&candidate).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(io_error(&candidate)(err)),
            Ok(existing) if existing == bytes => return Ok(candidate),
            Ok(_) => {}
        }
        n += 1;
        let name = match ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        debug!(taken = %candidate.display(), next = %name, "artifact name in use");
        candidate = dir.join(name);
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, bytes).await.map_err(io_error(&tmp))?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error(path)(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ClassificationSource, Entities};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\nSubject: Invoice #42\r\n\r\nPlease pay.\r\n";

    fn classification() -> Classification {
        Classification {
            category: "transactional".into(),
            confidence: 0.9,
            reasoning: "invoice".into(),
            is_important: true,
            tags: vec!["billing".into()],
            source: ClassificationSource::Model,
        }
    }

    #[test]
    fn filename_follows_date_subject_id_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(
            archive_filename(Some("Re: invoice? <urgent>"), Some(at), "18c2f0a1b2c3d4e5"),
            "20240309_1405_Re_ invoice_ _urgent__b2c3d4e5.eml"
        );
        assert_eq!(
            archive_filename(None, None, "abc"),
            "00000000_0000_No_Subject_abc.eml"
        );
    }

    #[test]
    fn sanitize_truncates_and_strips_control_chars() {
        let long = "x".repeat(150);
        assert_eq!(sanitize_subject(Some(&long)).chars().count(), 100);
        assert_eq!(sanitize_subject(Some("a\u{7}b//c")), "ab_c");
        assert_eq!(sanitize_subject(Some("   ")), "No_Subject");
    }

    #[test]
    fn slug_filename_uses_category_and_clean_slug() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
        assert_eq!(
            slug_filename(Some("Your Order #123 Has Shipped!"), Some(at), "AAMkAD=/xyz12345", Some("transactional")),
            "20240102_0304_transactional_your-order-123-has-shipped_xyz12345.eml"
        );
        assert_eq!(slugify("!!!"), "no-subject");
    }

    #[test]
    fn embedding_is_idempotent_and_readable() {
        let once = embed_ai_headers(RAW, Some(&classification()), None).expect("embed");
        let twice = embed_ai_headers(&once, Some(&classification()), None).expect("embed again");
        assert_eq!(once, twice);

        let text = String::from_utf8(once.clone()).expect("utf8");
        assert_eq!(text.matches(CLASSIFICATION_HEADER).count(), 1);
        assert!(text.ends_with("\r\n\r\nPlease pay.\r\n"));
        assert!(text.lines().all(|line| line.len() <= 998));

        let embedded = read_ai_headers(&once).expect("read");
        assert_eq!(embedded.classification, Some(classification()));
        assert!(embedded.extraction.is_none());
    }

    #[test]
    fn re_embedding_replaces_previous_values() {
        let extraction = Extraction {
            summary: "Pay invoice 42".into(),
            entities: Entities {
                organizations: vec!["Acme".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let first = embed_ai_headers(RAW, Some(&classification()), None).expect("embed");
        let mut updated = classification();
        updated.category = "important".into();
        let second = embed_ai_headers(&first, Some(&updated), Some(&extraction)).expect("embed");

        let embedded = read_ai_headers(&second).expect("read");
        assert_eq!(embedded.classification.map(|c| c.category), Some("important".into()));
        assert_eq!(embedded.extraction, Some(extraction));
    }

    #[test]
    fn embedding_handles_headers_without_body() {
        let out = embed_ai_headers(b"Subject: hi", Some(&classification()), None).expect("embed");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("Subject: hi\n"));
        assert!(text.contains(CLASSIFICATION_HEADER));
    }

    #[tokio::test]
    async fn write_is_atomic_and_replace_renames() {
        let dir = TempDir::new().expect("temp dir");
        let writer = ArchiveWriter::new(dir.path().join("downloads"));
        writer.ensure_dir().await.expect("dir");

        let path = writer.write("a.eml", RAW).await.expect("write");
        assert_eq!(writer.read(&path).await.expect("read"), RAW);
        let leftovers: Vec<_> = std::fs::read_dir(writer.download_dir())
            .expect("list")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let renamed = writer.replace(&path, "b.eml", b"new").await.expect("replace");
        assert!(!path.exists());
        assert_eq!(std::fs::read(&renamed).expect("read"), b"new");
    }

    #[tokio::test]
    async fn colliding_names_never_overwrite_another_artifact() {
        const NAME: &str = "20240101_0900_Hello_abcdefgh.eml";
        let dir = TempDir::new().expect("temp dir");
        let writer = ArchiveWriter::new(dir.path());

        let first = writer.write(NAME, b"first").await.expect("first");
        let second = writer.write(NAME, b"second").await.expect("second");
        assert_eq!(second, dir.path().join("20240101_0900_Hello_abcdefgh_2.eml"));
        assert_eq!(std::fs::read(&first).expect("read"), b"first");
        assert_eq!(std::fs::read(&second).expect("read"), b"second");

        let again = writer.write(NAME, b"first").await.expect("rewrite");
        assert_eq!(again, first, "identical content keeps its name");

        let other = writer.write("other.eml", b"third").await.expect("third");
        let renamed = writer.replace(&other, NAME, b"third v2").await.expect("rename");
        assert_eq!(renamed, dir.path().join("20240101_0900_Hello_abcdefgh_3.eml"));
        assert!(!other.exists());
        assert_eq!(std::fs::read(&first).expect("read"), b"first");

        let in_place = writer.replace(&second, NAME, b"second v2").await.expect("in place");
        assert_eq!(in_place, second);
        assert_eq!(std::fs::read(&second).expect("read"), b"second v2");
    }

    #[tokio::test]
    async fn heal_path_finds_moved_artifacts() {
        let old = TempDir::new().expect("old dir");
        let new = TempDir::new().expect("new dir");
        let writer = ArchiveWriter::new(new.path());

        let recorded = old.path().join("m1.eml");
        std::fs::write(&recorded, RAW).expect("write");
        assert_eq!(writer.heal_path(&recorded).await, FileLocation::Present);

        std::fs::rename(&recorded, new.path().join("m1.eml")).expect("move");
        assert_eq!(
            writer.heal_path(&recorded).await,
            FileLocation::Moved(new.path().join("m1.eml"))
        );

        std::fs::remove_file(new.path().join("m1.eml")).expect("remove");
        assert_eq!(writer.heal_path(&recorded).await, FileLocation::Missing);
    }
}
