//! Materializes a downloaded result archive into classified entries.
//!
//! The archive contract is loose: zero-or-one markdown document, zero-or-one
//! structured JSON record, zero-or-more image assets, discovered by file
//! extension. A missing document entry is a soft warning, not an error.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Image extensions recognized as auxiliary assets.
const ASSET_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif"];

/// An auxiliary asset extracted from the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetEntry {
    /// Entry name inside the archive.
    pub name: String,
    /// Where the asset was written.
    pub path: PathBuf,
}

/// Classified contents of a result archive.
///
/// Immutable once produced. Re-running materialization over an unchanged
/// archive overwrites the same outputs with identical content; no content
/// hash is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub data_id: String,
    pub output_dir: PathBuf,
    /// Extracted markdown document, if the archive contained one.
    pub markdown: Option<String>,
    pub markdown_path: Option<PathBuf>,
    /// Parsed structured record, if the archive contained one.
    pub structured: Option<serde_json::Value>,
    pub structured_path: Option<PathBuf>,
    pub assets: Vec<AssetEntry>,
    /// Soft warnings, e.g. a missing document entry.
    pub warnings: Vec<String>,
}

/// Unpack a result archive and classify its entries.
///
/// The first `.md` entry becomes the document, the first `.json` entry the
/// structured record, and image files the assets. Entries that would escape
/// the output directory are skipped.
pub fn materialize(archive_bytes: &[u8], data_id: &str, output_dir: &Path) -> Result<ExtractionResult> {
    std::fs::create_dir_all(output_dir)?;

    let cursor = std::io::Cursor::new(archive_bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| Error::malformed(format!("result archive: {e}")))?;

    let names: Vec<String> = archive.file_names().map(|s| s.to_string()).collect();

    let mut result = ExtractionResult {
        data_id: data_id.to_string(),
        output_dir: output_dir.to_path_buf(),
        markdown: None,
        markdown_path: None,
        structured: None,
        structured_path: None,
        assets: Vec::new(),
        warnings: Vec::new(),
    };

    // First markdown entry is the document.
    if let Some(name) = names.iter().find(|n| n.ends_with(".md")) {
        let text = read_entry_string(&mut archive, name)?;
        let path = output_dir.join(format!("{data_id}.md"));
        std::fs::write(&path, &text)?;
        debug!(entry = %name, "Document entry extracted");
        result.markdown = Some(text);
        result.markdown_path = Some(path);
    } else {
        warn!(data_id = %data_id, "No document entry in result archive");
        result
            .warnings
            .push("no markdown document in result archive".to_string());
    }

    // First JSON entry is the structured record.
    if let Some(name) = names.iter().find(|n| n.ends_with(".json")) {
        let text = read_entry_string(&mut archive, name)?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Error::malformed(format!("structured entry {name}: {e}")))?;
        let path = output_dir.join(format!("{data_id}.json"));
        std::fs::write(&path, &text)?;
        debug!(entry = %name, "Structured entry extracted");
        result.structured = Some(value);
        result.structured_path = Some(path);
    }

    // Image entries are assets, written out under their archive names.
    for name in &names {
        let lower = name.to_ascii_lowercase();
        if !ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            continue;
        }
        if escapes_output_dir(name) {
            warn!(entry = %name, "Skipping archive entry outside the output directory");
            continue;
        }

        let mut file = archive
            .by_name(name)
            .map_err(|e| Error::malformed(format!("archive entry {name}: {e}")))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        drop(file);

        let path = output_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &data)?;
        result.assets.push(AssetEntry {
            name: name.clone(),
            path,
        });
    }

    info!(
        data_id = %data_id,
        has_markdown = result.markdown.is_some(),
        has_structured = result.structured.is_some(),
        assets = result.assets.len(),
        warnings = result.warnings.len(),
        "Archive materialized"
    );
    Ok(result)
}

fn read_entry_string(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<String> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| Error::malformed(format!("archive entry {name}: {e}")))?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

fn escapes_output_dir(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn classifies_document_and_structured_record() {
        let archive = build_archive(&[
            ("paper/full.md", b"# Title\n\nBody"),
            ("paper/layout.json", br#"{"pages": 12}"#),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let result = materialize(&archive, "paper", dir.path()).unwrap();

        assert_eq!(result.markdown.as_deref(), Some("# Title\n\nBody"));
        assert_eq!(result.structured.as_ref().unwrap()["pages"], 12);
        assert!(result.warnings.is_empty());
        assert!(dir.path().join("paper.md").exists());
        assert!(dir.path().join("paper.json").exists());
    }

    #[test]
    fn missing_document_is_a_warning_not_an_error() {
        let archive = build_archive(&[("paper/layout.json", br#"{"pages": 3}"#)]);
        let dir = tempfile::tempdir().unwrap();

        let result = materialize(&archive, "paper", dir.path()).unwrap();

        assert!(result.markdown.is_none());
        assert!(result.structured.is_some());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("no markdown document"));
    }

    #[test]
    fn image_entries_become_assets() {
        let archive = build_archive(&[
            ("paper/full.md", b"text"),
            ("images/fig1.png", b"\x89PNG"),
            ("images/fig2.JPG", b"\xff\xd8"),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let result = materialize(&archive, "paper", dir.path()).unwrap();

        assert_eq!(result.assets.len(), 2);
        assert!(dir.path().join("images/fig1.png").exists());
    }

    #[test]
    fn only_first_document_entry_is_used() {
        let archive = build_archive(&[
            ("a.md", b"first"),
            ("b.md", b"second"),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let result = materialize(&archive, "paper", dir.path()).unwrap();
        assert_eq!(result.markdown.as_deref(), Some("first"));
    }

    #[test]
    fn rerun_over_unchanged_archive_is_idempotent() {
        let archive = build_archive(&[("paper/full.md", b"stable text")]);
        let dir = tempfile::tempdir().unwrap();

        let first = materialize(&archive, "paper", dir.path()).unwrap();
        let second = materialize(&archive, "paper", dir.path()).unwrap();

        assert_eq!(first.markdown, second.markdown);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("paper.md")).unwrap(),
            "stable text"
        );
    }

    #[test]
    fn traversal_entries_are_skipped() {
        let archive = build_archive(&[
            ("paper/full.md", b"text"),
            ("../escape.png", b"nope"),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let result = materialize(&archive, "paper", dir.path()).unwrap();
        assert!(result.assets.is_empty());
    }

    #[test]
    fn invalid_structured_entry_is_malformed() {
        let archive = build_archive(&[("layout.json", b"not json")]);
        let dir = tempfile::tempdir().unwrap();

        let err = materialize(&archive, "paper", dir.path()).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }
}
