use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{EndorseError, Result};
use crate::features::history::endorsed_file_name;
use crate::model::EndorsedDocumentRecord;

const MAX_SUFFIX: u32 = 999;

/// Writes the endorsed blob into `dir` under its [`endorsed_file_name`]. An existing
/// file is never overwritten; `_1`, `_2`, ... is inserted before the extension.
pub fn export_document(record: &EndorsedDocumentRecord, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let name = sanitize(&endorsed_file_name(record));
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.clone(), String::new()),
    };

    for n in 0..=MAX_SUFFIX {
        let candidate = if n == 0 {
            dir.join(&name)
        } else {
            dir.join(format!("{stem}_{n}{ext}"))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut file) => {
                file.write_all(&record.endorsed_blob)?;
                file.sync_all()?;
                info!(id = %record.id, path = %candidate.display(), "document exported");
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(EndorseError::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {name}"),
    )))
}

/// Replaces path separators and characters that are unsafe in shared-storage
/// file names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::store::tests::record;

    #[test]
    fn writes_prefixed_name_and_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let rec = EndorsedDocumentRecord {
            file_name: "crew.pdf".into(),
            endorsed_blob: b"%PDF-endorsed".to_vec(),
            ..record("r1", 1)
        };

        let first = export_document(&rec, dir.path()).unwrap();
        assert_eq!(first, dir.path().join("endorsed_crew.pdf"));
        assert_eq!(std::fs::read(&first).unwrap(), b"%PDF-endorsed");

        let second = export_document(&rec, dir.path()).unwrap();
        assert_eq!(second, dir.path().join("endorsed_crew_1.pdf"));
        let third = export_document(&rec, dir.path()).unwrap();
        assert_eq!(third, dir.path().join("endorsed_crew_2.pdf"));
    }

    #[test]
    fn flattens_directories_in_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let rec = EndorsedDocumentRecord {
            file_name: "../../etc/passwd".into(),
            ..record("r2", 1)
        };
        let path = export_document(&rec, dir.path()).unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(path.file_name().unwrap(), "endorsed_.._.._etc_passwd");
    }

    #[test]
    fn creates_missing_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("exports").join("today");
        let path = export_document(&record("r3", 1), &nested).unwrap();
        assert!(path.starts_with(&nested));
    }
}
