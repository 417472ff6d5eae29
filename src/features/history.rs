use image::ImageFormat;
use serde::Deserialize;

use crate::error::Result;
use crate::features::store::EndorsementStore;
use crate::model::{EndorsedDocumentRecord, FileKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    CreatedAt,
    FileName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter and ordering for the history list. The default is every record,
/// newest first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryQuery {
    pub search_term: String,
    pub file_kind: Option<FileKind>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl HistoryQuery {
    fn matches(&self, record: &EndorsedDocumentRecord) -> bool {
        if let Some(kind) = self.file_kind {
            if record.file_kind != kind {
                return false;
            }
        }
        let needle = self.search_term.trim().to_lowercase();
        needle.is_empty()
            || record.file_name.to_lowercase().contains(&needle)
            || record.remarks.to_lowercase().contains(&needle)
    }

    pub fn apply(&self, records: Vec<EndorsedDocumentRecord>) -> Vec<EndorsedDocumentRecord> {
        let mut out: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();
        out.sort_by(|a, b| {
            let ord = match self.sort_by {
                SortBy::CreatedAt => a.created_at_millis.cmp(&b.created_at_millis),
                SortBy::FileName => a
                    .file_name
                    .to_lowercase()
                    .cmp(&b.file_name.to_lowercase()),
            }
            // Stable tiebreak so equal keys list in a fixed order.
            .then_with(|| a.id.cmp(&b.id));
            match self.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
        out
    }
}

pub fn list_history<S: EndorsementStore + ?Sized>(
    store: &S,
    query: &HistoryQuery,
) -> Result<Vec<EndorsedDocumentRecord>> {
    Ok(query.apply(store.list_all()?))
}

/// Name used when the endorsed blob leaves the app. For images the extension
/// follows the format of the endorsed bytes, not the source's.
pub fn endorsed_file_name(record: &EndorsedDocumentRecord) -> String {
    let name = match record.file_kind {
        FileKind::Pdf => record.file_name.clone(),
        FileKind::Image => match image::guess_format(&record.endorsed_blob) {
            Ok(format) => with_extension_of(&record.file_name, format),
            Err(_) => record.file_name.clone(),
        },
    };
    format!("endorsed_{name}")
}

fn with_extension_of(file_name: &str, format: ImageFormat) -> String {
    let known = format.extensions_str();
    let Some(&preferred) = known.first() else {
        return file_name.to_string();
    };
    // Only the last path component carries an extension.
    let base_start = file_name.rfind(['/', '\\']).map_or(0, |i| i + 1);
    match file_name[base_start..].rfind('.') {
        Some(dot) => {
            let dot = base_start + dot;
            let ext = file_name[dot + 1..].to_ascii_lowercase();
            if known.contains(&ext.as_str()) {
                file_name.to_string()
            } else {
                format!("{}.{preferred}", &file_name[..dot])
            }
        }
        None => format!("{file_name}.{preferred}"),
    }
}
