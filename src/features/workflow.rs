// Select file, endorse, persist: the whole endorsement flow as one call.

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EndorseError, Result};
use crate::features::auth::current_profile;
use crate::features::endorsement::{
    endorse_image, endorse_pdf_pages, generate_placeholder_signature, generate_placeholder_stamp,
};
use crate::features::store::EndorsementStore;
use crate::model::{
    EndorsedDocumentRecord, EndorsementKind, FileKind, Placement, PlacementDirective,
};

pub const DEFAULT_WIDTH: f64 = 150.0;
pub const DEFAULT_HEIGHT: f64 = 75.0;
pub const DEFAULT_POSITION: f64 = 100.0;

pub trait Clock {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Placement and bookkeeping for one endorsement. The source bytes travel
/// separately.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndorsementOptions {
    pub kind: EndorsementKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation_degrees: f64,
    pub pages: Vec<u32>,
    pub remarks: String,
}

impl Default for EndorsementOptions {
    fn default() -> Self {
        Self {
            kind: EndorsementKind::Signature,
            x: DEFAULT_POSITION,
            y: DEFAULT_POSITION,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            rotation_degrees: 0.0,
            pages: vec![0],
            remarks: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndorsementRequest {
    pub source: Vec<u8>,
    pub file_name: String,
    pub mime: Option<String>,
    pub options: EndorsementOptions,
}

/// Declared MIME wins; otherwise the magic bytes decide.
pub fn detect_file_kind(source: &[u8], declared_mime: Option<&str>) -> Result<FileKind> {
    let from_mime = |mime: &str| -> Option<FileKind> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime == "application/pdf" {
            Some(FileKind::Pdf)
        } else if mime.starts_with("image/") {
            Some(FileKind::Image)
        } else {
            None
        }
    };
    if let Some(kind) = declared_mime.and_then(from_mime) {
        return Ok(kind);
    }
    let sniffed = infer::get(source).map(|t| t.mime_type());
    sniffed.and_then(from_mime).ok_or_else(|| {
        EndorseError::UnsupportedFile(
            declared_mime
                .or(sniffed)
                .unwrap_or("unknown")
                .to_string(),
        )
    })
}

/// The profile's own asset for `kind`, or the matching placeholder.
pub fn overlay_for<S: EndorsementStore + ?Sized>(
    store: &S,
    kind: EndorsementKind,
) -> Result<Vec<u8>> {
    if let Some(asset) = current_profile(store)?.asset_for(kind) {
        return Ok(asset.to_vec());
    }
    match kind {
        EndorsementKind::Signature => generate_placeholder_signature(),
        EndorsementKind::Stamp => generate_placeholder_stamp(),
    }
}

/// Endorses the request's source and saves the result as a new history record.
/// Nothing is written when compositing fails.
pub fn endorse_and_store<S: EndorsementStore + ?Sized>(
    store: &S,
    request: EndorsementRequest,
    clock: &dyn Clock,
) -> Result<EndorsedDocumentRecord> {
    let EndorsementRequest {
        source,
        file_name,
        mime,
        options,
    } = request;
    let file_kind = detect_file_kind(&source, mime.as_deref())?;
    let overlay = overlay_for(store, options.kind)?;
    let directive = PlacementDirective::new(
        overlay,
        options.x,
        options.y,
        options.width,
        options.height,
        options.rotation_degrees,
    );

    let (endorsed_blob, endorsed_page_indices) = match file_kind {
        FileKind::Pdf => {
            let out = endorse_pdf_pages(&source, &directive, Some(&options.pages))?;
            if out.endorsed_pages.is_empty() {
                warn!(file_name = %file_name, "no requested page exists, document unchanged");
            }
            (out.bytes, Some(out.endorsed_pages))
        }
        FileKind::Image => (endorse_image(&source, &directive)?.bytes, None),
    };

    let page_index = endorsed_page_indices
        .as_ref()
        .and_then(|pages| pages.first().copied());
    let record = EndorsedDocumentRecord {
        id: Uuid::new_v4().to_string(),
        file_name,
        file_kind,
        original_blob: source,
        endorsed_blob,
        endorsed_page_indices,
        remarks: options.remarks,
        created_at_millis: clock.now_millis(),
        endorsement_kind: options.kind,
        placement: Placement {
            x: options.x,
            y: options.y,
            page_index,
        },
    };
    store.put(&record)?;
    info!(
        id = %record.id,
        kind = record.file_kind.as_str(),
        endorsement = record.endorsement_kind.as_str(),
        "document endorsed"
    );
    Ok(record)
}
