use serde::{Deserialize, Serialize};

use crate::error::{EndorseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Pdf,
    Image,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pdf" => Some(FileKind::Pdf),
            "image" => Some(FileKind::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndorsementKind {
    Signature,
    Stamp,
}

impl EndorsementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndorsementKind::Signature => "signature",
            EndorsementKind::Stamp => "stamp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signature" => Some(EndorsementKind::Signature),
            "stamp" => Some(EndorsementKind::Stamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(SubscriptionTier::Free),
            "premium" => Some(SubscriptionTier::Premium),
            "enterprise" => Some(SubscriptionTier::Enterprise),
            _ => None,
        }
    }
}

/// Where and how an overlay image is composited onto a document.
///
/// `x`/`y` locate the overlay's top-left corner measured from the visual
/// top-left of the target: points for PDF pages, pixels for rasters.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementDirective {
    pub image: Vec<u8>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation_degrees: f64,
    pub target_page_index: Option<u32>,
}

impl PlacementDirective {
    /// Builds a directive, folding any rotation into `[0, 360)`.
    pub fn new(image: Vec<u8>, x: f64, y: f64, width: f64, height: f64, rotation_degrees: f64) -> Self {
        let rotation_degrees = if rotation_degrees.is_finite() {
            // rem_euclid can round tiny negatives up to exactly 360.
            let folded = rotation_degrees.rem_euclid(360.0);
            if folded >= 360.0 {
                0.0
            } else {
                folded
            }
        } else {
            rotation_degrees
        };
        Self {
            image,
            x,
            y,
            width,
            height,
            rotation_degrees,
            target_page_index: None,
        }
    }

    pub fn on_page(mut self, page_index: u32) -> Self {
        self.target_page_index = Some(page_index);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let numbers = [self.x, self.y, self.width, self.height, self.rotation_degrees];
        if numbers.iter().any(|n| !n.is_finite()) {
            return Err(EndorseError::InvalidDirective("non_finite_value".into()));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(EndorseError::InvalidDirective(format!(
                "non_positive_size:{}x{}",
                self.width, self.height
            )));
        }
        if !(0.0..360.0).contains(&self.rotation_degrees) {
            return Err(EndorseError::InvalidDirective(format!(
                "rotation_out_of_range:{}",
                self.rotation_degrees
            )));
        }
        if self.image.is_empty() {
            return Err(EndorseError::InvalidDirective("empty_image".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub x: f64,
    pub y: f64,
    pub page_index: Option<u32>,
}

/// One endorsement in the history. Only `remarks` changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct EndorsedDocumentRecord {
    pub id: String,
    pub file_name: String,
    pub file_kind: FileKind,
    pub original_blob: Vec<u8>,
    pub endorsed_blob: Vec<u8>,
    pub endorsed_page_indices: Option<Vec<u32>>,
    pub remarks: String,
    pub created_at_millis: i64,
    pub endorsement_kind: EndorsementKind,
    pub placement: Placement,
}

/// The device's single user profile. Saved wholesale; merge before saving.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserProfileRecord {
    pub email: String,
    pub name: String,
    pub signature_image: Option<Vec<u8>>,
    pub stamp_image: Option<Vec<u8>>,
    pub is_authenticated: bool,
    pub subscription_tier: SubscriptionTier,
}

impl UserProfileRecord {
    pub fn asset_for(&self, kind: EndorsementKind) -> Option<&[u8]> {
        match kind {
            EndorsementKind::Signature => self.signature_image.as_deref(),
            EndorsementKind::Stamp => self.stamp_image.as_deref(),
        }
    }

    /// Carries the stored assets over onto `self`.
    pub fn with_assets_from(mut self, previous: &UserProfileRecord) -> Self {
        if self.signature_image.is_none() {
            self.signature_image = previous.signature_image.clone();
        }
        if self.stamp_image.is_none() {
            self.stamp_image = previous.stamp_image.clone();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_normalizes_negative_rotation() {
        let d = PlacementDirective::new(vec![1], 0.0, 0.0, 10.0, 10.0, -90.0);
        assert_eq!(d.rotation_degrees, 270.0);
        let d = PlacementDirective::new(vec![1], 0.0, 0.0, 10.0, 10.0, 360.0);
        assert_eq!(d.rotation_degrees, 0.0);
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        let base = PlacementDirective::new(vec![1], 0.0, 0.0, 10.0, 10.0, 0.0);
        assert!(base.validate().is_ok());

        let mut zero = base.clone();
        zero.height = 0.0;
        assert!(matches!(zero.validate(), Err(EndorseError::InvalidDirective(_))));

        let mut nan = base.clone();
        nan.x = f64::NAN;
        assert!(nan.validate().is_err());

        let mut spun = base.clone();
        spun.rotation_degrees = 360.0;
        assert!(spun.validate().is_err());

        let mut empty = base;
        empty.image.clear();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn enum_codes_round_trip() {
        for kind in [FileKind::Pdf, FileKind::Image] {
            assert_eq!(FileKind::parse(kind.as_str()), Some(kind));
        }
        for tier in [SubscriptionTier::Free, SubscriptionTier::Premium, SubscriptionTier::Enterprise] {
            assert_eq!(SubscriptionTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(EndorsementKind::parse("stamp"), Some(EndorsementKind::Stamp));
        assert_eq!(EndorsementKind::parse("seal"), None);
    }

    #[test]
    fn with_assets_keeps_previous_images() {
        let previous = UserProfileRecord {
            signature_image: Some(vec![1, 2]),
            stamp_image: Some(vec![3]),
            ..Default::default()
        };
        let next = UserProfileRecord {
            stamp_image: Some(vec![9]),
            ..Default::default()
        }
        .with_assets_from(&previous);
        assert_eq!(next.signature_image, Some(vec![1, 2]));
        assert_eq!(next.stamp_image, Some(vec![9]));
    }
}
