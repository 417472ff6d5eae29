// Offline auth stub: a demo account and a demo login, no network.

use tracing::info;

use crate::error::{EndorseError, Result};
use crate::features::store::EndorsementStore;
use crate::model::{EndorsementKind, SubscriptionTier, UserProfileRecord};

const DEMO_LOGIN_EMAIL: &str = "demo@example.com";
const DEMO_LOGIN_PASSWORD: &str = "demo123";

pub fn demo_profile() -> UserProfileRecord {
    UserProfileRecord {
        email: "demo@maritime-endorser.com".into(),
        name: "Demo User".into(),
        signature_image: None,
        stamp_image: None,
        is_authenticated: false,
        subscription_tier: SubscriptionTier::Free,
    }
}

/// Stored profile, or the demo profile when nothing was saved yet.
pub fn current_profile<S: EndorsementStore + ?Sized>(store: &S) -> Result<UserProfileRecord> {
    Ok(store.get_user_profile()?.unwrap_or_else(demo_profile))
}

/// Accepts only the demo credentials. Assets already stored on the device are
/// kept on the new profile.
pub fn login<S: EndorsementStore + ?Sized>(
    store: &S,
    email: &str,
    password: &str,
) -> Result<UserProfileRecord> {
    if email.trim() != DEMO_LOGIN_EMAIL || password != DEMO_LOGIN_PASSWORD {
        return Err(EndorseError::InvalidCredentials);
    }
    let previous = current_profile(store)?;
    let profile = UserProfileRecord {
        email: DEMO_LOGIN_EMAIL.into(),
        name: "Maritime Professional".into(),
        signature_image: None,
        stamp_image: None,
        is_authenticated: true,
        subscription_tier: SubscriptionTier::Premium,
    }
    .with_assets_from(&previous);
    store.put_user_profile(&profile)?;
    info!(tier = profile.subscription_tier.as_str(), "user logged in");
    Ok(profile)
}

pub fn logout<S: EndorsementStore + ?Sized>(store: &S) -> Result<UserProfileRecord> {
    let previous = current_profile(store)?;
    let profile = demo_profile().with_assets_from(&previous);
    store.put_user_profile(&profile)?;
    info!("user logged out");
    Ok(profile)
}

/// Replaces the signature or stamp image on the current profile. The image
/// must decode; it is stored as given.
pub fn set_asset<S: EndorsementStore + ?Sized>(
    store: &S,
    kind: EndorsementKind,
    image: Vec<u8>,
) -> Result<UserProfileRecord> {
    image::load_from_memory(&image)
        .map_err(|e| EndorseError::DecodeFailure(format!("asset:{e}")))?;
    let mut profile = current_profile(store)?;
    match kind {
        EndorsementKind::Signature => profile.signature_image = Some(image),
        EndorsementKind::Stamp => profile.stamp_image = Some(image),
    }
    store.put_user_profile(&profile)?;
    Ok(profile)
}

pub fn set_signature_asset<S: EndorsementStore + ?Sized>(
    store: &S,
    image: Vec<u8>,
) -> Result<UserProfileRecord> {
    set_asset(store, EndorsementKind::Signature, image)
}

pub fn set_stamp_asset<S: EndorsementStore + ?Sized>(
    store: &S,
    image: Vec<u8>,
) -> Result<UserProfileRecord> {
    set_asset(store, EndorsementKind::Stamp, image)
}

pub fn clear_asset<S: EndorsementStore + ?Sized>(
    store: &S,
    kind: EndorsementKind,
) -> Result<UserProfileRecord> {
    let mut profile = current_profile(store)?;
    match kind {
        EndorsementKind::Signature => profile.signature_image = None,
        EndorsementKind::Stamp => profile.stamp_image = None,
    }
    store.put_user_profile(&profile)?;
    Ok(profile)
}
