pub mod config;
pub mod error;
pub mod features;
pub mod model;
mod router;

pub use config::EndorserConfig;
pub use error::{EndorseError, Result};
pub use features::endorsement::{
    decode_image_source, endorse_image, endorse_pdf, endorse_pdf_pages,
    generate_placeholder_signature, generate_placeholder_stamp, pdf_page_count, to_data_url,
    EncodedImage, PdfEndorsement,
};
pub use features::store::{EndorsementStore, SqliteStore, StorePhase};
pub use features::workflow::{endorse_and_store, EndorsementOptions, EndorsementRequest};
pub use model::{
    EndorsedDocumentRecord, EndorsementKind, FileKind, Placement, PlacementDirective,
    SubscriptionTier, UserProfileRecord,
};
pub use router::dispatch;

use jni::objects::{JClass, JString};
use jni::sys::jstring;
use jni::JNIEnv;
use std::ptr;

#[no_mangle]
pub extern "system" fn Java_maritime_endorser_MainActivity_dispatch(
    mut env: JNIEnv,
    _class: JClass,
    input: JString,
) -> jstring {
    let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let input_str: String = env
            .get_string(&input)
            .map(|s| s.into())
            .unwrap_or_else(|_| "{}".to_string());
        router::dispatch(&input_str)
    }));

    let json_value = match response {
        Ok(value) => value,
        Err(_) => router::error_json("panic"),
    };

    let output_string = json_value.to_string();
    match env.new_string(output_string) {
        Ok(java_str) => java_str.into_raw(),
        Err(_) => {
            let fallback = router::error_json("jni_new_string_failed").to_string();
            env.new_string(fallback)
                .map(|s| s.into_raw())
                .unwrap_or(ptr::null_mut())
        }
    }
}
