use crate::config::{ConfigOverrides, EndorserConfig};
use crate::error::EndorseError;
use crate::features::auth::{clear_asset, current_profile, login, logout, set_asset};
use crate::features::endorsement::{
    decode_image_source, generate_placeholder_signature, generate_placeholder_stamp,
    pdf_page_count, to_data_url,
};
use crate::features::export::export_document;
use crate::features::history::{endorsed_file_name, list_history, HistoryQuery};
use crate::features::store::{EndorsementStore, SqliteStore};
use crate::features::workflow::{
    endorse_and_store, EndorsementOptions, EndorsementRequest, SystemClock,
};
use crate::model::{EndorsedDocumentRecord, EndorsementKind, UserProfileRecord};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    fs::File,
    io::Read,
    os::unix::io::{FromRawFd, RawFd},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, warn};

/// The process-wide session. Created by `init`, or lazily from the
/// environment by the first other command.
static SESSION: Mutex<Option<Session>> = Mutex::new(None);

struct Session {
    store: SqliteStore,
    config: EndorserConfig,
}

impl Session {
    fn new(config: EndorserConfig) -> Self {
        Self {
            store: SqliteStore::new(&config.database_path),
            config,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Command {
    action: String,
    fd: Option<i32>,
    path: Option<String>,
    file_name: Option<String>,
    mime: Option<String>,
    options: Option<EndorsementOptions>,
    query: Option<HistoryQuery>,
    id: Option<String>,
    remarks: Option<String>,
    email: Option<String>,
    password: Option<String>,
    kind: Option<String>,
    image: Option<String>,
    database_path: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

#[derive(Debug)]
struct Source {
    fd: FdHandle,
    path: Option<String>,
}

#[derive(Debug)]
enum Action {
    Init(ConfigOverrides),
    Endorse {
        source: Source,
        file_name: String,
        mime: Option<String>,
        options: EndorsementOptions,
    },
    PageCount(Source),
    History(HistoryQuery),
    HistoryGet(String),
    HistoryDelete(String),
    HistoryRemarks {
        id: String,
        remarks: String,
    },
    Export {
        id: String,
        output_dir: Option<PathBuf>,
    },
    Login {
        email: String,
        password: String,
    },
    Logout,
    Profile,
    ProfileSetAsset {
        kind: EndorsementKind,
        image: Option<String>,
        source: Source,
    },
    ProfileClearAsset(EndorsementKind),
    Placeholder(EndorsementKind),
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Init(_) => "init",
            Action::Endorse { .. } => "endorse",
            Action::PageCount(_) => "pdf_page_count",
            Action::History(_) => "history",
            Action::HistoryGet(_) => "history_get",
            Action::HistoryDelete(_) => "history_delete",
            Action::HistoryRemarks { .. } => "history_remarks",
            Action::Export { .. } => "export",
            Action::Login { .. } => "login",
            Action::Logout => "logout",
            Action::Profile => "profile",
            Action::ProfileSetAsset { .. } => "profile_set_asset",
            Action::ProfileClearAsset(_) => "profile_clear_asset",
            Action::Placeholder(_) => "placeholder",
        }
    }
}

/// Owns a descriptor handed over by the shell until it is read; closes it on
/// drop otherwise.
#[derive(Debug)]
struct FdHandle(Option<i32>);

impl FdHandle {
    fn new(fd: Option<i32>) -> Self {
        Self(fd)
    }

    fn take(&mut self) -> Option<i32> {
        self.0.take()
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        if let Some(fd) = self.0.take() {
            if fd >= 0 {
                unsafe { File::from_raw_fd(fd as RawFd) };
            }
        }
    }
}

fn parse_action(command: Command) -> Result<Action, String> {
    let Command {
        action,
        fd,
        path,
        file_name,
        mime,
        options,
        query,
        id,
        remarks,
        email,
        password,
        kind,
        image,
        database_path,
        output_dir,
    } = command;

    let source = Source {
        fd: FdHandle::new(fd),
        path,
    };
    let require_id = |id: Option<String>| id.filter(|s| !s.is_empty()).ok_or("missing_id");
    let parse_kind = |kind: Option<String>| -> Result<EndorsementKind, String> {
        let raw = kind.unwrap_or_else(|| "signature".into());
        EndorsementKind::parse(&raw).ok_or_else(|| format!("invalid_kind:{raw}"))
    };

    match action.as_str() {
        "init" => Ok(Action::Init(ConfigOverrides {
            database_path,
            output_dir,
        })),
        "endorse" => {
            if source.fd.0.is_none() && source.path.is_none() {
                return Err("missing_source".into());
            }
            let file_name = file_name
                .or_else(|| {
                    source
                        .path
                        .as_deref()
                        .and_then(|p| Path::new(p).file_name())
                        .and_then(|n| n.to_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "document".into());
            Ok(Action::Endorse {
                source,
                file_name,
                mime,
                options: options.unwrap_or_default(),
            })
        }
        "pdf_page_count" => Ok(Action::PageCount(source)),
        "history" => Ok(Action::History(query.unwrap_or_default())),
        "history_get" => Ok(Action::HistoryGet(require_id(id)?)),
        "history_delete" => Ok(Action::HistoryDelete(require_id(id)?)),
        "history_remarks" => Ok(Action::HistoryRemarks {
            id: require_id(id)?,
            remarks: remarks.unwrap_or_default(),
        }),
        "export" => Ok(Action::Export {
            id: require_id(id)?,
            output_dir,
        }),
        "login" => Ok(Action::Login {
            email: email.unwrap_or_default(),
            password: password.unwrap_or_default(),
        }),
        "logout" => Ok(Action::Logout),
        "profile" => Ok(Action::Profile),
        "profile_set_asset" => Ok(Action::ProfileSetAsset {
            kind: parse_kind(kind)?,
            image,
            source,
        }),
        "profile_clear_asset" => Ok(Action::ProfileClearAsset(parse_kind(kind)?)),
        "placeholder" => Ok(Action::Placeholder(parse_kind(kind)?)),
        other => Err(format!("unknown_action:{other}")),
    }
}

/// Entry point shared by the JNI export and tests: JSON command in, JSON
/// response out. Never fails; errors are reported in the response.
pub fn dispatch(input: &str) -> Value {
    let result = serde_json::from_str::<Command>(input)
        .map_err(|e| format!("invalid_json:{e}"))
        .and_then(handle_command);
    match result {
        Ok(value) => value,
        Err(err) => error_json(&err),
    }
}

fn lock_session() -> MutexGuard<'static, Option<Session>> {
    match SESSION.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("session mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn handle_command(command: Command) -> Result<Value, String> {
    let action = parse_action(command)?;
    let mut guard = lock_session();
    if let Action::Init(overrides) = action {
        let session = Session::new(EndorserConfig::from_env().apply(overrides));
        let initialized = session.store.initialize();
        let response = json!({
            "ok": true,
            "database_path": session.config.database_path,
            "output_dir": session.config.output_dir,
        });
        *guard = Some(session);
        initialized.map_err(|e| e.to_bridge_string())?;
        return Ok(response);
    }
    let session = guard.get_or_insert_with(|| Session::new(EndorserConfig::from_env()));
    run_action(session, action)
}

fn run_action(session: &Session, action: Action) -> Result<Value, String> {
    debug!(action = action.name(), "dispatch");
    let store = &session.store;
    match action {
        // Handled by handle_command, which owns the session slot.
        Action::Init(_) => Err("init_not_routable".into()),
        Action::Endorse {
            source,
            file_name,
            mime,
            options,
        } => {
            let bytes = read_source(source)?;
            let request = EndorsementRequest {
                source: bytes,
                file_name,
                mime,
                options,
            };
            let record = endorse_and_store(store, request, &SystemClock).map_err(bridge)?;
            Ok(json!({ "ok": true, "record": record_summary(&record) }))
        }
        Action::PageCount(source) => {
            let bytes = read_source(source)?;
            let count = pdf_page_count(&bytes).map_err(bridge)?;
            Ok(json!({ "ok": true, "page_count": count }))
        }
        Action::History(query) => {
            let records = list_history(store, &query).map_err(bridge)?;
            let items: Vec<Value> = records.iter().map(record_summary).collect();
            Ok(json!({ "ok": true, "records": items }))
        }
        Action::HistoryGet(id) => {
            let record = store.get(&id).map_err(bridge)?;
            Ok(json!({ "ok": true, "record": record.as_ref().map(record_summary) }))
        }
        Action::HistoryDelete(id) => {
            store.delete_by_id(&id).map_err(bridge)?;
            Ok(json!({ "ok": true }))
        }
        Action::HistoryRemarks { id, remarks } => {
            let updated = store.update_remarks(&id, &remarks).map_err(bridge)?;
            Ok(json!({ "ok": true, "updated": updated }))
        }
        Action::Export { id, output_dir } => {
            let record = store
                .get(&id)
                .map_err(bridge)?
                .ok_or_else(|| format!("not_found:{id}"))?;
            let dir = output_dir.unwrap_or_else(|| session.config.output_dir.clone());
            let path = export_document(&record, &dir).map_err(bridge)?;
            Ok(json!({ "ok": true, "path": path }))
        }
        Action::Login { email, password } => {
            let profile = login(store, &email, &password).map_err(bridge)?;
            Ok(json!({ "ok": true, "profile": profile_json(&profile) }))
        }
        Action::Logout => {
            let profile = logout(store).map_err(bridge)?;
            Ok(json!({ "ok": true, "profile": profile_json(&profile) }))
        }
        Action::Profile => {
            let profile = current_profile(store).map_err(bridge)?;
            Ok(json!({ "ok": true, "profile": profile_json(&profile) }))
        }
        Action::ProfileSetAsset {
            kind,
            image,
            source,
        } => {
            let bytes = match image {
                Some(encoded) => decode_asset(&encoded)?,
                None => read_source(source)?,
            };
            let profile = set_asset(store, kind, bytes).map_err(bridge)?;
            Ok(json!({ "ok": true, "profile": profile_json(&profile) }))
        }
        Action::ProfileClearAsset(kind) => {
            let profile = clear_asset(store, kind).map_err(bridge)?;
            Ok(json!({ "ok": true, "profile": profile_json(&profile) }))
        }
        Action::Placeholder(kind) => {
            let png = match kind {
                EndorsementKind::Signature => generate_placeholder_signature(),
                EndorsementKind::Stamp => generate_placeholder_stamp(),
            }
            .map_err(bridge)?;
            Ok(json!({ "ok": true, "data_url": asset_data_url(&png) }))
        }
    }
}

fn bridge(err: EndorseError) -> String {
    err.to_bridge_string()
}

fn read_source(mut source: Source) -> Result<Vec<u8>, String> {
    if let Some(fd) = source.fd.take() {
        return read_bytes_from_fd(fd);
    }
    match source.path.as_deref() {
        Some(path) => std::fs::read(path).map_err(|e| bridge(e.into())),
        None => Err("missing_source".into()),
    }
}

fn read_bytes_from_fd(fd: RawFd) -> Result<Vec<u8>, String> {
    if fd < 0 {
        return Err("invalid_fd".into());
    }

    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| format!("read_failed:{e}"))?;
    Ok(contents)
}

/// Data URL or bare base64.
fn decode_asset(encoded: &str) -> Result<Vec<u8>, String> {
    let trimmed = encoded.trim();
    if trimmed.starts_with("data:") {
        decode_image_source(trimmed.as_bytes()).map_err(bridge)
    } else {
        B64.decode(trimmed)
            .map_err(|e| bridge(EndorseError::DecodeFailure(format!("base64:{e}"))))
    }
}

fn asset_data_url(bytes: &[u8]) -> String {
    let mime = infer::get(bytes)
        .map(|t| t.mime_type())
        .unwrap_or("image/png");
    to_data_url(bytes, mime)
}

fn record_summary(record: &EndorsedDocumentRecord) -> Value {
    json!({
        "id": record.id,
        "file_name": record.file_name,
        "export_name": endorsed_file_name(record),
        "file_kind": record.file_kind,
        "endorsement_kind": record.endorsement_kind,
        "endorsed_pages": record.endorsed_page_indices,
        "remarks": record.remarks,
        "created_at": record.created_at_millis,
        "placement": record.placement,
        "original_size": record.original_blob.len(),
        "endorsed_size": record.endorsed_blob.len(),
    })
}

fn profile_json(profile: &UserProfileRecord) -> Value {
    json!({
        "email": profile.email,
        "name": profile.name,
        "is_authenticated": profile.is_authenticated,
        "subscription_tier": profile.subscription_tier,
        "signature": profile.signature_image.as_deref().map(asset_data_url),
        "stamp": profile.stamp_image.as_deref().map(asset_data_url),
    })
}

pub(crate) fn error_json(message: &str) -> Value {
    json!({ "ok": false, "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::endorsement::tests::{sample_pdf, solid_png};
    use std::io::Write;

    struct Harness {
        session: Session,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let session = Session {
                store: SqliteStore::in_memory(),
                config: EndorserConfig {
                    database_path: dir.path().join("unused.db"),
                    output_dir: dir.path().join("out"),
                },
            };
            Self { session, dir }
        }

        fn run(&mut self, input: Value) -> Result<Value, String> {
            let command: Command = serde_json::from_value(input).unwrap();
            run_action(&self.session, parse_action(command)?)
        }

        fn write_file(&self, name: &str, bytes: &[u8]) -> String {
            let path = self.dir.path().join(name);
            let mut f = File::create(&path).unwrap();
            f.write_all(bytes).unwrap();
            path.to_str().unwrap().to_string()
        }
    }

    #[test]
    fn endorse_history_remarks_export_delete() {
        let mut h = Harness::new();
        let path = h.write_file("manifest.pdf", &sample_pdf(2, &[]));

        let out = h
            .run(json!({
                "action": "endorse",
                "path": path,
                "options": { "kind": "stamp", "pages": [1] }
            }))
            .unwrap();
        let record = &out["record"];
        assert_eq!(record["file_name"], "manifest.pdf");
        assert_eq!(record["file_kind"], "pdf");
        assert_eq!(record["endorsement_kind"], "stamp");
        assert_eq!(record["endorsed_pages"], json!([1]));
        let id = record["id"].as_str().unwrap().to_string();

        let listed = h.run(json!({ "action": "history" })).unwrap();
        assert_eq!(listed["records"].as_array().unwrap().len(), 1);

        let updated = h
            .run(json!({ "action": "history_remarks", "id": id, "remarks": "cleared" }))
            .unwrap();
        assert_eq!(updated["updated"], true);
        let fetched = h.run(json!({ "action": "history_get", "id": id })).unwrap();
        assert_eq!(fetched["record"]["remarks"], "cleared");

        let exported = h.run(json!({ "action": "export", "id": id })).unwrap();
        let exported_path = PathBuf::from(exported["path"].as_str().unwrap());
        assert_eq!(exported_path, h.dir.path().join("out").join("endorsed_manifest.pdf"));
        assert_eq!(pdf_page_count(&std::fs::read(&exported_path).unwrap()).unwrap(), 2);

        h.run(json!({ "action": "history_delete", "id": id })).unwrap();
        let gone = h.run(json!({ "action": "history_get", "id": id })).unwrap();
        assert!(gone["record"].is_null());
        assert!(h
            .run(json!({ "action": "export", "id": id }))
            .unwrap_err()
            .starts_with("not_found:"));
    }

    #[test]
    fn endorse_reads_from_fd() {
        use std::os::unix::io::IntoRawFd;
        let mut h = Harness::new();
        let path = h.write_file("deck.png", &solid_png(40, 30, [255, 255, 255, 255]));
        let fd = File::open(&path).unwrap().into_raw_fd();
        let out = h
            .run(json!({
                "action": "endorse",
                "fd": fd,
                "file_name": "deck.png",
                "mime": "image/png",
                "options": { "x": 0, "y": 0, "width": 10, "height": 5 }
            }))
            .unwrap();
        assert_eq!(out["record"]["file_kind"], "image");
        assert!(out["record"]["endorsed_pages"].is_null());
    }

    #[test]
    fn bad_credentials_report_code() {
        let mut h = Harness::new();
        let err = h
            .run(json!({ "action": "login", "email": "demo@example.com", "password": "x" }))
            .unwrap_err();
        assert_eq!(err, "invalid_credentials");

        let ok = h
            .run(json!({ "action": "login", "email": "demo@example.com", "password": "demo123" }))
            .unwrap();
        assert_eq!(ok["profile"]["subscription_tier"], "premium");
        let out = h.run(json!({ "action": "logout" })).unwrap();
        assert_eq!(out["profile"]["is_authenticated"], false);
    }

    #[test]
    fn asset_upload_accepts_data_url_and_base64() {
        let mut h = Harness::new();
        let png = solid_png(3, 3, [0, 0, 255, 255]);
        let url = to_data_url(&png, "image/png");
        let out = h
            .run(json!({ "action": "profile_set_asset", "kind": "stamp", "image": url }))
            .unwrap();
        assert_eq!(out["profile"]["stamp"], url.as_str());

        let plain = B64.encode(&png);
        let out = h
            .run(json!({ "action": "profile_set_asset", "kind": "signature", "image": plain }))
            .unwrap();
        assert!(out["profile"]["signature"].as_str().unwrap().starts_with("data:image/png;base64,"));

        let placeholder = h.run(json!({ "action": "placeholder", "kind": "stamp" })).unwrap();
        let placeholder = placeholder["data_url"].as_str().unwrap();
        assert!(placeholder.starts_with("data:image/png;base64,"));
        assert_ne!(placeholder, url);

        let cleared = h
            .run(json!({ "action": "profile_clear_asset", "kind": "stamp" }))
            .unwrap();
        assert!(cleared["profile"]["stamp"].is_null());
    }

    #[test]
    fn parse_errors_are_reported() {
        let mut h = Harness::new();
        assert_eq!(h.run(json!({ "action": "endorse" })).unwrap_err(), "missing_source");
        assert_eq!(h.run(json!({ "action": "history_get" })).unwrap_err(), "missing_id");
        assert_eq!(
            h.run(json!({ "action": "placeholder", "kind": "seal" })).unwrap_err(),
            "invalid_kind:seal"
        );
        assert_eq!(h.run(json!({ "action": "warp" })).unwrap_err(), "unknown_action:warp");
        assert_eq!(
            h.run(json!({ "action": "pdf_page_count", "fd": -1 })).unwrap_err(),
            "invalid_fd"
        );
    }

    #[test]
    fn dispatch_wraps_errors_in_json() {
        let out = dispatch("not json");
        assert_eq!(out["ok"], false);
        assert!(out["error"].as_str().unwrap().starts_with("invalid_json:"));
    }

    #[test]
    fn page_count_from_path() {
        let mut h = Harness::new();
        let path = h.write_file("three.pdf", &sample_pdf(3, &[]));
        let out = h.run(json!({ "action": "pdf_page_count", "path": path })).unwrap();
        assert_eq!(out["page_count"], 3);
    }
}
