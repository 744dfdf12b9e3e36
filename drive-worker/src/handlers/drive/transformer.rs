use chrono::Utc;
use conduit::connections::ConnectionContext;
use conduit::{NormalizedRecord, RecordBuilder, WorkerResult};
use serde_json::{json, Value};

use super::api::{Channel, DriveFile};
use super::config::{FOLDER_MIME_TYPE, PROVIDER};

pub const RESOURCE_FILE: &str = "file";
pub const RESOURCE_FOLDER: &str = "folder";
pub const RESOURCE_CHANNEL: &str = "channel";

/// Bumped when the payload shape changes.
pub const TRANSFORMATION_VERSION: &str = "1.0";

/// How a record was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    FullSync,
    Incremental,
    Webhook,
    Fetch,
}

impl SyncSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncSource::FullSync => "full_sync",
            SyncSource::Incremental => "incremental",
            SyncSource::Webhook => "webhook",
            SyncSource::Fetch => "fetch",
        }
    }
}

pub fn is_folder(file: &DriveFile) -> bool {
    file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
}

/// Coarse content category from a mime type.
pub fn category(mime_type: &str) -> &'static str {
    match mime_type {
        FOLDER_MIME_TYPE => "folder",
        "application/vnd.google-apps.document" => "document",
        "application/vnd.google-apps.spreadsheet" => "spreadsheet",
        "application/vnd.google-apps.presentation" => "presentation",
        "application/pdf" => "pdf",
        m if m.starts_with("image/") => "image",
        m if m.starts_with("video/") => "video",
        m if m.starts_with("audio/") => "audio",
        m if m.starts_with("text/") => "text",
        m if m.starts_with("application/vnd.google-apps.") => "workspace",
        _ => "other",
    }
}

/// Target format for exporting a Google Workspace document, if it has one.
pub fn export_format(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "application/vnd.google-apps.document" => {
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        "application/vnd.google-apps.spreadsheet" => {
            Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
        }
        "application/vnd.google-apps.presentation" => {
            Some("application/vnd.openxmlformats-officedocument.presentationml.presentation")
        }
        "application/vnd.google-apps.drawing" => Some("image/png"),
        "application/vnd.google-apps.script" => Some("application/vnd.google-apps.script+json"),
        _ => None,
    }
}

/// Payload for one file or folder.
pub fn file_payload(file: &DriveFile) -> Value {
    let mime_type = file.mime_type.as_deref().unwrap_or("application/octet-stream");
    let folder = is_folder(file);
    let owners: Vec<Value> = file
        .owners
        .iter()
        .map(|o| json!({"name": o.display_name, "email": o.email_address}))
        .collect();

    json!({
        "id": file.id,
        "type": if folder { RESOURCE_FOLDER } else { RESOURCE_FILE },
        "name": file.name.as_deref().unwrap_or("Unnamed"),
        "mime_type": mime_type,
        "category": category(mime_type),
        "is_folder": folder,
        "is_google_workspace": mime_type.starts_with("application/vnd.google-apps."),
        "size_bytes": file.size.as_deref().and_then(|s| s.parse::<u64>().ok()),
        "web_view_link": file.web_view_link,
        "parent_ids": file.parents,
        "owners": owners,
        "trashed": file.trashed,
        "timestamps": {
            "created_at": file.created_time,
            "modified_at": file.modified_time,
        },
    })
}

/// Record for a file or folder. The key depends only on the connection and
/// the file id, so every sync path produces the same key for the same file.
pub async fn file_record(
    builder: &RecordBuilder,
    ctx: &ConnectionContext,
    file: &DriveFile,
    source: SyncSource,
) -> WorkerResult<NormalizedRecord> {
    let resource_type = if is_folder(file) { RESOURCE_FOLDER } else { RESOURCE_FILE };
    let record = builder
        .build(&ctx.customer_id, &ctx.connection_id, resource_type, &file.id, file_payload(file))
        .await?;
    Ok(record
        .with_metadata("sync_source", source.as_str())
        .with_metadata("transformation_version", TRANSFORMATION_VERSION)
        .with_metadata("transformed_at", Utc::now().to_rfc3339()))
}

/// Record describing a newly opened push channel.
pub async fn channel_record(
    builder: &RecordBuilder,
    ctx: &ConnectionContext,
    channel: &Channel,
    page_token: &str,
    webhook_url: &str,
) -> WorkerResult<NormalizedRecord> {
    let payload = json!({
        "channel_id": channel.id,
        "resource_id": channel.resource_id,
        "expiration": channel.expiration,
        "page_token": page_token,
        "webhook_url": webhook_url,
        "provider": PROVIDER,
    });
    builder
        .build(&ctx.customer_id, &ctx.connection_id, RESOURCE_CHANNEL, &channel.id, payload)
        .await
}
