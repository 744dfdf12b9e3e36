//! On-demand reads of Drive resources.
//!
//! A fetch reads exactly one page and emits one record per item. The worker
//! keeps no cursor: the caller passes `pagination.page_token` in and reads
//! `metadata.pagination.next_page_token` back from the records. A page with
//! no items still emits one `empty_batch_<type>` record so the caller always
//! learns where the listing ended.

use async_trait::async_trait;
use conduit::connections::ConnectionContext;
use conduit::{NormalizedRecord, RecordBuilder, WorkerError, WorkerResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::api::{DriveClient, DriveFile, FileQuery};
use super::auth::AccessToken;
use super::config::FOLDER_MIME_TYPE;
use super::method_routes;
use super::transformer::{export_format, file_payload, file_record, is_folder, SyncSource};
use crate::handler::{Handler, RecordSink, Route};
use crate::message::MessageBody;

pub const METHOD: &str = "integration.content.fetch";

pub const DEFAULT_MAX_RESULTS: u32 = 100;
pub const MAX_RESULTS: u32 = 1000;

const WORKSPACE_PREFIX: &str = "application/vnd.google-apps.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Files,
    File,
    Folders,
    Folder,
    Permissions,
    Permission,
    Revisions,
    Revision,
    Changes,
    About,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Files,
        ResourceKind::File,
        ResourceKind::Folders,
        ResourceKind::Folder,
        ResourceKind::Permissions,
        ResourceKind::Permission,
        ResourceKind::Revisions,
        ResourceKind::Revision,
        ResourceKind::Changes,
        ResourceKind::About,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Files => "files",
            ResourceKind::File => "file",
            ResourceKind::Folders => "folders",
            ResourceKind::Folder => "folder",
            ResourceKind::Permissions => "permissions",
            ResourceKind::Permission => "permission",
            ResourceKind::Revisions => "revisions",
            ResourceKind::Revision => "revision",
            ResourceKind::Changes => "changes",
            ResourceKind::About => "about",
        }
    }

    pub fn parse(name: &str) -> WorkerResult<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name).ok_or_else(|| {
            WorkerError::validation_field(format!("unsupported resource type '{}'", name), "resource_type")
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Filters {
    id: Option<String>,
    file_id: Option<String>,
    query: Option<String>,
    /// Include trashed items.
    trashed: bool,
    start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Pagination {
    max_results: i64,
    page_token: Option<String>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS as i64,
            page_token: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Options {
    format: Option<String>,
    include_content: bool,
    include_raw: bool,
}

/// A parsed fetch message.
#[derive(Debug)]
struct FetchRequest {
    kind: ResourceKind,
    filters: Filters,
    page_token: Option<String>,
    max_results: u32,
    options: Options,
}

impl FetchRequest {
    fn parse(body: &MessageBody) -> WorkerResult<Self> {
        let kind = match body.field("resource_type") {
            None | Some(Value::Null) => ResourceKind::Files,
            Some(Value::String(name)) => ResourceKind::parse(name)?,
            Some(_) => {
                return Err(WorkerError::validation_field(
                    "resource_type must be a string",
                    "resource_type",
                ))
            }
        };
        let pagination: Pagination = section(body, "pagination")?;
        let options: Options = if body.field("options").is_some() {
            section(body, "options")?
        } else {
            section(body, "fetch_options")?
        };
        if let Some(format) = options.format.as_deref() {
            if !matches!(format, "metadata" | "full" | "minimal") {
                return Err(WorkerError::validation_field(
                    format!("unknown format '{}'", format),
                    "options.format",
                ));
            }
        }

        Ok(Self {
            kind,
            filters: section(body, "filters")?,
            page_token: pagination.page_token.filter(|t| !t.is_empty()),
            max_results: pagination.max_results.clamp(1, MAX_RESULTS as i64) as u32,
            options,
        })
    }

    fn wants_content(&self) -> bool {
        self.options.include_content || self.options.format.as_deref() == Some("full")
    }

    /// Id of the addressed resource for single-item kinds.
    fn id(&self) -> WorkerResult<&str> {
        self.filters
            .id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                WorkerError::validation_field(
                    format!("filters.id is required for '{}'", self.kind.as_str()),
                    "filters.id",
                )
            })
    }

    /// File a permission or revision listing belongs to. Lists also accept
    /// the file as `filters.id`.
    fn file_id(&self, allow_id: bool) -> WorkerResult<&str> {
        let file_id = self.filters.file_id.as_deref().filter(|s| !s.is_empty());
        let file_id = if allow_id {
            file_id.or(self.filters.id.as_deref().filter(|s| !s.is_empty()))
        } else {
            file_id
        };
        file_id.ok_or_else(|| {
            WorkerError::validation_field(
                format!("filters.file_id is required for '{}'", self.kind.as_str()),
                "filters.file_id",
            )
        })
    }
}

fn section<T: DeserializeOwned + Default>(body: &MessageBody, name: &str) -> WorkerResult<T> {
    match body.field(name) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| WorkerError::validation_field(format!("invalid {}: {}", name, e), name)),
    }
}

/// One page of built records and its continuation.
struct Page {
    records: Vec<NormalizedRecord>,
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
}

impl Page {
    fn single(record: NormalizedRecord) -> Self {
        Self {
            records: vec![record],
            next_page_token: None,
            new_start_page_token: None,
        }
    }
}

/// Generic read of files, folders, permissions, revisions, changes or
/// account information.
pub struct FetchHandler {
    client: Arc<DriveClient>,
    builder: RecordBuilder,
    max_content_bytes: u64,
}

impl FetchHandler {
    pub fn new(client: Arc<DriveClient>, builder: RecordBuilder, max_content_bytes: u64) -> Self {
        Self {
            client,
            builder,
            max_content_bytes,
        }
    }

    async fn fetch(&self, request: &FetchRequest, token: &AccessToken, ctx: &ConnectionContext) -> WorkerResult<Page> {
        match request.kind {
            ResourceKind::Files => self.list_files(request, token, ctx, false).await,
            ResourceKind::Folders => self.list_files(request, token, ctx, true).await,
            ResourceKind::File | ResourceKind::Folder => self.get_file(request, token, ctx).await,
            ResourceKind::Permissions => {
                let file_id = request.file_id(true)?;
                let listing = self
                    .client
                    .list_permissions(token, file_id, request.page_token.as_deref(), request.max_results)
                    .await?;
                let mut records = Vec::with_capacity(listing.permissions.len());
                for permission in listing.permissions {
                    records.push(self.child_record(ctx, "permission", file_id, permission).await?);
                }
                Ok(Page {
                    records,
                    next_page_token: listing.next_page_token,
                    new_start_page_token: None,
                })
            }
            ResourceKind::Permission => {
                let (file_id, id) = (request.file_id(false)?, request.id()?);
                let permission = self.client.get_permission(token, file_id, id).await?;
                Ok(Page::single(self.child_record(ctx, "permission", file_id, permission).await?))
            }
            ResourceKind::Revisions => {
                let file_id = request.file_id(true)?;
                let listing = self
                    .client
                    .list_revisions(token, file_id, request.page_token.as_deref(), request.max_results)
                    .await?;
                let mut records = Vec::with_capacity(listing.revisions.len());
                for revision in listing.revisions {
                    records.push(self.child_record(ctx, "revision", file_id, revision).await?);
                }
                Ok(Page {
                    records,
                    next_page_token: listing.next_page_token,
                    new_start_page_token: None,
                })
            }
            ResourceKind::Revision => {
                let (file_id, id) = (request.file_id(false)?, request.id()?);
                let revision = self.client.get_revision(token, file_id, id).await?;
                Ok(Page::single(self.child_record(ctx, "revision", file_id, revision).await?))
            }
            ResourceKind::Changes => self.changes(request, token, ctx).await,
            ResourceKind::About => {
                let about = self.client.about(token).await?;
                let user = about.get("user");
                let id = user
                    .and_then(|u| u.get("permissionId").or_else(|| u.get("emailAddress")))
                    .and_then(Value::as_str)
                    .unwrap_or("about")
                    .to_string();
                let record = self
                    .builder
                    .build(&ctx.customer_id, &ctx.connection_id, "about", &id, about)
                    .await?;
                Ok(Page::single(with_source(record)))
            }
        }
    }

    async fn list_files(
        &self,
        request: &FetchRequest,
        token: &AccessToken,
        ctx: &ConnectionContext,
        folders: bool,
    ) -> WorkerResult<Page> {
        let mut clauses = vec![if folders {
            format!("mimeType = '{}'", FOLDER_MIME_TYPE)
        } else {
            format!("mimeType != '{}'", FOLDER_MIME_TYPE)
        }];
        if !request.filters.trashed {
            clauses.push("trashed = false".to_string());
        }
        if let Some(query) = request.filters.query.as_deref().filter(|q| !q.trim().is_empty()) {
            clauses.push(format!("({})", query));
        }

        let listing = self
            .client
            .search_files(
                token,
                &FileQuery {
                    q: clauses.join(" and "),
                    page_token: request.page_token.as_deref(),
                    page_size: request.max_results,
                    include_shared_drives: ctx.setting_bool("include_shared_drives", true),
                },
            )
            .await?;

        let mut records = Vec::with_capacity(listing.files.len());
        for file in &listing.files {
            records.push(self.build_file_record(request, ctx, file).await?);
        }
        Ok(Page {
            records,
            next_page_token: listing.next_page_token,
            new_start_page_token: None,
        })
    }

    async fn get_file(&self, request: &FetchRequest, token: &AccessToken, ctx: &ConnectionContext) -> WorkerResult<Page> {
        let file = self.client.get_file(token, request.id()?).await?;
        if request.kind == ResourceKind::Folder && !is_folder(&file) {
            return Err(WorkerError::validation_field(
                format!("'{}' is not a folder", file.id),
                "filters.id",
            ));
        }

        let mut record = self.build_file_record(request, ctx, &file).await?;
        if request.wants_content() && !is_folder(&file) {
            record = self.with_content(token, record, &file).await?;
        }
        Ok(Page::single(record))
    }

    async fn changes(&self, request: &FetchRequest, token: &AccessToken, ctx: &ConnectionContext) -> WorkerResult<Page> {
        let page_token = match request
            .page_token
            .clone()
            .or_else(|| request.filters.start_page_token.clone().filter(|t| !t.is_empty()))
        {
            Some(t) => t,
            None => self.client.get_start_page_token(token).await?,
        };
        let changes = self
            .client
            .changes_page(
                token,
                &page_token,
                request.max_results,
                ctx.setting_bool("include_shared_drives", true),
            )
            .await?;

        let mut records = Vec::with_capacity(changes.changes.len());
        for change in &changes.changes {
            let Some(file_id) = change.file_id.as_deref().or(change.file.as_ref().map(|f| f.id.as_str())) else {
                continue;
            };
            let payload = json!({
                "file_id": file_id,
                "removed": change.removed,
                "change_type": change.change_type,
                "file": change.file.as_ref().map(file_payload),
            });
            let record = self
                .builder
                .build(&ctx.customer_id, &ctx.connection_id, "change", file_id, payload)
                .await?;
            records.push(with_source(record));
        }
        Ok(Page {
            records,
            next_page_token: changes.next_page_token,
            new_start_page_token: changes.new_start_page_token,
        })
    }

    async fn build_file_record(&self, request: &FetchRequest, ctx: &ConnectionContext, file: &DriveFile) -> WorkerResult<NormalizedRecord> {
        let record = file_record(&self.builder, ctx, file, SyncSource::Fetch).await?;
        if !request.options.include_raw {
            return Ok(record);
        }
        let raw = serde_json::to_value(file).map_err(|e| WorkerError::Malformed(format!("file metadata: {}", e)))?;
        Ok(record.with_metadata("raw", raw))
    }

    /// Permission or revision record. Ids are only unique within a file,
    /// so the record id is `<file_id>:<id>`.
    async fn child_record(
        &self,
        ctx: &ConnectionContext,
        resource_type: &str,
        file_id: &str,
        mut item: Value,
    ) -> WorkerResult<NormalizedRecord> {
        let id = item.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        if let Value::Object(map) = &mut item {
            map.insert("file_id".to_string(), Value::String(file_id.to_string()));
        }
        let record = self
            .builder
            .build(
                &ctx.customer_id,
                &ctx.connection_id,
                resource_type,
                &format!("{}:{}", file_id, id),
                item,
            )
            .await?;
        Ok(with_source(record))
    }

    /// Download, or export for Workspace documents, and attach the content.
    async fn with_content(&self, token: &AccessToken, record: NormalizedRecord, file: &DriveFile) -> WorkerResult<NormalizedRecord> {
        let declared = file.size.as_deref().and_then(|s| s.parse::<u64>().ok());
        if declared.is_some_and(|size| size > self.max_content_bytes) {
            return Ok(omitted(record, "too_large"));
        }

        let mime_type = file.mime_type.as_deref().unwrap_or("application/octet-stream");
        let (content, content_type) = if mime_type.starts_with(WORKSPACE_PREFIX) {
            let Some(target) = export_format(mime_type) else {
                debug!(file_id = %file.id, mime_type = %mime_type, "No export format, content omitted");
                return Ok(omitted(record, "not_exportable"));
            };
            (self.client.export_file(token, &file.id, target).await?, target)
        } else {
            (self.client.download_file(token, &file.id).await?, mime_type)
        };

        if content.len() as u64 > self.max_content_bytes {
            return Ok(omitted(record, "too_large"));
        }
        self.builder.attach_content(record, content, content_type).await
    }

    async fn emit_page(
        &self,
        kind: ResourceKind,
        ctx: &ConnectionContext,
        page: Page,
        sink: &dyn RecordSink,
    ) -> WorkerResult<usize> {
        let batch_id = Uuid::now_v7().to_string();
        let has_more = page.next_page_token.is_some();
        let mut pagination = Map::new();
        pagination.insert("next_page_token".to_string(), json!(page.next_page_token));
        pagination.insert("has_more".to_string(), Value::Bool(has_more));
        if let Some(cursor) = &page.new_start_page_token {
            pagination.insert("new_start_page_token".to_string(), Value::String(cursor.clone()));
        }
        let stamp = |record: NormalizedRecord, sequence: usize, is_last: bool| {
            record
                .with_metadata("pagination", Value::Object(pagination.clone()))
                .with_metadata("batch_id", batch_id.as_str())
                .with_metadata("batch_sequence", sequence)
                .with_metadata("batch_is_last", is_last)
        };

        if page.records.is_empty() {
            let record = self
                .builder
                .build(
                    &ctx.customer_id,
                    &ctx.connection_id,
                    &format!("empty_batch_{}", kind.as_str()),
                    &batch_id,
                    json!({"empty": true, "resource_type": kind.as_str()}),
                )
                .await?
                .with_metadata("empty_batch", true)
                .with_metadata("original_resource_type", kind.as_str());
            sink.emit(stamp(with_source(record), 0, !has_more)).await?;
            return Ok(0);
        }

        let total = page.records.len();
        for (sequence, record) in page.records.into_iter().enumerate() {
            let is_last = sequence + 1 == total && !has_more;
            sink.emit(stamp(record, sequence, is_last)).await?;
        }
        Ok(total)
    }
}

fn with_source(record: NormalizedRecord) -> NormalizedRecord {
    record.with_metadata("sync_source", SyncSource::Fetch.as_str())
}

fn omitted(record: NormalizedRecord, reason: &str) -> NormalizedRecord {
    record
        .with_metadata("content_omitted", true)
        .with_metadata("content_omitted_reason", reason)
}

#[async_trait]
impl Handler for FetchHandler {
    fn name(&self) -> &str {
        "drive.fetch"
    }

    fn routes(&self) -> Vec<Route> {
        let mut routes = method_routes(METHOD);
        routes.push(Route::action("fetch", None));
        routes
    }

    async fn handle(&self, body: &MessageBody, ctx: &ConnectionContext, sink: &dyn RecordSink) -> WorkerResult<()> {
        let request = FetchRequest::parse(body)?;
        let token = AccessToken::for_connection(ctx);
        let page = self.fetch(&request, &token, ctx).await?;
        let has_more = page.next_page_token.is_some();
        let emitted = self.emit_page(request.kind, ctx, page, sink).await?;

        info!(
            connection_id = %ctx.connection_id,
            resource_type = request.kind.as_str(),
            records = emitted,
            has_more = has_more,
            "Fetch finished"
        );
        Ok(())
    }
}
