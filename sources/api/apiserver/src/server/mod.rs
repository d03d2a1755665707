//! The server module owns the admin API surface.  It interfaces with live storage through the
//! server::lifecycle module, and with stored configuration through the server::controller module.

mod config;
mod controller;
mod error;
mod export;
mod lifecycle;
mod restore;
pub mod validation;

pub use error::Error;
pub use lifecycle::Operation;

use actix_multipart::{Multipart, MultipartError};
use actix_web::body::BoxBody;
use actix_web::error::InternalError;
use actix_web::http::{header, StatusCode};
use actix_web::{
    error::ResponseError, web, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use datastore::StatePaths;
use error::Result;
use futures::TryStreamExt;
use lifecycle::{Lifecycle, Phase, RestartRequest};
use log::{debug, info};
use restore::Upload;
use serde::Serialize;
use serde_json::Value;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use validation::{AuthConfigValidator, ConfigValidator};

use config::ConfigName;

/// File name offered to clients downloading a backup.
const EXPORT_FILENAME: &str = "workspace-backup.zip";

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Router

/// This is the primary interface of the module.  It opens storage under `data_dir` and serves the
/// admin API on `bind` until the server is stopped by a signal.
///
/// Imports and reconfiguration ask for a restart once their changes are on disk.  The running
/// server is then stopped gracefully, letting in-flight responses finish, storage and
/// configuration are reloaded, and a new server is started in its place.  If storage can't be
/// reloaded, this returns an error rather than serving without it.
pub async fn serve<P>(data_dir: P, bind: &str, threads: usize, drain_timeout: Duration) -> Result<()>
where
    P: AsRef<Path>,
{
    let (lifecycle, mut restarts) = Lifecycle::open(StatePaths::new(data_dir), drain_timeout)?;
    let lifecycle = web::Data::new(lifecycle);
    let validator: web::Data<dyn ConfigValidator> =
        web::Data::from(Arc::new(AuthConfigValidator) as Arc<dyn ConfigValidator>);

    // A completed restart keeps the lifecycle lock until the replacement server is listening.
    let mut pending: Option<RestartRequest> = None;
    loop {
        let app_lifecycle = lifecycle.clone();
        let app_validator = validator.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(json_config())
                // This makes live storage available to API methods merely by having a Data
                // parameter.
                .app_data(app_lifecycle.clone())
                .app_data(app_validator.clone())
                .configure(configure)
        })
        .workers(threads)
        .shutdown_timeout(drain_timeout.as_secs().max(1))
        .bind(bind)
        .context(error::BindSocketSnafu { addr: bind })?
        .run();

        let handle = server.handle();
        let mut server_task = actix_rt::spawn(server);
        info!("Serving admin API on {}", bind);
        if let Some(done) = pending.take() {
            debug!("Restart after {} finished", done.guard().operation());
        }

        tokio::select! {
            result = &mut server_task => {
                // Stopped without a restart request, e.g. by a signal.
                return result
                    .context(error::ServerTaskSnafu)?
                    .context(error::ServerStartSnafu);
            }
            Some(request) = restarts.recv() => {
                info!("Restarting server after {}", request.guard().operation());
                handle.stop(true).await;
                server_task
                    .await
                    .context(error::ServerTaskSnafu)?
                    .context(error::ServerStartSnafu)?;
                lifecycle.restart(request.guard())?;
                pending = Some(request);
            }
        }
    }
}

/// Registers the admin routes.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin")
            .route("/backup", web::get().to(export_backup))
            .route("/backup", web::post().to(import_backup))
            .route("/config/{name}", web::get().to(get_config))
            .route("/config/{name}", web::put().to(update_config))
            .route("/status", web::get().to(get_status)),
    );
}

/// In our implementation of ResponseError on our own error type below, we include the error
/// message in the response for debugging purposes.  If actix rejects a request body early
/// because it isn't JSON, though, it doesn't even get to the ResponseError implementation.  This
/// configuration of the Json extractor allows us to add the error message into the response.
pub(crate) fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let body = err.to_string();
        InternalError::from_response(err, HttpResponse::BadRequest().body(body)).into()
    })
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Handler methods called by the router

/// Streams a fresh backup archive of the database and attached files.
async fn export_backup(lifecycle: web::Data<Lifecycle>) -> Result<HttpResponse> {
    let lifecycle = lifecycle.into_inner();
    let stream = web::block(move || export::prepare(&lifecycle))
        .await
        .ok()
        .context(error::BlockingSnafu)??;

    Ok(HttpResponse::Ok()
        .content_type("application/zip")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", EXPORT_FILENAME),
        ))
        .streaming(stream))
}

/// Replaces all server state with the uploaded backup archive, then restarts the server.
async fn import_backup(
    lifecycle: web::Data<Lifecycle>,
    payload: Multipart,
) -> Result<UploadResponse> {
    let guard = lifecycle.acquire(Operation::Import)?;
    let upload = receive_upload(&lifecycle.paths().scratch_dir(), payload).await?;
    let response = HashMap::from([(upload.filename.clone(), upload.size)]);

    // The restore runs on the blocking pool so it isn't abandoned if the client goes away.
    let lifecycle = lifecycle.into_inner();
    web::block(move || restore::import(&lifecycle, guard, upload))
        .await
        .ok()
        .context(error::BlockingSnafu)??;

    Ok(UploadResponse(response))
}

/// Returns the stored payload of a config record.
async fn get_config(
    lifecycle: web::Data<Lifecycle>,
    name: web::Path<String>,
) -> Result<HttpResponse> {
    let name = name.parse::<ConfigName>()?;
    let payload = lifecycle.with_storage(|state| controller::get_config(&state.database, name))?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(payload))
}

/// Validates and stores a config record, then restarts the server so it takes effect.
async fn update_config(
    lifecycle: web::Data<Lifecycle>,
    validator: web::Data<dyn ConfigValidator>,
    name: web::Path<String>,
    payload: web::Json<Value>,
) -> Result<HttpResponse> {
    let name = name.parse::<ConfigName>()?;
    let guard = lifecycle.acquire(Operation::Reconfigure)?;
    lifecycle.with_storage_mut(|state| {
        controller::update_config(&mut state.database, validator.get_ref(), name, &payload)
    })?;
    lifecycle.restart_server(guard)?;
    Ok(HttpResponse::NoContent().finish())
}

/// Reports the lifecycle phase, and the configured auth providers when storage is open.
async fn get_status(lifecycle: web::Data<Lifecycle>) -> Result<StatusResponse> {
    let phase = lifecycle.phase();
    let auth_providers = lifecycle
        .with_storage(|state| Ok(state.auth.provider_ids()))
        .ok();
    Ok(StatusResponse(Status {
        phase,
        auth_providers,
    }))
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Helpers for handler methods called by the router

/// Saves the single file part of a multipart upload under the scratch directory.
async fn receive_upload(scratch: &Path, mut payload: Multipart) -> Result<Upload> {
    let mut upload = None;
    while let Some(mut field) = payload.try_next().await.map_err(upload_read)? {
        ensure!(upload.is_none(), error::ExtraUploadSnafu);
        let filename = field
            .content_disposition()
            .get_filename()
            .context(error::UploadFilenameSnafu)?
            .to_string();

        let (file, mut writer) = create_upload_file(scratch.to_path_buf()).await?;
        let mut size = 0u64;
        while let Some(chunk) = field.try_next().await.map_err(upload_read)? {
            writer
                .write_all(&chunk)
                .await
                .context(error::UploadWriteSnafu { path: file.path() })?;
            size += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .context(error::UploadWriteSnafu { path: file.path() })?;
        debug!("Received upload '{}' ({} bytes)", filename, size);
        upload = Some(Upload {
            filename,
            size,
            file,
        });
    }
    upload.context(error::MissingUploadSnafu)
}

/// Creates the temporary file for an upload on the blocking pool.  The returned async handle
/// shares the file, which is removed when the `NamedTempFile` is dropped.
async fn create_upload_file(scratch: PathBuf) -> Result<(NamedTempFile, tokio::fs::File)> {
    web::block(move || -> Result<_> {
        let file =
            NamedTempFile::new_in(&scratch).context(error::UploadWriteSnafu { path: &scratch })?;
        let handle = file
            .as_file()
            .try_clone()
            .context(error::UploadWriteSnafu { path: file.path() })?;
        Ok((file, tokio::fs::File::from_std(handle)))
    })
    .await
    .ok()
    .context(error::BlockingSnafu)?
}

// Multipart errors can carry request-bound state, so only their message is kept.
fn upload_read(e: MultipartError) -> error::Error {
    error::UploadReadSnafu {
        reason: e.to_string(),
    }
    .build()
}

// Can also override `render_response` if we want to change headers, content type, etc.
impl ResponseError for error::Error {
    /// Maps our error types to the HTTP error code they should return.
    fn status_code(&self) -> StatusCode {
        use error::Error::*;
        match self {
            // 400 Bad Request
            MissingUpload => StatusCode::BAD_REQUEST,
            ExtraUpload => StatusCode::BAD_REQUEST,
            UploadFilename => StatusCode::BAD_REQUEST,
            UploadRead { .. } => StatusCode::BAD_REQUEST,
            ConfigName { .. } => StatusCode::BAD_REQUEST,
            ConfigValidation { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            ConfigNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            LifecycleConflict { .. } => StatusCode::CONFLICT,

            // 503 Service Unavailable
            Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            ResponseSerialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BindSocket { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServerStart { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServerTask { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Blocking => StatusCode::INTERNAL_SERVER_ERROR,
            UploadWrite { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            LockOpen { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StorageFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            DrainTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OpenStorage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            PrepareDir { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ClearScratch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AuthConfigParse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RestartUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            Snapshot { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            FilesSnapshot { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ExportScratch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ArchiveWrite { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ArchiveRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ArchiveOpen { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            DeleteState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            MoveState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StateReplace { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ConfigSerialize { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            DataStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Include the error message in the response, and for all error types.  The admin API is
        // only reachable by workspace administrators, and a failed restore names the rollback
        // snapshot they need.
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}

/// Helper macro for implementing the actix-web Responder trait for a type.
/// $for: the type for which we implement Responder.
/// $self: just pass "self"  (macro hygiene requires this)
/// $serialize_expr: the thing to serialize for a response; this is just "self" again if $for
///    implements Serialize, or is "self.0" for a newtype over something implementing Serialize
macro_rules! impl_responder_for {
    ($for:ident, $self:ident, $serialize_expr:expr) => (
        impl Responder for $for {
            type Body = BoxBody;

            fn respond_to($self, _req: &HttpRequest) -> HttpResponse<Self::Body> {
                match serde_json::to_string(&$serialize_expr)
                    .context(error::ResponseSerializationSnafu)
                {
                    Ok(body) => HttpResponse::Ok()
                        .content_type("application/json")
                        .body(body),
                    Err(e) => e.error_response(),
                }
            }
        }
    )
}

/// This lets us respond from our handler methods with the uploaded file name and size
struct UploadResponse(HashMap<String, u64>);
impl_responder_for!(UploadResponse, self, self.0);

#[derive(Debug, Serialize)]
struct Status {
    #[serde(flatten)]
    phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_providers: Option<Vec<String>>,
}

/// This lets us respond from our handler methods with a Status (or Result<Status>)
struct StatusResponse(Status);
impl_responder_for!(StatusResponse, self, self.0);
