use std::time::Duration;

use axum::extract::{Json, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{
    Document, NewDocument, Signature, STATUS_PENDING, STATUS_REJECTED, STATUS_SIGNED,
};
use crate::schema::{documents, signatures};
use crate::signing;
use crate::state::AppState;

const PRESIGNED_URL_EXPIRY_SECONDS: u64 = 300;
const PDF_MIME: &str = "application/pdf";
const PDF_HEADER: &[u8] = b"%PDF-";

fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    ))
}

fn to_iso(value: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(value, Utc).to_rfc3339()
}

fn parse_document_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::bad_request("invalid document id"))
}

#[derive(Serialize)]
pub struct SignatureResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub signed_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_image: Option<String>,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureResponse>,
}

#[derive(Serialize)]
pub struct DocumentDetailResponse {
    pub document: DocumentResponse,
}

#[derive(Serialize)]
pub struct DocumentDownloadResponse {
    pub url: String,
    pub expires_in: u64,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
}

#[derive(Deserialize)]
pub struct SignRequest {
    #[serde(rename = "signatureImage", alias = "signature_image", default)]
    pub signature_image: Option<String>,
}

fn to_signature_response(signature: Signature, include_image: bool) -> SignatureResponse {
    SignatureResponse {
        id: signature.id,
        user_id: signature.user_id,
        signed_at: to_iso(signature.signed_at),
        signature_image: include_image.then_some(signature.signature_image),
    }
}

fn to_document_response(
    document: Document,
    signature: Option<Signature>,
    include_image: bool,
) -> DocumentResponse {
    DocumentResponse {
        id: document.id,
        name: document.name,
        status: document.status,
        mime_type: document.mime_type,
        size_bytes: document.size_bytes,
        created_at: to_iso(document.created_at),
        updated_at: to_iso(document.updated_at),
        signature: signature.map(|sig| to_signature_response(sig, include_image)),
    }
}

fn load_signature(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Option<Signature>> {
    Ok(signatures::table
        .filter(signatures::document_id.eq(document_id))
        .first(conn)
        .optional()?)
}

/// Fetches the document and enforces ownership. Missing documents and
/// documents owned by someone else are reported in that order.
fn load_owned_document(
    conn: &mut PgConnection,
    document_id: Uuid,
    user_id: Uuid,
) -> AppResult<Document> {
    let document: Document = documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "document not found"))?;

    if document.owner_id != user_id {
        return Err(AppError::forbidden());
    }

    Ok(document)
}

pub async fn list_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let mut conn = state.db()?;

    let docs: Vec<Document> = documents::table
        .filter(documents::owner_id.eq(user.user_id))
        .order(documents::created_at.desc())
        .load(&mut conn)?;

    let doc_ids: Vec<Uuid> = docs.iter().map(|doc| doc.id).collect();
    let mut sigs: Vec<Signature> = signatures::table
        .filter(signatures::document_id.eq_any(&doc_ids))
        .load(&mut conn)?;

    let response = docs
        .into_iter()
        .map(|doc| {
            let signature = sigs
                .iter()
                .position(|sig| sig.document_id == doc.id)
                .map(|idx| sigs.swap_remove(idx));
            to_document_response(doc, signature, false)
        })
        .collect();

    Ok(Json(response))
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentDetailResponse>)> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    let mut display_name: Option<String> = None;
    let mut content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                file_name = field.file_name().map(|n| n.to_string());
                content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some("name") => {
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("invalid name field: {err}"))
                })?;
                if !value.trim().is_empty() {
                    display_name = Some(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if file_bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let original_name = display_name
        .or(file_name)
        .ok_or_else(|| AppError::bad_request("filename is required"))?;

    if !file_bytes.starts_with(PDF_HEADER) {
        return Err(AppError::bad_request("file must be a pdf"));
    }

    let mime_type = content_type
        .filter(|mime| !mime.trim().is_empty())
        .or_else(|| {
            mime_guess::from_path(&original_name)
                .first()
                .map(|mime| mime.to_string())
        })
        .unwrap_or_else(|| PDF_MIME.to_string());

    let doc_id = Uuid::new_v4();
    let blob_key = format!("documents/{doc_id}/original/{}", Uuid::new_v4());
    let size_bytes = file_bytes.len() as i64;

    state
        .storage
        .put_object(
            &blob_key,
            file_bytes,
            Some(mime_type.clone()),
            inline_content_disposition(&original_name),
        )
        .await
        .map_err(|err| {
            error!(error = %err, key = %blob_key, "failed to store document");
            AppError::internal(format!("failed to store document: {err}"))
        })?;

    let mut conn = state.db()?;
    let new_document = NewDocument {
        id: doc_id,
        name: original_name,
        blob_key: blob_key.clone(),
        owner_id: user.user_id,
        status: STATUS_PENDING.to_string(),
        mime_type: Some(mime_type),
        size_bytes,
    };

    let document: Document = match diesel::insert_into(documents::table)
        .values(&new_document)
        .get_result(&mut conn)
    {
        Ok(document) => document,
        Err(err) => {
            warn!(key = %blob_key, error = %err, "upload insert failed; uploaded blob left orphaned");
            return Err(AppError::from(err));
        }
    };

    info!(
        document_id = %document.id,
        owner_id = %user.user_id,
        size_bytes,
        "document uploaded"
    );

    Ok((
        StatusCode::CREATED,
        Json(DocumentDetailResponse {
            document: to_document_response(document, None, false),
        }),
    ))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentDetailResponse>> {
    let mut conn = state.db()?;
    let document = load_owned_document(&mut conn, document_id, user.user_id)?;
    let signature = load_signature(&mut conn, document_id)?;

    Ok(Json(DocumentDetailResponse {
        document: to_document_response(document, signature, true),
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;
    let document = load_owned_document(&mut conn, document_id, user.user_id)?;

    // Signatures go with the document via ON DELETE CASCADE.
    diesel::delete(documents::table.find(document.id)).execute(&mut conn)?;
    drop(conn);

    if let Err(err) = state.storage.delete_object(&document.blob_key).await {
        warn!(
            document_id = %document.id,
            blob_key = %document.blob_key,
            error = %err,
            "failed to delete blob for removed document"
        );
    }

    info!(document_id = %document.id, owner_id = %user.user_id, "document deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn sign_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    user: AuthenticatedUser,
    Json(payload): Json<SignRequest>,
) -> AppResult<Json<DocumentDetailResponse>> {
    let document_id = parse_document_id(&document_id)?;
    let signature_image = payload.signature_image.unwrap_or_default();

    // Detached so a dropped client connection cannot cancel the pipeline
    // between the blob upload and the commit.
    let signed = tokio::spawn(async move {
        signing::sign_document(&state, document_id, user.user_id, &signature_image).await
    })
    .await
    .map_err(|err| AppError::internal(format!("signing task failed: {err}")))??;

    Ok(Json(DocumentDetailResponse {
        document: to_document_response(signed.document, Some(signed.signature), false),
    }))
}

pub async fn reject_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentDetailResponse>> {
    let document_id = parse_document_id(&document_id)?;
    let mut conn = state.db()?;
    let document = load_owned_document(&mut conn, document_id, user.user_id)?;

    match document.status.as_str() {
        STATUS_PENDING => {}
        STATUS_SIGNED => return Err(AppError::bad_request("already signed")),
        _ => return Err(AppError::bad_request("document is not pending")),
    }

    let now = Utc::now().naive_utc();
    let updated = diesel::update(
        documents::table
            .find(document.id)
            .filter(documents::status.eq(STATUS_PENDING)),
    )
    .set((
        documents::status.eq(STATUS_REJECTED),
        documents::updated_at.eq(now),
    ))
    .execute(&mut conn)?;

    if updated == 0 {
        // Lost the race against a concurrent sign.
        return Err(AppError::bad_request("already signed"));
    }

    let document: Document = documents::table.find(document.id).first(&mut conn)?;
    info!(document_id = %document.id, owner_id = %user.user_id, "document rejected");

    Ok(Json(DocumentDetailResponse {
        document: to_document_response(document, None, false),
    }))
}

pub async fn download_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<DocumentDownloadResponse>> {
    let mut conn = state.db()?;
    let document = load_owned_document(&mut conn, document_id, user.user_id)?;
    drop(conn);

    let presigned_url = state
        .storage
        .presign_get_object(
            &document.blob_key,
            Duration::from_secs(PRESIGNED_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Json(DocumentDownloadResponse {
        url: presigned_url,
        expires_in: PRESIGNED_URL_EXPIRY_SECONDS,
        filename: document.name,
        content_type: document.mime_type,
        size_bytes: document.size_bytes,
    }))
}
