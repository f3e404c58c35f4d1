use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use diesel::{prelude::*, result::DatabaseErrorKind};
use thiserror::Error;
use tokio::{task, time::timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::PgPool;
use crate::error::AppError;
use crate::models::{
    Document, NewSignature, Signature, STATUS_PENDING, STATUS_SIGNED,
};
use crate::pdf::{self, PdfError};
use crate::schema::{documents, signatures};
use crate::signature_image::{self, SignatureImageError};
use crate::state::AppState;

/// Upper bound on each blob-store call so a stalled fetch or upload
/// cannot hang the request indefinitely.
pub const BLOB_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the commit transaction. The transaction runs on a
/// detached blocking thread and still lands after a timeout; only the
/// response gives up waiting for it.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SignError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("document not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("already signed")]
    Conflict,
    #[error("document is not pending")]
    NotPending,
    #[error("source missing in storage")]
    SourceMissing,
    #[error("failed to fetch source document: {0}")]
    FetchFailed(String),
    #[error("source document is not a readable pdf: {0}")]
    CorruptSource(String),
    #[error("failed to encode signed document: {0}")]
    EncodeFailed(String),
    #[error("failed to persist signed document: {0}")]
    PersistFailed(String),
    #[error("{0}")]
    Internal(String),
}

impl From<SignatureImageError> for SignError {
    fn from(err: SignatureImageError) -> Self {
        SignError::InvalidInput(err.to_string())
    }
}

impl From<PdfError> for SignError {
    fn from(err: PdfError) -> Self {
        if err.is_decode() {
            SignError::CorruptSource(err.to_string())
        } else {
            SignError::EncodeFailed(err.to_string())
        }
    }
}

impl From<diesel::result::Error> for SignError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => SignError::NotFound,
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                SignError::Conflict
            }
            other => SignError::Internal(format!("database error: {other}")),
        }
    }
}

/// Maps pipeline failures onto the HTTP surface. Codec and storage
/// failures are collapsed into an opaque 500; their detail is only
/// logged.
impl From<SignError> for AppError {
    fn from(err: SignError) -> Self {
        match err {
            SignError::InvalidInput(message) => AppError::bad_request(message),
            SignError::NotFound => AppError::new(StatusCode::NOT_FOUND, "document not found"),
            SignError::Forbidden => AppError::forbidden(),
            SignError::Conflict => AppError::bad_request("already signed"),
            SignError::NotPending => AppError::bad_request("document is not pending"),
            SignError::SourceMissing => {
                AppError::new(StatusCode::NOT_FOUND, "source missing in storage")
            }
            SignError::FetchFailed(_)
            | SignError::CorruptSource(_)
            | SignError::EncodeFailed(_)
            | SignError::PersistFailed(_)
            | SignError::Internal(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

pub struct SignedDocument {
    pub document: Document,
    pub signature: Signature,
}

/// Signs `document_id` on behalf of `requester_id`: validates
/// preconditions, fetches the source pdf, embeds the decoded signature
/// image on the last page, uploads the result under a fresh blob key,
/// and commits the status transition together with the signature record
/// in one transaction. The blob-key flip inside that transaction is what
/// makes the swap atomic from the repository's perspective; the previous
/// key is garbage-collected best-effort afterwards.
pub async fn sign_document(
    state: &AppState,
    document_id: Uuid,
    requester_id: Uuid,
    signature_payload: &str,
) -> Result<SignedDocument, SignError> {
    let document = load_document(state, document_id)?;

    if document.owner_id != requester_id {
        warn!(
            document_id = %document.id,
            requester_id = %requester_id,
            "sign rejected: requester does not own document"
        );
        return Err(SignError::Forbidden);
    }

    let signature_image = signature_image::decode_signature_png(signature_payload)?;

    ensure_signable(state, &document, requester_id)?;

    let exists = timeout(
        BLOB_CALL_TIMEOUT,
        state.storage.object_exists(&document.blob_key),
    )
    .await
    .map_err(|_| SignError::FetchFailed("timed out checking source object".to_string()))?
    .map_err(|err| SignError::FetchFailed(err.to_string()))?;

    if !exists {
        // The repository points at a blob that is gone. Retrying cannot
        // help; surface this distinctly from transient storage errors.
        error!(
            document_id = %document.id,
            blob_key = %document.blob_key,
            "sign failed: blob reference is orphaned"
        );
        return Err(SignError::SourceMissing);
    }

    let source_bytes = fetch_source_bytes(state, &document.blob_key).await?;

    let signed_bytes = task::spawn_blocking(move || {
        pdf::embed_signature(&source_bytes, &signature_image)
    })
    .await
    .map_err(|err| SignError::Internal(format!("signing task panicked: {err}")))??;

    let signed_size = signed_bytes.len() as i64;
    let signed_key = format!("documents/{}/signed/{}", document.id, Uuid::new_v4());

    timeout(
        BLOB_CALL_TIMEOUT,
        state.storage.put_object(
            &signed_key,
            signed_bytes,
            Some("application/pdf".to_string()),
            None,
        ),
    )
    .await
    .map_err(|_| SignError::PersistFailed("timed out uploading signed document".to_string()))?
    .map_err(|err| SignError::PersistFailed(err.to_string()))?;

    let commit_task = {
        let pool = state.pool.clone();
        let document_id = document.id;
        let signed_key = signed_key.clone();
        let signature_payload = signature_payload.to_string();
        task::spawn_blocking(move || {
            commit_signing(
                &pool,
                document_id,
                &signed_key,
                signed_size,
                &signature_payload,
                requester_id,
            )
        })
    };

    let commit_result = match timeout(COMMIT_TIMEOUT, commit_task).await {
        Ok(joined) => {
            joined.map_err(|err| SignError::Internal(format!("commit task panicked: {err}")))?
        }
        Err(_) => {
            warn!(
                document_id = %document.id,
                signed_key = %signed_key,
                "signing commit timed out; the transaction may still land"
            );
            Err(SignError::PersistFailed(
                "timed out committing signing transaction".to_string(),
            ))
        }
    };

    match commit_result {
        Ok(signed) => {
            match timeout(
                BLOB_CALL_TIMEOUT,
                state.storage.delete_object(&document.blob_key),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    document_id = %document.id,
                    blob_key = %document.blob_key,
                    error = %err,
                    "failed to garbage-collect unsigned blob"
                ),
                Err(_) => warn!(
                    document_id = %document.id,
                    blob_key = %document.blob_key,
                    "timed out garbage-collecting unsigned blob"
                ),
            }
            info!(
                document_id = %signed.document.id,
                signature_id = %signed.signature.id,
                user_id = %requester_id,
                "document signed"
            );
            Ok(signed)
        }
        Err(err) => {
            // The signed blob was already uploaded; without a committed
            // pointer it is an orphaned write. Logged, not undone.
            warn!(
                document_id = %document.id,
                signed_key = %signed_key,
                error = %err,
                "signing commit failed; uploaded blob left orphaned"
            );
            Err(err)
        }
    }
}

fn load_document(state: &AppState, document_id: Uuid) -> Result<Document, SignError> {
    let mut conn = state
        .db()
        .map_err(|err| SignError::Internal(format!("{err:?}")))?;

    documents::table
        .find(document_id)
        .first::<Document>(&mut conn)
        .optional()?
        .ok_or(SignError::NotFound)
}

/// Precondition 4: the document must still be PENDING and unsigned. The
/// check here is advisory; the unique constraint on
/// `signatures(document_id)` inside `commit_signing` is the arbiter for
/// the check-then-act race.
fn ensure_signable(
    state: &AppState,
    document: &Document,
    requester_id: Uuid,
) -> Result<(), SignError> {
    match document.status.as_str() {
        STATUS_PENDING => {}
        STATUS_SIGNED => return Err(SignError::Conflict),
        _ => return Err(SignError::NotPending),
    }

    let mut conn = state
        .db()
        .map_err(|err| SignError::Internal(format!("{err:?}")))?;

    let existing: Option<Signature> = signatures::table
        .filter(signatures::document_id.eq(document.id))
        .first(&mut conn)
        .optional()?;

    if let Some(signature) = existing {
        warn!(
            document_id = %document.id,
            signature_id = %signature.id,
            requester_id = %requester_id,
            "sign rejected: signature already exists"
        );
        return Err(SignError::Conflict);
    }

    Ok(())
}

/// Primary fetch with one alternate-path retry over a signed URL. The
/// fallback targets the same resource via a different transport, so a
/// transient failure of the primary path does not fail the request.
async fn fetch_source_bytes(state: &AppState, blob_key: &str) -> Result<Vec<u8>, SignError> {
    match timeout(BLOB_CALL_TIMEOUT, state.storage.get_object(blob_key)).await {
        Ok(Ok(bytes)) => return Ok(bytes),
        Ok(Err(err)) => {
            warn!(blob_key, error = %err, "primary fetch failed; trying signed-url fallback");
        }
        Err(_) => {
            warn!(blob_key, "primary fetch timed out; trying signed-url fallback");
        }
    }

    match timeout(
        BLOB_CALL_TIMEOUT,
        state.storage.get_object_via_signed_url(blob_key),
    )
    .await
    {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(err)) => Err(SignError::FetchFailed(err.to_string())),
        Err(_) => Err(SignError::FetchFailed(
            "signed-url fallback timed out".to_string(),
        )),
    }
}

fn commit_signing(
    pool: &PgPool,
    document_id: Uuid,
    signed_key: &str,
    signed_size: i64,
    signature_payload: &str,
    user_id: Uuid,
) -> Result<SignedDocument, SignError> {
    let mut conn = pool
        .get()
        .map_err(|err| SignError::Internal(format!("database pool error: {err}")))?;
    let now = Utc::now().naive_utc();

    conn.transaction::<SignedDocument, SignError, _>(|conn| {
        let updated = diesel::update(
            documents::table
                .find(document_id)
                .filter(documents::status.eq(STATUS_PENDING)),
        )
        .set((
            documents::status.eq(STATUS_SIGNED),
            documents::blob_key.eq(signed_key),
            documents::size_bytes.eq(signed_size),
            documents::updated_at.eq(now),
        ))
        .execute(conn)?;

        if updated == 0 {
            // Lost the race: another request already moved the document
            // out of PENDING.
            return Err(SignError::Conflict);
        }

        let new_signature = NewSignature {
            id: Uuid::new_v4(),
            document_id,
            user_id,
            signature_image: signature_payload.to_string(),
            signed_at: now,
        };
        diesel::insert_into(signatures::table)
            .values(&new_signature)
            .execute(conn)?;

        let document: Document = documents::table.find(document_id).first(conn)?;
        let signature: Signature = signatures::table.find(new_signature.id).first(conn)?;

        Ok(SignedDocument {
            document,
            signature,
        })
    })
}
