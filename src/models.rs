use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

/// Document lifecycle states. SIGNED and REJECTED are terminal for the
/// signing pipeline; EXPIRED is set by an external sweep.
pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_SIGNED: &str = "SIGNED";
pub const STATUS_REJECTED: &str = "REJECTED";
pub const STATUS_EXPIRED: &str = "EXPIRED";

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = documents)]
#[diesel(belongs_to(User, foreign_key = owner_id))]
pub struct Document {
    pub id: Uuid,
    pub name: String,
    pub blob_key: String,
    pub owner_id: Uuid,
    pub status: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub name: String,
    pub blob_key: String,
    pub owner_id: Uuid,
    pub status: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = signatures)]
#[diesel(belongs_to(Document))]
pub struct Signature {
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub signature_image: String,
    pub signed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = signatures)]
pub struct NewSignature {
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub signature_image: String,
    pub signed_at: NaiveDateTime,
}
