diesel::table! {
    documents (id) {
        id -> Uuid,
        #[max_length = 255]
        name -> Varchar,
        #[max_length = 500]
        blob_key -> Varchar,
        owner_id -> Uuid,
        #[max_length = 16]
        status -> Varchar,
        #[max_length = 100]
        mime_type -> Nullable<Varchar>,
        size_bytes -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    signatures (id) {
        id -> Uuid,
        document_id -> Uuid,
        user_id -> Uuid,
        signature_image -> Text,
        signed_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        #[max_length = 100]
        username -> Varchar,
        #[max_length = 255]
        password_hash -> Varchar,
        #[max_length = 16]
        role -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(documents -> users (owner_id));
diesel::joinable!(signatures -> documents (document_id));
diesel::joinable!(signatures -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(documents, signatures, users,);
