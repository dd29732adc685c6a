diesel::table! {
    datasets (tenant, id) {
        tenant -> Text,
        id -> Text,
        source_query -> Text,
        tenant_subpath -> Nullable<Text>,
        description -> Nullable<Text>,
        status -> Text,
        progress -> Int4,
        last_fetch -> Timestamptz,
        error -> Nullable<Text>,
        views -> Jsonb,
    }
}

diesel::table! {
    jobs (id) {
        id -> Int8,
        name -> Text,
        payload -> Jsonb,
        status -> Text,
        attempts -> Int4,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(datasets, jobs);
