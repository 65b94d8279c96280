diesel::table! {
    outbox_events (id) {
        id -> Int8,
        event_type -> Varchar,
        aggregate_id -> Uuid,
        payload -> Jsonb,
        occurred_at -> Timestamptz,
        published_at -> Nullable<Timestamptz>,
        attempts -> Int4,
    }
}

diesel::table! {
    processed_messages (message_id) {
        message_id -> Varchar,
        processed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    outbox_events,
    processed_messages,
);
