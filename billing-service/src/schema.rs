diesel::table! {
    invoices (id) {
        id -> Uuid,
        number -> Varchar,
        status -> Varchar,
        failure_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    invoice_items (id) {
        id -> Uuid,
        invoice_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        unit_price -> Numeric,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(invoice_items -> invoices (invoice_id));

diesel::allow_tables_to_appear_in_same_query!(
    invoices,
    invoice_items,
);
