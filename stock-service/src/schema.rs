diesel::table! {
    products (id) {
        id -> Uuid,
        sku -> Varchar,
        name -> Varchar,
        balance -> Int4,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reservations (id) {
        id -> Uuid,
        invoice_id -> Uuid,
        product_id -> Uuid,
        quantity -> Int4,
        status -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(reservations -> products (product_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    reservations,
);
