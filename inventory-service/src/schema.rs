diesel::table! {
    assignments (id) {
        id -> Int8,
        customer_email -> Varchar,
        customer_user_id -> Nullable<Int8>,
        account_id -> Int8,
        order_id -> Int8,
        product_id -> Int8,
        unit -> Nullable<Int4>,
        started_at -> Timestamptz,
        ended_at -> Nullable<Timestamptz>,
        status -> Varchar,
        notified_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    inventory_accounts (id) {
        id -> Int8,
        product_id -> Int8,
        account_email -> Varchar,
        sealed_secret -> Text,
        kind -> Varchar,
        capacity -> Int4,
        occupancy -> Int4,
        state -> Varchar,
        notes -> Text,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    product_policies (product_id) {
        product_id -> Int8,
        kind -> Varchar,
    }
}

// Storefront tables, read-only here.
diesel::table! {
    commerce_orders (id) {
        id -> Int8,
        billing_email -> Nullable<Varchar>,
        user_id -> Nullable<Int8>,
        user_email -> Nullable<Varchar>,
        status -> Varchar,
    }
}

diesel::table! {
    commerce_order_items (id) {
        id -> Int8,
        order_id -> Int8,
        product_id -> Int8,
        quantity -> Int4,
    }
}

diesel::joinable!(assignments -> inventory_accounts (account_id));
diesel::joinable!(commerce_order_items -> commerce_orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    assignments,
    inventory_accounts,
    product_policies,
    commerce_orders,
    commerce_order_items,
);
