#![allow(clippy::all, missing_docs)]

table! {
    agents (id) {
        id -> Integer,
        name -> Text,
        username -> Text,
        password_hash -> Text,
    }
}

table! {
    packages (id) {
        id -> Text,
        destination -> Text,
        agent_id -> Nullable<Integer>,
        status -> Text,
    }
}

table! {
    delivery_records (id) {
        id -> Integer,
        package_id -> Text,
        delivered_at -> Timestamp,
        latitude_e8 -> BigInt,
        longitude_e8 -> BigInt,
        photo_url -> Text,
    }
}

joinable!(packages -> agents (agent_id));
joinable!(delivery_records -> packages (package_id));

allow_tables_to_appear_in_same_query!(agents, packages, delivery_records);
