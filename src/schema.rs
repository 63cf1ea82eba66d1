// Column types for the job table. The physical table name is configurable, so
// queries go through `sql_query`; this declaration only types the rows.

diesel::table! {
    jobs (id) {
        id -> Text,
        handler -> Text,
        queue -> Text,
        attempts -> Integer,
        run_at -> Nullable<Timestamp>,
        locked_at -> Nullable<Timestamp>,
        locked_by -> Nullable<Text>,
        failed_at -> Nullable<Timestamp>,
        error -> Nullable<Text>,
        created_at -> Timestamp,
    }
}
