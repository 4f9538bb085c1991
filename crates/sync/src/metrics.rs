//! View Syncer metrics: hydration/flush timers, poke outcomes,
//! eviction counts, and per-client-group row/query-set gauges.

metrics::register_histogram!(
    SYNC_HYDRATE_SECONDS,
    "time spent hydrating newly added queries",
    &["status"]
);
metrics::register_histogram!(
    SYNC_CVR_FLUSH_SECONDS,
    "time spent flushing a CVR updater",
    &["status"]
);
metrics::register_counter!(
    SYNC_POKES_TOTAL,
    "pokes sent to clients, by outcome",
    &["outcome"]
);
metrics::register_counter!(
    SYNC_EVICTIONS_TOTAL,
    "queries evicted, by reason",
    &["reason"]
);
metrics::register_gauge!(
    SYNC_ROW_COUNT,
    "rows currently tracked per client group",
    &["client_group_id"]
);
metrics::register_gauge!(
    SYNC_QUERY_SET_SIZE,
    "queries currently hydrated per client group",
    &["client_group_id"]
);

pub fn record_poke(outcome: &'static str) {
    metrics::log_counter(&SYNC_POKES_TOTAL, &[outcome], 1);
}

pub fn record_eviction(reason: &'static str, count: i64) {
    metrics::log_counter(&SYNC_EVICTIONS_TOTAL, &[reason], count);
}

pub fn set_row_count(client_group_id: &str, count: i64) {
    metrics::log_gauge(&SYNC_ROW_COUNT, &[client_group_id], count);
}

pub fn set_query_set_size(client_group_id: &str, count: i64) {
    metrics::log_gauge(&SYNC_QUERY_SET_SIZE, &[client_group_id], count);
}

pub fn hydrate_timer() -> metrics::StatusTimer<'static> {
    metrics::StatusTimer::new(&SYNC_HYDRATE_SECONDS)
}

pub fn flush_timer() -> metrics::StatusTimer<'static> {
    metrics::StatusTimer::new(&SYNC_CVR_FLUSH_SECONDS)
}
