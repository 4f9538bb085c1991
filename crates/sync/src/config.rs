//! Tunable knobs, environment-overridable with compiled-in defaults.

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn cursor_page_size() -> usize {
    env_or("CURSOR_PAGE_SIZE", 10_000)
}

pub fn time_slice_check_size() -> usize {
    env_or("TIME_SLICE_CHECK_SIZE", 100)
}

pub fn time_slice_ms() -> u64 {
    env_or("TIME_SLICE_MS", 500)
}

pub fn part_count_flush_threshold() -> usize {
    env_or("PART_COUNT_FLUSH_THRESHOLD", 100)
}

pub fn max_eviction_timer_ms() -> i64 {
    env_or("MAX_EVICTION_TIMER_MS", 3_600_000)
}

pub fn slow_hydrate_threshold_ms() -> u128 {
    env_or("SLOW_HYDRATE_THRESHOLD_MS", 1_000)
}
