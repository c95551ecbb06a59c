use metrics::{counter, describe_counter};

pub const RECORDS_POLLED: &str = "scoresnap_records_polled_total";
pub const PARSE_FAILURES: &str = "scoresnap_parse_failures_total";
pub const ROWS_UPSERTED: &str = "scoresnap_rows_upserted_total";
pub const CYCLES_COMMITTED: &str = "scoresnap_cycles_committed_total";
pub const COMMIT_FAILURES: &str = "scoresnap_commit_failures_total";

/// Registers descriptions with whichever recorder is installed.
pub fn describe() {
    describe_counter!(RECORDS_POLLED, "Records returned by event source polls.");
    describe_counter!(
        PARSE_FAILURES,
        "Records skipped because their key or score could not be parsed."
    );
    describe_counter!(ROWS_UPSERTED, "Snapshot rows written by committed cycles.");
    describe_counter!(CYCLES_COMMITTED, "Poll cycles committed to the snapshot sink.");
    describe_counter!(
        COMMIT_FAILURES,
        "Snapshot commits that failed and were rolled back."
    );
}

pub(crate) fn record_poll(source: &'static str, records: usize) {
    counter!(RECORDS_POLLED, records as u64, "source" => source);
}

pub(crate) fn record_parse_failures(count: usize) {
    counter!(PARSE_FAILURES, count as u64);
}

pub(crate) fn record_commit(sink: &'static str, rows: usize) {
    counter!(CYCLES_COMMITTED, 1, "sink" => sink);
    counter!(ROWS_UPSERTED, rows as u64, "sink" => sink);
}

pub(crate) fn record_commit_failure(sink: &'static str) {
    counter!(COMMIT_FAILURES, 1, "sink" => sink);
}
