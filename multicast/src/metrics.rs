//! Metrics emitted through the `metrics` facade.
//!
//! Nothing is recorded unless the embedding application installs a recorder.

use ::metrics::{counter, gauge};

pub const MESSAGES_SENT: &str = "stable_multicast_messages_sent_total";
pub const DATAGRAMS_SENT: &str = "stable_multicast_datagrams_sent_total";
pub const TRANSMIT_FAILURES: &str = "stable_multicast_transmit_failures_total";
pub const MESSAGES_DELIVERED: &str = "stable_multicast_messages_delivered_total";
pub const DECODE_FAILURES: &str = "stable_multicast_decode_failures_total";
pub const MESSAGES_EVICTED: &str = "stable_multicast_messages_evicted_total";
pub const MEMBERSHIP_CHANGES: &str = "stable_multicast_membership_changes_total";
pub const BUFFER_DEPTH: &str = "stable_multicast_buffer_depth";
pub const GROUP_SIZE: &str = "stable_multicast_group_size";

pub(crate) fn record_sent(destinations: usize) {
    counter!(MESSAGES_SENT).increment(1);
    counter!(DATAGRAMS_SENT).increment(destinations as u64);
}

pub(crate) fn record_transmit_failure() {
    counter!(TRANSMIT_FAILURES).increment(1);
}

pub(crate) fn record_delivered() {
    counter!(MESSAGES_DELIVERED).increment(1);
}

pub(crate) fn record_decode_failure(channel: &'static str) {
    counter!(DECODE_FAILURES, "channel" => channel).increment(1);
}

pub(crate) fn record_evicted(count: usize) {
    counter!(MESSAGES_EVICTED).increment(count as u64);
}

pub(crate) fn record_membership_change(size: usize) {
    counter!(MEMBERSHIP_CHANGES).increment(1);
    gauge!(GROUP_SIZE).set(size as f64);
}

pub(crate) fn record_buffer_depth(depth: usize) {
    gauge!(BUFFER_DEPTH).set(depth as f64);
}
