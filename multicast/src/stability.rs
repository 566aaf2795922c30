//! Stability detection
//!
//! A buffered message from sender `s` carrying `VC` is stable once every row
//! of the matrix clock has accounted for at least `VC[s]` sends from `s`:
//! `VC[s] <= min over x of MC[x][s]`. Stable messages can never again be
//! needed for causal bookkeeping and are evicted from the buffer.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::interval_at};
use tracing::{debug, info, trace};

use crate::{clock::MatrixClock, message::Message, metrics, state::GroupState};

/// Stability of one buffered message against a clock snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Stable,
    Pending { sequence: u64, observed_min: u64 },
    /// The sender id is outside the current matrix; re-evaluated later.
    UnknownSender,
}

pub fn evaluate(message: &Message, clock: &MatrixClock) -> Verdict {
    let sender = message.sender();
    let Some(observed_min) = clock.column_min(sender) else {
        return Verdict::UnknownSender;
    };

    let sequence = message.sequence();
    if sequence <= observed_min {
        Verdict::Stable
    } else {
        Verdict::Pending {
            sequence,
            observed_min,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub retained: usize,
    pub skipped: usize,
}

/// Evaluate every buffered message, then evict the stable ones.
pub fn sweep(state: &GroupState) -> SweepReport {
    let mut buffer = state.buffer.lock();
    let mut report = SweepReport::default();

    let stable: Vec<usize> = state.clock.view(|clock| {
        buffer
            .iter()
            .enumerate()
            .filter_map(|(idx, message)| match evaluate(message, clock) {
                Verdict::Stable => Some(idx),
                Verdict::Pending { .. } => {
                    report.retained += 1;
                    None
                }
                Verdict::UnknownSender => {
                    debug!(
                        "Message in buffer has invalid sender ID ({}). Skipping stabilization check.",
                        message.sender()
                    );
                    report.skipped += 1;
                    None
                }
            })
            .collect()
    });

    for message in buffer.evict(&stable) {
        trace!("Discarding stable message: {}", message);
    }
    report.evicted = stable.len();

    if report.evicted > 0 {
        metrics::record_evicted(report.evicted);
        metrics::record_buffer_depth(buffer.len());
    }
    report
}

/// Periodic stability sweep, stopped by `shutdown_rx`.
pub async fn run_stability_task(
    state: Arc<GroupState>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval_timer = interval_at(tokio::time::Instant::now() + period, period);
    info!("Starting stability sweep with {:?} interval", period);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let report = sweep(&state);
                if report.evicted > 0 {
                    debug!(
                        "Stability sweep evicted {} message(s), {} pending, {} skipped",
                        report.evicted, report.retained, report.skipped
                    );
                }
            }
            _ = shutdown_rx.changed() => {
                info!("Stability sweep received shutdown signal");
                break;
            }
        }
    }

    info!("Stability sweep stopped");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::membership::GroupMember;

    fn state_with_members(n: u16) -> GroupState {
        let member = |port: u16| GroupMember::from(SocketAddr::from(([127, 0, 0, 1], port)));
        let state = GroupState::new(member(5000), 16);
        state
            .apply_presence((1..n).map(|i| member(5000 + i)))
            .unwrap();
        state
    }

    #[test]
    fn test_evaluate_verdicts() {
        let mut clock = MatrixClock::new(3);
        clock.set_row(0, &[0, 2, 0]);
        clock.set_row(1, &[0, 3, 0]);
        clock.set_row(2, &[0, 1, 0]);

        let early = Message::new("a".to_string(), 1, vec![0, 1, 0]);
        let late = Message::new("b".to_string(), 1, vec![0, 3, 0]);
        let stranger = Message::new("c".to_string(), 4, vec![0, 0, 0, 0, 1]);

        assert_eq!(evaluate(&early, &clock), Verdict::Stable);
        assert_eq!(
            evaluate(&late, &clock),
            Verdict::Pending {
                sequence: 3,
                observed_min: 1
            }
        );
        assert_eq!(evaluate(&stranger, &clock), Verdict::UnknownSender);
    }

    #[test]
    fn test_message_waits_for_slowest_row() {
        let state = state_with_members(3);
        // Sender P1 is on its fifth send; P2 has only seen three of them.
        state.clock.set_row(0, &[0, 5, 0]);
        state.clock.set_row(1, &[0, 5, 0]);
        state.clock.set_row(2, &[0, 3, 0]);
        state.buffer.lock().push(Message::new("fifth".to_string(), 1, vec![0, 5, 0]));

        let report = sweep(&state);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.retained, 1);
        assert_eq!(state.buffered_len(), 1);

        state.clock.set_row(2, &[0, 5, 1]);
        let report = sweep(&state);
        assert_eq!(report.evicted, 1);
        assert_eq!(state.buffered_len(), 0);
    }

    #[test]
    fn test_unknown_sender_stays_buffered() {
        let state = state_with_members(2);
        state
            .buffer
            .lock()
            .push(Message::new("ghost".to_string(), 5, vec![0, 0, 0, 0, 0, 1]));

        let report = sweep(&state);
        assert_eq!(report.skipped, 1);
        assert_eq!(state.buffered_len(), 1);
    }

    #[test]
    fn test_sweep_only_evicts_stable_entries() {
        let state = state_with_members(2);
        state.clock.set_row(0, &[2, 1]);
        state.clock.set_row(1, &[2, 1]);
        {
            let mut buffer = state.buffer.lock();
            buffer.push(Message::new("p0-1".to_string(), 0, vec![1, 0]));
            buffer.push(Message::new("p1-2".to_string(), 1, vec![0, 2]));
            buffer.push(Message::new("p0-2".to_string(), 0, vec![2, 0]));
        }

        let report = sweep(&state);
        assert_eq!(report.evicted, 2);
        let left: Vec<String> = state
            .buffered()
            .iter()
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(left, vec!["p1-2"]);
    }

    #[tokio::test]
    async fn test_stability_task_stops_on_shutdown() {
        let state = Arc::new(state_with_members(2));
        state.clock.set_row(0, &[1, 1]);
        state.clock.set_row(1, &[1, 1]);
        state
            .buffer
            .lock()
            .push(Message::new("m".to_string(), 1, vec![0, 1]));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_stability_task(
            state.clone(),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.buffered_len(), 0);

        shutdown_tx.send(true).expect("failed to send shutdown signal");
        let res = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(res.is_ok(), "stability task did not shut down in time");
    }
}
