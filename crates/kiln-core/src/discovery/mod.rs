//! Board discovery: one-shot snapshots and continuous watches.
//!
//! A watch polls the port enumerator on its own task and sends the
//! difference from its previous view. The first poll diffs against an empty
//! view, so a subscriber starts with one `Added` delta per attached port.
//! Sequence numbers are per subscription and start at 1.

mod serial;

pub use serial::SerialPortEnumerator;

use crate::instance::Instance;
use crate::{Error, Result};
use kiln_types::{BoardDelta, DeltaKind, DetectedPort, Port};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Source of currently attached ports.
///
/// `enumerate` may block; callers run it on the blocking pool.
pub trait PortEnumerator: Send + Sync + 'static {
    /// List attached ports.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform's device listing fails.
    fn enumerate(&self) -> Result<Vec<Port>>;
}

/// `(protocol, address)`
pub type PortKey = (String, String);

/// Enumerate ports and match them against the instance's installed boards.
async fn detect(
    enumerator: &Arc<dyn PortEnumerator>,
    instance: &Instance,
) -> Result<Vec<DetectedPort>> {
    let enumerator = enumerator.clone();
    let ports = tokio::task::spawn_blocking(move || enumerator.enumerate())
        .await
        .map_err(|e| Error::BackendUnavailable(format!("Port enumeration task failed: {e}")))??;

    let state = instance.state.read().await;
    Ok(ports
        .into_iter()
        .map(|port| {
            let matching_boards = match (port.vid(), port.pid()) {
                (Some(vid), Some(pid)) => state.identify(vid, pid),
                _ => Vec::new(),
            };
            DetectedPort {
                port,
                matching_boards,
            }
        })
        .collect())
}

/// One-shot discovery snapshot.
///
/// The timeout bounds how long the caller waits; an enumeration still in
/// progress when it expires is left to finish on the blocking pool and its
/// result is discarded.
///
/// # Errors
///
/// Returns `Error::Timeout` on expiry, or the enumerator's error.
pub async fn snapshot(
    enumerator: &Arc<dyn PortEnumerator>,
    instance: &Instance,
    timeout: Duration,
) -> Result<Vec<DetectedPort>> {
    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    tokio::time::timeout(timeout, detect(enumerator, instance))
        .await
        .map_err(|_| Error::Timeout(millis))?
}

/// Difference between two views, removals first, then additions, then
/// updates. Sequence numbers continue from `seq`.
pub fn diff(
    previous: &BTreeMap<PortKey, DetectedPort>,
    current: &BTreeMap<PortKey, DetectedPort>,
    seq: &mut u64,
) -> Vec<BoardDelta> {
    let mut next = |kind, port: &DetectedPort| {
        *seq += 1;
        BoardDelta {
            seq: *seq,
            kind,
            port: port.clone(),
        }
    };

    let mut deltas = Vec::new();
    for (key, port) in previous {
        if !current.contains_key(key) {
            deltas.push(next(DeltaKind::Removed, port));
        }
    }
    for (key, port) in current {
        if !previous.contains_key(key) {
            deltas.push(next(DeltaKind::Added, port));
        }
    }
    for (key, port) in current {
        if previous.get(key).is_some_and(|old| old != port) {
            deltas.push(next(DeltaKind::Updated, port));
        }
    }
    deltas
}

fn keyed(ports: Vec<DetectedPort>) -> BTreeMap<PortKey, DetectedPort> {
    ports.into_iter().map(|p| (p.port.key(), p)).collect()
}

/// Start a watch subscription.
///
/// The stream ends without error when the receiver is dropped or the
/// instance is destroyed.
#[must_use]
pub fn watch(
    enumerator: Arc<dyn PortEnumerator>,
    instance: Arc<Instance>,
    interval: Duration,
    buffer: usize,
) -> mpsc::Receiver<BoardDelta> {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    tokio::spawn(async move {
        let id = instance.id;
        let mut view = BTreeMap::new();
        let mut seq = 0;
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("[{}] Board watch started", id);

        'watch: loop {
            tokio::select! {
                () = instance.closed.cancelled() => break,
                () = tx.closed() => break,
                _ = ticker.tick() => {}
            }

            let current = match detect(&enumerator, &instance).await {
                Ok(ports) => keyed(ports),
                Err(e) => {
                    warn!("[{}] Board watch poll failed: {}", id, e);
                    continue;
                }
            };

            for delta in diff(&view, &current, &mut seq) {
                if tx.send(delta).await.is_err() {
                    break 'watch;
                }
            }
            view = current;
        }
        debug!("[{}] Board watch ended", id);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected(address: &str) -> DetectedPort {
        DetectedPort {
            port: Port::serial(address),
            matching_boards: Vec::new(),
        }
    }

    #[test]
    fn test_diff_orders_removals_first() {
        let previous = keyed(vec![detected("/dev/ttyACM0"), detected("/dev/ttyACM1")]);
        let current = keyed(vec![detected("/dev/ttyACM1"), detected("/dev/ttyUSB0")]);
        let mut seq = 4;

        let deltas = diff(&previous, &current, &mut seq);
        let summary: Vec<_> = deltas
            .iter()
            .map(|d| (d.seq, d.kind, d.port.port.address.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (5, DeltaKind::Removed, "/dev/ttyACM0"),
                (6, DeltaKind::Added, "/dev/ttyUSB0"),
            ]
        );
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_diff_reports_board_changes_as_updates() {
        let previous = keyed(vec![detected("/dev/ttyACM0")]);
        let mut changed = detected("/dev/ttyACM0");
        changed.port = changed.port.with_usb_id("2341", "804e");
        let current = keyed(vec![changed.clone()]);
        let mut seq = 0;

        let deltas = diff(&previous, &current, &mut seq);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind, DeltaKind::Updated);
        assert_eq!(deltas[0].port, changed);
    }

    #[test]
    fn test_diff_identical_views_is_empty() {
        let view = keyed(vec![detected("/dev/ttyACM0")]);
        let mut seq = 0;
        assert!(diff(&view, &view, &mut seq).is_empty());
        assert_eq!(seq, 0);
    }

    mod convergence {
        use super::*;
        use kiln_types::PortSet;
        use proptest::prelude::*;

        prop_compose! {
            fn arb_port()(
                index in 0u8..6,
                board in proptest::option::of(0u8..3)
            ) -> DetectedPort {
                let mut port = detected(&format!("/dev/ttyACM{index}"));
                if let Some(board) = board {
                    port.port = port.port.with_usb_id("2341", &format!("804{board}"));
                }
                port
            }
        }

        fn arb_view() -> impl Strategy<Value = BTreeMap<PortKey, DetectedPort>> {
            proptest::collection::vec(arb_port(), 0..6).prop_map(keyed)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn replayed_deltas_rebuild_every_view(views in proptest::collection::vec(arb_view(), 1..8)) {
                let mut set = PortSet::new();
                let mut previous = BTreeMap::new();
                let mut seq = 0;

                for view in views {
                    for delta in diff(&previous, &view, &mut seq) {
                        prop_assert!(set.apply(&delta), "delta {} out of order", delta.seq);
                    }
                    let expected: Vec<_> = view.values().cloned().collect();
                    prop_assert_eq!(set.snapshot(), expected);
                    prop_assert_eq!(set.last_seq(), seq);
                    previous = view;
                }
            }
        }
    }
}
