use crate::peer::PeerId;
use crate::tx::status::TxOutcome;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($(#[$m:meta])* $name:ident / $snap:ident { $($field:ident),* $(,)? }) => {
        $(#[$m])*
        #[derive(Debug, Default)]
        pub struct $name {
            $(pub $field: AtomicU64,)*
        }

        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $snap {
            $(pub $field: u64,)*
        }

        impl $name {
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Device-wide datapath counters.
    SocStats / StatsSnapshot {
        rx_reaped,
        rx_delivered,
        rx_ring_error,
        rx_ring_access_fail,
        rx_stale_cookie,
        rx_sanity_fail,
        rx_invalid_tid,
        rx_msdu_not_done,
        rx_msdu_error,
        rx_sg_deferred,
        rx_sg_drop,
        rx_unauthorized_drop,
        rx_raw_drop,
        rx_no_peer_drop,
        rx_near_full_passes,
        rx_intrabss_fwd,
        rx_intrabss_fail,
        rx_intrabss_eapol_drop,
        rx_cross_link,

        refill_posted,
        refill_alloc_fail,
        refill_dma_fail,
        refill_desc_exhausted,
        reserve_used,
        reserve_returned,

        tx_enqueued,
        tx_desc_exhausted,
        tx_dma_fail,
        tx_ring_full,
        tx_admission_denied,
        tx_vdev_down,
        tx_doorbells,
        tx_reinjected,
        tx_reinject_fail,
        tx_mcast_fanout,

        comp_reaped,
        comp_ring_access_fail,
        comp_acked,
        comp_dropped,
        comp_inspected,
        comp_invalid_source,
        comp_freed_in_detach,
        comp_mec_notify,
        comp_vdev_mismatch,
    }
}

#[inline]
pub(crate) fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(c: &AtomicU64, n: u64) {
    c.fetch_add(n, Ordering::Relaxed);
}

/// Bumps `c`; true for the occurrences worth a log line (first, then every 1024th).
#[inline]
pub(crate) fn bump_ratelimited(c: &AtomicU64) -> bool {
    c.fetch_add(1, Ordering::Relaxed) % 1024 == 0
}

#[derive(Debug, Default)]
pub struct TidCounters {
    pub delivered: AtomicU64,
    pub intrabss: AtomicU64,
    pub fail: AtomicU64,
}

/// Per (RX ring, TID) counters.
pub struct TidStats {
    tids: usize,
    cells: Vec<TidCounters>,
}

impl TidStats {
    pub fn new(rings: usize, tids: usize) -> Self {
        let mut cells = Vec::with_capacity(rings * tids);
        cells.resize_with(rings * tids, TidCounters::default);
        Self { tids, cells }
    }

    pub fn get(&self, ring: u8, tid: u8) -> Option<&TidCounters> {
        let tid = (tid as usize).min(self.tids.saturating_sub(1));
        self.cells.get(ring as usize * self.tids + tid)
    }
}

/// Fire-and-forget per-packet counters for an external stats collector.
///
/// The engines never read anything back from it.
pub trait Telemetry: Send + Sync {
    fn rx_msdu(&self, _peer: PeerId, _tid: u8, _ring: u8, _len: usize) {}
    fn tx_completion(&self, _peer: PeerId, _tid: u8, _outcome: &TxOutcome, _len: usize) {}
}

pub struct NoTelemetry;

impl Telemetry for NoTelemetry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SocStats::default();
        bump(&stats.rx_reaped);
        add(&stats.rx_reaped, 2);
        bump(&stats.comp_acked);
        let snap = stats.snapshot();
        assert_eq!(snap.rx_reaped, 3);
        assert_eq!(snap.comp_acked, 1);
        assert_eq!(snap.tx_enqueued, 0);
    }

    #[test]
    fn test_tid_stats_clamps_tid() {
        let tids = TidStats::new(2, 9);
        bump(&tids.get(1, 200).unwrap().fail);
        assert_eq!(tids.get(1, 8).unwrap().fail.load(Ordering::Relaxed), 1);
        assert!(tids.get(2, 0).is_none());
    }
}
