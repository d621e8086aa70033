use crate::error::FluxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poller {
    /// Burns 100% CPU. Latency: <10us.
    Busy,
    /// Sleeps immediately. Latency: >50us. Saves Power.
    Wait,
    /// Spins for a short duration, then sleeps. Best general-purpose balance.
    Adaptive,
}

/// Who turns a TX completion cookie back into a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieMode {
    /// Host looks the cookie up and checks the buffer address.
    Software,
    /// Device writes the descriptor handle; host checks the invalidation marker.
    Hardware,
}

/// Capability flags and sizing for one datapath instance.
///
/// Everything the engines consult at runtime lives here; nothing is a
/// compile-time switch.
#[derive(Debug, Clone)]
pub struct DpConfig {
    pub num_chips: u8,
    pub rx_pools_per_chip: u8,
    pub rx_descs_per_pool: u32,
    pub num_rx_rings: u8,
    pub rx_ring_size: u32,
    pub refill_ring_size: u32,
    pub frame_size: u32,
    pub frame_count: u32,

    /// Buffers pushed per refill burst.
    pub rx_refill_burst: u32,
    pub reserve_size: u32,
    /// Consecutive allocation failures before the reserve is tapped.
    pub reserve_fail_threshold: u32,
    /// Refill ring occupancy (percent) under which the reserve is tapped.
    pub reserve_low_watermark_pct: u32,

    pub tx_pools: u8,
    pub tx_descs_per_pool: u32,
    pub tx_ext_descs: u32,
    pub tx_max_frags: u8,
    pub num_tx_rings: u8,
    pub tx_ring_size: u32,
    pub comp_ring_size: u32,

    /// Global ceiling on outstanding TX descriptors for ordinary frames.
    pub max_tx_outstanding: u32,
    /// Per-vdev ceiling for ordinary frames.
    pub max_vdev_tx_outstanding: u32,
    /// Extra descriptors above both ceilings reserved for control-plane frames.
    pub tx_special_allowance: u32,
    /// Vdev queues are resumed once outstanding drops below this percent of the ceiling.
    pub flow_resume_pct: u32,
    pub max_vdevs: u8,

    pub bank_slots: u8,

    pub rx_quota: u32,
    pub tx_comp_quota: u32,
    /// Hard cap on entries reaped in a single invocation.
    pub max_reap_limit: u32,
    /// Ring occupancy (percent) that counts as near-full.
    pub near_full_pct: u32,
    /// Extra passes allowed while a ring stays near-full.
    pub near_full_passes: u32,
    /// Re-check the ring once more before leaving a pass with quota left.
    pub end_of_loop_check: bool,

    pub rx_sg_enabled: bool,
    pub max_data_tids: u8,

    pub cookie_mode: CookieMode,
    pub doorbell_coalesce: bool,
    /// Forces a doorbell once this many submissions are pending.
    pub coalesce_max_pending: u32,

    pub poller: Poller,
}

impl Default for DpConfig {
    fn default() -> Self {
        Self {
            num_chips: 1,
            rx_pools_per_chip: 1,
            rx_descs_per_pool: 1024,
            num_rx_rings: 1,
            rx_ring_size: 1024,
            refill_ring_size: 1024,
            frame_size: 2048,
            frame_count: 4096,

            rx_refill_burst: 64,
            reserve_size: 64,
            reserve_fail_threshold: 3,
            reserve_low_watermark_pct: 10,

            tx_pools: 1,
            tx_descs_per_pool: 1024,
            tx_ext_descs: 256,
            tx_max_frags: 6,
            num_tx_rings: 1,
            tx_ring_size: 1024,
            comp_ring_size: 1024,

            max_tx_outstanding: 896,
            max_vdev_tx_outstanding: 512,
            tx_special_allowance: 64,
            flow_resume_pct: 75,
            max_vdevs: 16,

            bank_slots: 8,

            rx_quota: 64,
            tx_comp_quota: 64,
            max_reap_limit: 256,
            near_full_pct: 75,
            near_full_passes: 2,
            end_of_loop_check: true,

            rx_sg_enabled: true,
            max_data_tids: 9,

            cookie_mode: CookieMode::Software,
            doorbell_coalesce: false,
            coalesce_max_pending: 32,

            poller: Poller::Adaptive,
        }
    }
}

fn ring_size_ok(name: &str, size: u32) -> Result<(), FluxError> {
    if size < 2 || !size.is_power_of_two() {
        return Err(FluxError::InvalidConfiguration(format!(
            "{} ({}) must be a power of two",
            name, size
        )));
    }
    Ok(())
}

impl DpConfig {
    pub fn validate(&self) -> Result<(), FluxError> {
        if self.num_chips == 0 || self.rx_pools_per_chip == 0 || self.num_rx_rings == 0 {
            return Err(FluxError::InvalidConfiguration(
                "at least one chip, one RX pool and one RX ring are required".to_string(),
            ));
        }
        if self.tx_pools == 0 || self.num_tx_rings == 0 {
            return Err(FluxError::InvalidConfiguration(
                "at least one TX pool and one TX ring are required".to_string(),
            ));
        }
        ring_size_ok("rx_ring_size", self.rx_ring_size)?;
        ring_size_ok("refill_ring_size", self.refill_ring_size)?;
        ring_size_ok("tx_ring_size", self.tx_ring_size)?;
        ring_size_ok("comp_ring_size", self.comp_ring_size)?;

        if (self.frame_size as usize) <= fluxpath_core::rx_tlv::RX_TLV_SIZE {
            return Err(FluxError::InvalidConfiguration(format!(
                "frame_size {} leaves no room after the RX TLV area",
                self.frame_size
            )));
        }
        if self.rx_refill_burst == 0 {
            return Err(FluxError::InvalidConfiguration(
                "rx_refill_burst must be non-zero".to_string(),
            ));
        }
        if self.reserve_low_watermark_pct > 100
            || self.near_full_pct > 100
            || self.flow_resume_pct > 100
        {
            return Err(FluxError::InvalidConfiguration(
                "percentages must be within 0..=100".to_string(),
            ));
        }

        let tx_total = self.tx_pools as u32 * self.tx_descs_per_pool;
        if self.max_tx_outstanding + self.tx_special_allowance > tx_total {
            return Err(FluxError::InvalidConfiguration(format!(
                "ceiling {} + allowance {} exceeds {} TX descriptors",
                self.max_tx_outstanding, self.tx_special_allowance, tx_total
            )));
        }
        if self.max_vdev_tx_outstanding > self.max_tx_outstanding {
            return Err(FluxError::InvalidConfiguration(
                "per-vdev ceiling above global ceiling".to_string(),
            ));
        }
        if self.bank_slots == 0 || self.bank_slots > 64 {
            return Err(FluxError::InvalidConfiguration(format!(
                "bank_slots {} out of range",
                self.bank_slots
            )));
        }
        if self.tx_max_frags == 0 {
            return Err(FluxError::InvalidConfiguration(
                "tx_max_frags must be non-zero".to_string(),
            ));
        }
        if self.max_data_tids == 0 {
            return Err(FluxError::InvalidConfiguration(
                "max_data_tids must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Near-full threshold in entries for a ring of `size`.
    pub fn near_full_entries(&self, size: u32) -> u32 {
        ((size as u64 * self.near_full_pct as u64) / 100).max(1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        DpConfig::default().validate().expect("default config");
    }

    #[test]
    fn test_rejects_bad_values() {
        let cfg = DpConfig {
            rx_ring_size: 1000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = DpConfig {
            tx_descs_per_pool: 16,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = DpConfig {
            frame_size: 128,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_near_full_entries() {
        let cfg = DpConfig::default();
        assert_eq!(cfg.near_full_entries(1024), 768);
        assert_eq!(cfg.near_full_entries(1), 1);
    }
}
