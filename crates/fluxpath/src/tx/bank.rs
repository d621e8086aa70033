//! TX bank profiles.
//!
//! A bank is a small hardware register set holding the per-vdev transmit
//! configuration. Vdevs with identical configuration share a bank; banks are
//! reference counted and recycled once nobody points at them.

use crate::error::FluxError;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BankConfig {
    pub epd: bool,
    /// 0 raw, 1 native wifi, 2 ethernet, 3 802.3.
    pub encap_type: u8,
    pub encrypt_type: u8,
    pub src_buffer_swap: bool,
    pub link_meta_swap: bool,
    pub index_lookup_enable: bool,
    pub addrx_en: bool,
    pub addry_en: bool,
    pub mesh_enable: bool,
    pub vdev_id_check_en: bool,
    pub pmac_id: u8,
    pub mcast_pkt_ctrl: u8,
    pub dscp_tid_map_id: u8,
}

impl BankConfig {
    /// Packs the configuration into the register word the device consumes.
    pub fn encode(&self) -> u32 {
        (self.epd as u32)
            | ((self.encap_type as u32 & 0x3) << 1)
            | ((self.encrypt_type as u32 & 0xF) << 3)
            | ((self.src_buffer_swap as u32) << 7)
            | ((self.link_meta_swap as u32) << 8)
            | ((self.index_lookup_enable as u32) << 9)
            | ((self.addrx_en as u32) << 10)
            | ((self.addry_en as u32) << 11)
            | ((self.mesh_enable as u32) << 12)
            | ((self.vdev_id_check_en as u32) << 13)
            | ((self.pmac_id as u32 & 0x3) << 14)
            | ((self.mcast_pkt_ctrl as u32 & 0x3) << 16)
            | ((self.dscp_tid_map_id as u32 & 0x3F) << 18)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bank {
    configured: bool,
    value: u32,
    refs: u32,
}

pub struct BankTable {
    banks: Mutex<Vec<Bank>>,
}

impl BankTable {
    pub fn new(slots: u8) -> Self {
        Self {
            banks: Mutex::new(vec![Bank::default(); slots as usize]),
        }
    }

    /// Finds or programs a bank for `config` and takes a reference on it.
    ///
    /// Preference: a bank already holding this configuration, then a bank
    /// never programmed, then a programmed bank with no users left.
    pub fn get(&self, config: &BankConfig) -> Result<u8, FluxError> {
        let value = config.encode();
        let mut banks = self
            .banks
            .lock()
            .map_err(|_| FluxError::Corruption("bank table lock poisoned".to_string()))?;

        let mut unconfigured = None;
        let mut zero_ref = None;
        let mut matched = None;
        for (i, bank) in banks.iter().enumerate() {
            if bank.configured && (bank.value ^ value) == 0 {
                matched = Some(i);
                break;
            }
            if !bank.configured && unconfigured.is_none() {
                unconfigured = Some(i);
            } else if bank.refs == 0 && zero_ref.is_none() {
                zero_ref = Some(i);
            }
        }

        let id = match matched.or(unconfigured).or(zero_ref) {
            Some(id) => id,
            None => {
                log::error!("no TX bank left for config {:#x}", value);
                return Err(FluxError::BankUnavailable);
            }
        };

        let bank = &mut banks[id];
        if matched.is_none() {
            log::info!("programming TX bank {} with {:#x}", id, value);
            bank.configured = true;
            bank.value = value;
        }
        bank.refs += 1;
        Ok(id as u8)
    }

    pub fn put(&self, id: u8) {
        let Ok(mut banks) = self.banks.lock() else {
            return;
        };
        match banks.get_mut(id as usize) {
            Some(bank) if bank.refs > 0 => bank.refs -= 1,
            _ => log::warn!("put on unreferenced TX bank {}", id),
        }
    }

    /// Moves a vdev from its current bank to one matching `config`.
    pub fn update(&self, old: u8, config: &BankConfig) -> Result<u8, FluxError> {
        self.put(old);
        self.get(config)
    }

    pub fn refs(&self, id: u8) -> u32 {
        self.banks
            .lock()
            .ok()
            .and_then(|b| b.get(id as usize).map(|b| b.refs))
            .unwrap_or(0)
    }

    /// Register word currently programmed into bank `id`.
    pub fn value(&self, id: u8) -> Option<u32> {
        let banks = self.banks.lock().ok()?;
        banks
            .get(id as usize)
            .filter(|b| b.configured)
            .map(|b| b.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(encap: u8) -> BankConfig {
        BankConfig {
            encap_type: encap,
            ..Default::default()
        }
    }

    #[test]
    fn test_identical_configs_share_bank() {
        let table = BankTable::new(4);
        let a = table.get(&cfg(2)).unwrap();
        let b = table.get(&cfg(2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.refs(a), 2);

        let c = table.get(&cfg(1)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_zero_ref_bank_is_reclaimed() {
        let table = BankTable::new(2);

        // 1. Fill both slots
        let a = table.get(&cfg(0)).unwrap();
        let b = table.get(&cfg(1)).unwrap();
        assert!(matches!(table.get(&cfg(2)), Err(FluxError::BankUnavailable)));

        // 2. Free one; a new config takes it over
        table.put(a);
        let c = table.get(&cfg(2)).unwrap();
        assert_eq!(c, a);
        assert_eq!(table.value(c), Some(cfg(2).encode()));
        assert_eq!(table.refs(b), 1);
    }

    #[test]
    fn test_unconfigured_preferred_over_zero_ref() {
        let table = BankTable::new(3);
        let a = table.get(&cfg(0)).unwrap();
        table.put(a);

        // Bank 0 has no users but slot 1 was never programmed
        let b = table.get(&cfg(1)).unwrap();
        assert_eq!(b, 1);
        // The old configuration is still cached in bank 0
        assert_eq!(table.get(&cfg(0)).unwrap(), a);
    }

    #[test]
    fn test_update_moves_reference() {
        let table = BankTable::new(4);
        let a = table.get(&cfg(0)).unwrap();
        let b = table.update(a, &cfg(3)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.refs(a), 0);
        assert_eq!(table.refs(b), 1);
    }

    #[test]
    fn test_encode_distinguishes_fields() {
        let base = BankConfig::default();
        let mut other = base;
        other.dscp_tid_map_id = 5;
        assert_ne!(base.encode(), other.encode());
        other = base;
        other.vdev_id_check_en = true;
        assert_ne!(base.encode(), other.encode());
    }
}
