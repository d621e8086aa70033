//! Per-buffer metadata the device writes at the head of every RX buffer.

/// Bytes reserved at the start of each RX buffer for the TLV area.
pub const RX_TLV_SIZE: usize = 128;

const FLAG_MSDU_DONE: u8 = 1 << 0;
const FLAG_DA_VALID: u8 = 1 << 1;
const FLAG_SA_VALID: u8 = 1 << 2;
const FLAG_DA_MCBC: u8 = 1 << 3;
const FLAG_INTRA_BSS: u8 = 1 << 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxTlv {
    /// DMA of this buffer has finished.
    pub msdu_done: bool,
    pub da_valid: bool,
    pub sa_valid: bool,
    pub da_is_mcbc: bool,
    /// Device suggests the destination is a station on the same BSS.
    pub intra_bss: bool,
    /// Padding inserted before the L3 header.
    pub l3_pad: u8,
    pub dest_chip: u8,
    /// Peer index of the destination address, meaningful when `da_valid`.
    pub da_peer: u16,
}

impl RxTlv {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RX_TLV_SIZE {
            return None;
        }
        let flags = buf[0];
        Some(Self {
            msdu_done: flags & FLAG_MSDU_DONE != 0,
            da_valid: flags & FLAG_DA_VALID != 0,
            sa_valid: flags & FLAG_SA_VALID != 0,
            da_is_mcbc: flags & FLAG_DA_MCBC != 0,
            intra_bss: flags & FLAG_INTRA_BSS != 0,
            l3_pad: buf[1],
            dest_chip: buf[2],
            da_peer: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> bool {
        if buf.len() < RX_TLV_SIZE {
            return false;
        }
        let mut flags = 0;
        if self.msdu_done {
            flags |= FLAG_MSDU_DONE;
        }
        if self.da_valid {
            flags |= FLAG_DA_VALID;
        }
        if self.sa_valid {
            flags |= FLAG_SA_VALID;
        }
        if self.da_is_mcbc {
            flags |= FLAG_DA_MCBC;
        }
        if self.intra_bss {
            flags |= FLAG_INTRA_BSS;
        }
        buf[..RX_TLV_SIZE].fill(0);
        buf[0] = flags;
        buf[1] = self.l3_pad;
        buf[2] = self.dest_chip;
        buf[4..6].copy_from_slice(&self.da_peer.to_le_bytes());
        true
    }
}
