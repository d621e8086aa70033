use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmemLayout {
    pub frame_size: u32,
    pub frame_count: u32,
}

impl UmemLayout {
    pub fn new(frame_size: u32, frame_count: u32) -> Result<Self, CoreError> {
        if !frame_size.is_power_of_two() {
            return Err(CoreError::InvalidLayout(format!(
                "frame size {} must be a power of 2",
                frame_size
            )));
        }
        if frame_size < 2048 {
            return Err(CoreError::InvalidLayout(format!(
                "frame size {} must be at least 2048",
                frame_size
            )));
        }
        if frame_count == 0 {
            return Err(CoreError::InvalidLayout("frame count is zero".to_string()));
        }

        Ok(Self {
            frame_size,
            frame_count,
        })
    }

    pub fn size(&self) -> usize {
        (self.frame_size as usize) * (self.frame_count as usize)
    }

    #[inline]
    pub fn addr_to_idx(&self, addr: u64) -> Option<u32> {
        if addr >= (self.size() as u64) {
            return None;
        }
        Some((addr / self.frame_size as u64) as u32)
    }

    #[inline]
    pub fn idx_to_addr(&self, idx: u32) -> Option<u64> {
        if idx >= self.frame_count {
            return None;
        }
        Some((idx as u64) * (self.frame_size as u64))
    }

    /// Rounds an address inside a frame down to the frame start.
    #[inline]
    pub fn frame_base(&self, addr: u64) -> Option<u64> {
        self.addr_to_idx(addr).and_then(|idx| self.idx_to_addr(idx))
    }
}
