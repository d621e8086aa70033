use crate::umem::layout::UmemLayout;
use crossbeam_queue::ArrayQueue;

/// General buffer allocator over a UMEM region.
///
/// Lock-free so packets dropped on any thread can hand their frames back.
pub struct FrameAllocator {
    free_frames: ArrayQueue<u64>,
    layout: UmemLayout,
}

impl FrameAllocator {
    pub fn new(layout: UmemLayout) -> Self {
        let free_frames = ArrayQueue::new(layout.frame_count as usize);
        for i in 0..layout.frame_count {
            if let Some(addr) = layout.idx_to_addr(i) {
                let _ = free_frames.push(addr);
            }
        }

        Self {
            free_frames,
            layout,
        }
    }

    pub fn allocate(&self) -> Option<u64> {
        self.free_frames.pop()
    }

    pub fn release(&self, addr: u64) {
        let Some(base) = self.layout.frame_base(addr) else {
            log::warn!("release of frame {:#x} outside the region ignored", addr);
            return;
        };
        if self.free_frames.push(base).is_err() {
            log::error!("frame {:#x} released twice", base);
        }
    }

    pub fn available(&self) -> usize {
        self.free_frames.len()
    }

    pub fn layout(&self) -> UmemLayout {
        self.layout
    }
}
