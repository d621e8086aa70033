//! Outstanding-descriptor accounting for TX admission.

use crate::error::FluxError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Flow-control transition caused by an acquire or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Unchanged,
    Pause,
    Resume,
}

/// Per-vdev side of the accounting.
#[derive(Debug, Default)]
pub struct VdevCounter {
    outstanding: AtomicU32,
    paused: AtomicBool,
}

impl VdevCounter {
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

pub struct Admission {
    outstanding: AtomicU32,
    limit: u32,
    vdev_limit: u32,
    allowance: u32,
    resume_at: u32,
}

fn try_add(counter: &AtomicU32, n: u32, ceiling: u32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let next = cur.checked_add(n)?;
            (next <= ceiling).then_some(next)
        })
        .is_ok()
}

fn sub(counter: &AtomicU32, n: u32) -> u32 {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        Some(cur.saturating_sub(n))
    }) {
        Ok(prev) | Err(prev) => prev.saturating_sub(n),
    }
}

impl Admission {
    pub fn new(limit: u32, vdev_limit: u32, allowance: u32, resume_pct: u32) -> Self {
        Self {
            outstanding: AtomicU32::new(0),
            limit,
            vdev_limit,
            allowance,
            resume_at: (vdev_limit as u64 * resume_pct as u64 / 100) as u32,
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Accounts `n` new descriptors against both ceilings.
    ///
    /// Control-plane frames may dip into the allowance above the ceilings.
    pub fn acquire(&self, vdev: &VdevCounter, n: u32, special: bool) -> Result<Flow, FluxError> {
        let extra = if special { self.allowance } else { 0 };
        if !try_add(&self.outstanding, n, self.limit + extra) {
            return Err(FluxError::AdmissionDenied);
        }
        if !try_add(&vdev.outstanding, n, self.vdev_limit + extra) {
            sub(&self.outstanding, n);
            return Err(FluxError::AdmissionDenied);
        }

        if vdev.outstanding() >= self.vdev_limit && !vdev.paused.swap(true, Ordering::AcqRel) {
            return Ok(Flow::Pause);
        }
        Ok(Flow::Unchanged)
    }

    /// Gives back `n` descriptors. `vdev` is `None` once the vdev's share was
    /// already dropped by teardown.
    pub fn release(&self, vdev: Option<&VdevCounter>, n: u32) -> Flow {
        sub(&self.outstanding, n);
        let Some(vdev) = vdev else {
            return Flow::Unchanged;
        };
        let left = sub(&vdev.outstanding, n);
        if left < self.resume_at.max(1) && vdev.paused.swap(false, Ordering::AcqRel) {
            return Flow::Resume;
        }
        Flow::Unchanged
    }

    /// Forgets `n` descriptors of a vdev that went away. The global count
    /// keeps them until the device completes them.
    pub fn drop_vdev_share(&self, vdev: &VdevCounter, n: u32) {
        sub(&vdev.outstanding, n);
        vdev.paused.store(false, Ordering::Release);
    }
}
