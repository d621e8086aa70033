use std::io;
use thiserror::Error;

use crate::cookie::Cookie;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Descriptor pool {0} exhausted")]
    Exhausted(String),

    #[error("Cookie {0:?} does not map to any descriptor")]
    InvalidCookie(Cookie),

    #[error("Cookie {0:?} refers to a descriptor that is not in use")]
    StaleCookie(Cookie),

    #[error("Descriptor released twice (cookie {0:?})")]
    DoubleRelease(Cookie),

    #[error("DMA mapping failed for buffer at {0:#x}")]
    DmaMap(u64),

    #[error("Ring is full")]
    RingFull,

    #[error("Ring access failed: {0}")]
    RingAccess(&'static str),

    #[error("Page table exhausted ({0} pages requested)")]
    PageTableFull(u32),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}
