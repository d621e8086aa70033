use crate::config::Poller;
use crate::context::Datapath;
use crate::error::FluxError;
use crate::rx::{Delivery, RxReaper};
use crate::tx::TxCompletion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives a set of RX and completion rings from one worker context.
pub struct DpEngine<D: Delivery> {
    dp: Arc<Datapath>,
    rx: Vec<RxReaper>,
    comp: Vec<TxCompletion>,
    sink: D,
    poller: Poller,
}

impl<D: Delivery> DpEngine<D> {
    pub fn new(dp: Arc<Datapath>, rx: Vec<RxReaper>, comp: Vec<TxCompletion>, sink: D) -> Self {
        let poller = dp.config().poller;
        Self {
            dp,
            rx,
            comp,
            sink,
            poller,
        }
    }

    pub fn datapath(&self) -> &Arc<Datapath> {
        &self.dp
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut D {
        &mut self.sink
    }

    /// One service pass over every owned ring. Returns the entries handled.
    pub fn service(&mut self) -> Result<usize, FluxError> {
        let cfg = self.dp.config();
        let (rx_quota, comp_quota) = (cfg.rx_quota, cfg.tx_comp_quota);
        let mut work = 0;

        // 1. Completions first: they lift TX backpressure
        for comp in &mut self.comp {
            work += comp.reap(comp_quota)?;
        }

        // 2. Received frames, possibly forwarded back into TX
        for rx in &mut self.rx {
            work += rx.reap(rx_quota, &mut self.sink)?;
        }

        // 3. Anything coalescing held back
        self.dp.flush_tx_doorbells();
        Ok(work)
    }

    /// Services the rings until `stop` is set or the datapath halts.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), FluxError> {
        match self.poller {
            Poller::Busy => loop {
                if stop.load(Ordering::Relaxed) {
                    break Ok(());
                }
                self.service()?;
            },
            Poller::Wait => loop {
                if stop.load(Ordering::Relaxed) {
                    break Ok(());
                }
                if self.service()? == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            },
            Poller::Adaptive => {
                let mut last_work = Instant::now();
                let spin_duration = Duration::from_micros(50);

                loop {
                    if stop.load(Ordering::Relaxed) {
                        break Ok(());
                    }
                    if self.service()? > 0 {
                        last_work = Instant::now();
                    } else if last_work.elapsed() > spin_duration {
                        std::thread::sleep(Duration::from_millis(1));
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }
}
