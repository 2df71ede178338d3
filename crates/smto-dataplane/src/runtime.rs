//! Offload Runtime
//!
//! Owns the control block and the threads serving one port: a worker per
//! receive queue, the flow-rule engine threads and the deferred aging
//! thread. All loops poll the context's running flag; `stop` clears it and
//! joins them.

use crate::aging::{self, AgedEventHandler};
use crate::config::OffloadConfig;
use crate::context::OffloadContext;
use crate::engine;
use crate::error::SetupError;
use crate::hw::{FlowDevice, NicPort, PortId};
use crate::stats::StatsSnapshot;
use crate::worker::{self, WorkerParams};
use crossbeam::channel::Receiver;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

pub struct SmartOffload {
    ctx: Arc<OffloadContext>,
    threads: Vec<thread::JoinHandle<()>>,
    started: bool,
}

impl SmartOffload {
    pub fn new(
        config: OffloadConfig,
        nic: Arc<dyn NicPort>,
        device: Arc<dyn FlowDevice>,
    ) -> Result<Self, SetupError> {
        Ok(Self {
            ctx: Arc::new(OffloadContext::new(config, nic, device)?),
            threads: Vec::new(),
            started: false,
        })
    }

    /// Install default rules, register the aged event and spawn all threads.
    ///
    /// On failure everything set up so far is torn down again.
    pub fn start(&mut self) -> Result<(), SetupError> {
        if self.started {
            return Err(SetupError::AlreadyRunning);
        }
        let ctx = &self.ctx;
        let port = ctx.port_id();
        ctx.config.validate()?;

        engine::install_default_rules(ctx)?;

        let (handler, events) = AgedEventHandler::channel();
        if let Err(e) = ctx.device.register_aged_callback(port, handler.into_callback()) {
            self.flush_rules();
            return Err(SetupError::EventRegister(e));
        }

        ctx.set_running(true);
        self.started = true;
        if let Err(e) = self.spawn_all(events) {
            error!(port, error = %e, "startup failed, unwinding");
            self.stop();
            return Err(e);
        }

        info!(
            port,
            rx_queues = self.ctx.config.rx_queues,
            engine_threads = self.ctx.config.engine_threads,
            "smart offload started"
        );
        Ok(())
    }

    fn spawn_all(&mut self, events: Receiver<PortId>) -> Result<(), SetupError> {
        let port = self.ctx.port_id();

        for queue in 0..self.ctx.config.rx_queues {
            let ctx = Arc::clone(&self.ctx);
            let params = WorkerParams { port_id: port, queue_id: queue };
            self.spawn(format!("smto-worker-{queue}"), move || {
                worker::process_loop(&ctx, params)
            })?;
        }

        for i in 0..self.ctx.config.engine_threads {
            let ctx = Arc::clone(&self.ctx);
            let params = WorkerParams { port_id: port, queue_id: 0 };
            self.spawn(format!("smto-engine-{i}"), move || {
                engine::create_flow_loop(&ctx, params)
            })?;
        }

        let ctx = Arc::clone(&self.ctx);
        self.spawn("smto-aging".to_string(), move || aging::aging_loop(&ctx, events))
    }

    fn spawn<F>(&mut self, name: String, f: F) -> Result<(), SetupError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(f)
            .map_err(|e| SetupError::SpawnFailed(e.to_string()))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Stop all threads, evict every tracked flow and clear the device
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        let ctx = &self.ctx;
        let port = ctx.port_id();

        ctx.set_running(false);
        ctx.device.unregister_aged_callback(port);
        let panicked = join_threads(self.threads.drain(..));
        if panicked > 0 {
            error!(port, panicked, "threads panicked before shutdown");
        }

        while ctx.handoff.pop().is_some() {}
        let drained = ctx.table.drain();
        for nat_port in drained.iter().filter_map(|e| e.nat_port()) {
            ctx.port_pool.release(nat_port);
        }
        info!(port, flows = drained.len(), "flow table drained");

        self.flush_rules();

        match ctx.latency.summary() {
            Some(s) => info!(port, summary = %s, "flow install latency"),
            None => info!(port, "no flows were offloaded"),
        }
        info!(port, "smart offload stopped");
    }

    fn flush_rules(&self) {
        if let Err(e) = self.ctx.device.flush(self.ctx.port_id()) {
            error!(port = self.ctx.port_id(), error = %e, "failed to flush flow rules");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    pub fn context(&self) -> &Arc<OffloadContext> {
        &self.ctx
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }
}

/// Join every thread, logging each one that panicked. Returns the panic count.
fn join_threads(threads: impl Iterator<Item = thread::JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for handle in threads {
        let name = handle.thread().name().unwrap_or("unnamed").to_string();
        if let Err(e) = handle.join() {
            let reason = e
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| e.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(thread = %name, reason = %reason, "thread panicked");
            panicked += 1;
        }
    }
    panicked
}

impl Drop for SmartOffload {
    fn drop(&mut self) {
        self.stop();
    }
}
