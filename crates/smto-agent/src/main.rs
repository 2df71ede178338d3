//! SMTO Agent - Main Entry Point
//!
//! Runs the offload dataplane on a simulated port and replays synthetic
//! TCP and UDP traffic through it, then ages every offloaded flow out.

use smto_dataplane::key::{FlowTuple, IPPROTO_TCP, IPPROTO_UDP};
use smto_dataplane::packet::ipv4_checksum;
use smto_dataplane::sim::{SimFlowDevice, SimNic};
use smto_dataplane::{OffloadConfig, SmartOffload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Distinct flows replayed per protocol
const FLOWS: u32 = 64;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("SMTO Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::var("SMTO_CONFIG") {
        Ok(path) => OffloadConfig::load(&path).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "config not loaded, using defaults");
            OffloadConfig::default()
        }),
        Err(_) => OffloadConfig::default(),
    };
    let port = config.port_id;
    let rx_queues = config.rx_queues;
    // both directions alternate, so each side crosses the threshold
    let rounds = config.offload_threshold.saturating_mul(2).saturating_add(2).min(128);

    // rx queues plus the hairpin queue
    let nic = Arc::new(SimNic::new(port, rx_queues + 1));
    let device = Arc::new(SimFlowDevice::new(port));
    let mut offload = SmartOffload::new(config, nic.clone(), device.clone())?;
    offload.start()?;

    let mut injected = 0u64;
    for round in 0..rounds {
        for i in 0..FLOWS {
            let tcp = FlowTuple::new(IPPROTO_TCP, 0xC0A8_0000 | i, 0x0A0A_0A0A, 40000 + i as u16, 443);
            let udp = FlowTuple::new(IPPROTO_UDP, 0xC0A8_0100 | i, 0x0808_0808, 50000 + i as u16, 53);
            for t in [tcp, udp] {
                // odd rounds carry the reply direction
                let t = if round % 2 == 1 { t.reverse() } else { t };
                let queue = (t.hash_value() % rx_queues as u64) as u16;
                nic.inject(queue, &frame(&t, 64));
                injected += 1;
            }
        }
    }
    tracing::info!(injected, "synthetic traffic queued");

    let deadline = Instant::now() + Duration::from_secs(5);
    while (0..rx_queues).any(|q| nic.pending_rx(q) > 0) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(100));

    let aged = device.age_all();
    tracing::info!(aged, "aged all offloaded rules");
    let ctx = offload.context().clone();
    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.stats.snapshot().flows_evicted < aged as u64 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    offload.stop();
    let stats = offload.stats();
    tracing::info!(hit_rate = stats.flow_hit_rate(), "run finished");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Ethernet + IPv4 + L4 header with `payload` bytes; L4 checksum left zero
fn frame(t: &FlowTuple, payload: usize) -> Vec<u8> {
    let l4_len = if t.protocol == IPPROTO_TCP { 20 } else { 8 };
    let total = 20 + l4_len + payload;
    let mut p = vec![0u8; 14 + total];
    p[12] = 0x08;
    let ip = &mut p[14..];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = t.protocol;
    ip[12..16].copy_from_slice(&t.addr1.to_be_bytes());
    ip[16..20].copy_from_slice(&t.addr2.to_be_bytes());
    let csum = ipv4_checksum(&ip[..20]);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());
    ip[20..22].copy_from_slice(&t.port1.to_be_bytes());
    ip[22..24].copy_from_slice(&t.port2.to_be_bytes());
    if t.protocol == IPPROTO_TCP {
        ip[32] = 0x50;
    } else {
        ip[24..26].copy_from_slice(&((l4_len + payload) as u16).to_be_bytes());
    }
    p
}
