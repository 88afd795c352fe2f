//! Observability utilities: GPU/system metrics plus the scheduler-side
//! gauges and counters the engine updates every tick.

use once_cell::sync::Lazy;
use prometheus::{Gauge, IntCounter, IntGauge};

static GPU_UTIL: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("runner_gpu_utilization", "GPU utilization percent").unwrap());
static GPU_MEM_USED: Lazy<IntGauge> = Lazy::new(|| prometheus::register_int_gauge!("runner_gpu_memory_bytes", "GPU memory used (bytes)").unwrap());
static GPU_TEMP: Lazy<Gauge> = Lazy::new(|| prometheus::register_gauge!("runner_gpu_temperature_celsius", "GPU temperature in C").unwrap());

pub static KV_BLOCKS_FREE: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("runner_kv_blocks_free", "Free KV cache blocks").unwrap());
pub static KV_BLOCKS_USED: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("runner_kv_blocks_used", "Occupied KV cache blocks").unwrap());
pub static SCHEDULER_QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("runner_scheduler_queue_depth", "Sequences waiting for admission").unwrap());
pub static LAST_BATCH_SIZE: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("runner_last_batch_size", "Sequences admitted in the most recent tick").unwrap());
pub static PREEMPTIONS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| prometheus::register_int_counter!("runner_preemptions_total", "Running sequences preempted for lack of blocks").unwrap());
pub static SPECULATIVE_ACCEPTED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| prometheus::register_int_counter!("runner_speculative_accepted_total", "Draft tokens accepted by the target model").unwrap());
pub static SPECULATIVE_REJECTED_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| prometheus::register_int_counter!("runner_speculative_rejected_total", "Draft tokens rejected by the target model").unwrap());
pub static ENGINE_DEGRADED: Lazy<IntGauge> =
    Lazy::new(|| prometheus::register_int_gauge!("runner_engine_degraded", "1 once a second consecutive tick failure has drained the scheduler").unwrap());

pub fn init() {
    // Touch statics to ensure registration and avoid dead_code warnings when NVML is disabled.
    let _ = &*GPU_UTIL;
    let _ = &*GPU_MEM_USED;
    let _ = &*GPU_TEMP;
    let _ = &*KV_BLOCKS_FREE;
    let _ = &*KV_BLOCKS_USED;
    let _ = &*SCHEDULER_QUEUE_DEPTH;
    let _ = &*LAST_BATCH_SIZE;
    let _ = &*PREEMPTIONS_TOTAL;
    let _ = &*SPECULATIVE_ACCEPTED_TOTAL;
    let _ = &*SPECULATIVE_REJECTED_TOTAL;
    let _ = &*ENGINE_DEGRADED;
}

/// Records one tick's scheduler-side observables. Called by the API's
/// scheduler-driving loop, not by `runner-core` itself, so `runner-core`
/// stays free of an observability dependency.
pub fn record_tick(kv_free: i64, kv_used: i64, queue_depth: i64, batch_size: i64, preempted: usize) {
    KV_BLOCKS_FREE.set(kv_free);
    KV_BLOCKS_USED.set(kv_used);
    SCHEDULER_QUEUE_DEPTH.set(queue_depth);
    LAST_BATCH_SIZE.set(batch_size);
    PREEMPTIONS_TOTAL.inc_by(preempted as u64);
}

/// Records one speculative tick's accept/reject counts.
pub fn record_speculative(accepted: usize, rejected: usize) {
    SPECULATIVE_ACCEPTED_TOTAL.inc_by(accepted as u64);
    SPECULATIVE_REJECTED_TOTAL.inc_by(rejected as u64);
}

/// Flips `runner_engine_degraded` once the scheduler has drained itself
/// after a second consecutive recoverable tick failure (§7).
pub fn record_degraded(degraded: bool) {
    ENGINE_DEGRADED.set(if degraded { 1 } else { 0 });
}

pub fn spawn_gpu_polling() {
    #[cfg(feature = "nvidia")]
    tokio::spawn(async move {
        let nvml = match nvml_wrapper::NVML::init() { Ok(n) => n, Err(_) => return };
        let device = match nvml.device_by_index(0) { Ok(d) => d, Err(_) => return };
        loop {
            if let Ok(util) = device.utilization_rates() { GPU_UTIL.set(util.gpu as f64); }
            if let Ok(mem) = device.memory_info() { GPU_MEM_USED.set(mem.used as i64); }
            if let Ok(temp) = device.temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu) { GPU_TEMP.set(temp as f64); }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });
}

