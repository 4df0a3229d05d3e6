//! Fire-and-forget Prometheus-style metrics registry. Every metric is a
//! `OnceLock`-initialized static with a thin accessor function, rendered
//! on demand via `render()`; the core never blocks on a scrape.

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static STALE: OnceLock<IntCounter> = OnceLock::new();
static VARDIFF_RETARGETS: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static STORE_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static STORE_RECONNECTS: OnceLock<IntCounter> = OnceLock::new();
static STORE_ORPHAN_ATTRIBUTIONS: OnceLock<IntCounter> = OnceLock::new();
static CACHE_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static KEEPALIVE_DISCONNECTS: OnceLock<IntCounter> = OnceLock::new();
static PROTOCOL_DETECTED: OnceLock<IntCounterVec> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static CACHE_UP: OnceLock<IntGauge> = OnceLock::new();
static STORE_UP: OnceLock<IntGauge> = OnceLock::new();

static MINER_HASHRATE: OnceLock<IntGaugeVec> = OnceLock::new();
static MINER_SHARES: OnceLock<IntCounterVec> = OnceLock::new();
static MINER_CONNECTIONS: OnceLock<IntGaugeVec> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap())
}

fn stale() -> &'static IntCounter {
    STALE.get_or_init(|| IntCounter::new("shares_stale_total", "Total shares rejected as stale-job").unwrap())
}

fn vardiff_retargets() -> &'static IntCounter {
    VARDIFF_RETARGETS.get_or_init(|| {
        IntCounter::new("vardiff_retargets_total", "Total vardiff difficulty retargets").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| IntCounter::new("job_broadcasts_total", "Total job broadcasts").unwrap())
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| IntCounter::new("coin_rpc_requests_total", "Total coin node RPC calls").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("coin_rpc_errors_total", "Total coin node RPC errors").unwrap())
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES.get_or_init(|| IntCounter::new("template_updates_total", "Total block template updates").unwrap())
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        IntCounter::new("template_fetch_errors_total", "Total template poll errors").unwrap()
    })
}

fn store_errors() -> &'static IntCounter {
    STORE_ERRORS.get_or_init(|| IntCounter::new("store_errors_total", "Total persistent store errors").unwrap())
}

fn store_reconnects() -> &'static IntCounter {
    STORE_RECONNECTS.get_or_init(|| IntCounter::new("store_reconnects_total", "Total store reconnect attempts").unwrap())
}

fn store_orphan_attributions() -> &'static IntCounter {
    STORE_ORPHAN_ATTRIBUTIONS.get_or_init(|| {
        IntCounter::new(
            "store_orphan_attributions_total",
            "Total shares attributed to the orphan miner row after a lookup/insert failure",
        )
        .unwrap()
    })
}

fn cache_errors() -> &'static IntCounter {
    CACHE_ERRORS.get_or_init(|| IntCounter::new("cache_errors_total", "Total fast-cache errors").unwrap())
}

fn keepalive_disconnects() -> &'static IntCounter {
    KEEPALIVE_DISCONNECTS.get_or_init(|| {
        IntCounter::new("keepalive_disconnects_total", "Total connections closed by the keepalive manager").unwrap()
    })
}

fn protocol_detected() -> &'static IntCounterVec {
    PROTOCOL_DETECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("protocol_detected_total", "Connections classified per detected protocol"),
            &["protocol"],
        )
        .unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| IntGauge::new("active_connections", "Current live connections").unwrap())
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| IntGauge::new("template_height", "Current block template height").unwrap())
}

fn cache_up() -> &'static IntGauge {
    CACHE_UP.get_or_init(|| IntGauge::new("cache_up", "1 if the fast KV cache is reachable").unwrap())
}

fn store_up() -> &'static IntGauge {
    STORE_UP.get_or_init(|| IntGauge::new("store_up", "1 if the persistent store is reachable").unwrap())
}

fn miner_hashrate() -> &'static IntGaugeVec {
    MINER_HASHRATE.get_or_init(|| {
        IntGaugeVec::new(Opts::new("miner_hashrate", "Current miner hashrate (H/s)"), &["address"]).unwrap()
    })
}

fn miner_shares() -> &'static IntCounterVec {
    MINER_SHARES.get_or_init(|| {
        IntCounterVec::new(Opts::new("miner_shares_total", "Total shares per miner"), &["address", "status"]).unwrap()
    })
}

fn miner_connections() -> &'static IntGaugeVec {
    MINER_CONNECTIONS.get_or_init(|| {
        IntGaugeVec::new(Opts::new("miner_connections_active", "Active connections per miner"), &["address"]).unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}
pub fn inc_rejected() {
    rejected().inc();
}
pub fn inc_stale() {
    stale().inc();
}
pub fn inc_vardiff_retarget() {
    vardiff_retargets().inc();
}
pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}
pub fn inc_rpc_requests() {
    rpc_requests().inc();
}
pub fn inc_rpc_errors() {
    rpc_errors().inc();
}
pub fn inc_template_updates() {
    template_updates().inc();
}
pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}
pub fn inc_store_errors() {
    store_errors().inc();
}
pub fn inc_store_reconnects() {
    store_reconnects().inc();
}
pub fn inc_store_orphan_attributions() {
    store_orphan_attributions().inc();
}
pub fn inc_cache_errors() {
    cache_errors().inc();
}
pub fn inc_keepalive_disconnects() {
    keepalive_disconnects().inc();
}
pub fn inc_protocol_detected(protocol: &str) {
    protocol_detected().with_label_values(&[protocol]).inc();
}
pub fn inc_connections() {
    active_connections().inc();
}
pub fn dec_connections() {
    active_connections().dec();
}
pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}
pub fn set_cache_up(up: bool) {
    cache_up().set(if up { 1 } else { 0 });
}
pub fn set_store_up(up: bool) {
    store_up().set(if up { 1 } else { 0 });
}
pub fn set_miner_hashrate(address: &str, hashrate: u64) {
    miner_hashrate().with_label_values(&[address]).set(hashrate as i64);
}
pub fn inc_miner_share(address: &str, valid: bool) {
    let status = if valid { "valid" } else { "invalid" };
    miner_shares().with_label_values(&[address, status]).inc();
}
pub fn inc_miner_connections(address: &str) {
    miner_connections().with_label_values(&[address]).inc();
}
pub fn dec_miner_connections(address: &str) {
    miner_connections().with_label_values(&[address]).dec();
}

/// Remove a miner's label set from per-miner vectors (cardinality control
/// for disconnected/long-inactive miners).
pub fn remove_miner(address: &str) {
    let _ = miner_hashrate().remove_label_values(&[address]);
    let _ = miner_connections().remove_label_values(&[address]);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(stale().collect());
    mfs.extend(vardiff_retargets().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(store_errors().collect());
    mfs.extend(store_reconnects().collect());
    mfs.extend(store_orphan_attributions().collect());
    mfs.extend(cache_errors().collect());
    mfs.extend(keepalive_disconnects().collect());
    mfs.extend(protocol_detected().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(template_height().collect());
    mfs.extend(cache_up().collect());
    mfs.extend(store_up().collect());
    mfs.extend(miner_hashrate().collect());
    mfs.extend(miner_shares().collect());
    mfs.extend(miner_connections().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_known_metric_names() {
        inc_accepted();
        let out = render();
        assert!(out.contains("shares_accepted_total"));
    }
}
