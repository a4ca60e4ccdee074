use anyhow::{Context, Result};
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

// Lifecycle metrics
pub static VM_TRANSITIONS: OnceLock<CounterVec> = OnceLock::new(); // labels: from_state, to_state
pub static VM_FAILURES: OnceLock<CounterVec> = OnceLock::new(); // labels: cause
pub static DRIVER_CALL_DURATION: OnceLock<HistogramVec> = OnceLock::new(); // labels: operation

// Admission metrics
pub static ADMISSION_DECISIONS: OnceLock<CounterVec> = OnceLock::new(); // labels: outcome

// Authorization metrics
pub static AUTHZ_DECISIONS: OnceLock<CounterVec> = OnceLock::new(); // labels: permission, outcome

// Control channel metrics
pub static CHANNEL_MESSAGES: OnceLock<CounterVec> = OnceLock::new(); // labels: direction, type
pub static CHANNEL_DUPLICATES: OnceLock<CounterVec> = OnceLock::new(); // labels: type
pub static AGENTS_ONLINE: OnceLock<Gauge> = OnceLock::new();

// Reconciler metrics
pub static RECONCILER_DISPATCHES: OnceLock<CounterVec> = OnceLock::new(); // labels: action, disposition

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Times one hypervisor driver call.
pub struct DriverTimer {
    start: Instant,
    operation: &'static str,
}

impl DriverTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn finish(self) {
        if let Some(histogram) = DRIVER_CALL_DURATION.get() {
            histogram
                .with_label_values(&[self.operation])
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}

pub fn record_transition(from: &str, to: &str) {
    if let Some(counter) = VM_TRANSITIONS.get() {
        counter.with_label_values(&[from, to]).inc();
    }
}

pub fn record_failure(cause: &str) {
    if let Some(counter) = VM_FAILURES.get() {
        counter.with_label_values(&[cause]).inc();
    }
}

pub fn record_admission(outcome: &str) {
    if let Some(counter) = ADMISSION_DECISIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_authz(permission: &str, allowed: bool) {
    if let Some(counter) = AUTHZ_DECISIONS.get() {
        let outcome = if allowed { "allowed" } else { "denied" };
        counter.with_label_values(&[permission, outcome]).inc();
    }
}

pub fn record_message(direction: &str, kind: &str) {
    if let Some(counter) = CHANNEL_MESSAGES.get() {
        counter.with_label_values(&[direction, kind]).inc();
    }
}

pub fn record_duplicate(kind: &str) {
    if let Some(counter) = CHANNEL_DUPLICATES.get() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn record_dispatch(action: &str, disposition: &str) {
    if let Some(counter) = RECONCILER_DISPATCHES.get() {
        counter.with_label_values(&[action, disposition]).inc();
    }
}

pub fn set_agents_online(count: usize) {
    if let Some(gauge) = AGENTS_ONLINE.get() {
        #[allow(clippy::cast_precision_loss, reason = "agent counts are small")]
        gauge.set(count as f64);
    }
}

pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {e}")),
    }
}

fn init_metrics_internal() -> Result<()> {
    if VM_TRANSITIONS.get().is_some() {
        return Ok(());
    }

    let vm_transitions = register_counter_vec!(
        "microvm_vm_transitions_total",
        "Total VM lifecycle state transitions",
        &["from_state", "to_state"]
    )
    .context("Failed to register VM_TRANSITIONS metric")?;

    let vm_failures = register_counter_vec!(
        "microvm_vm_failures_total",
        "VMs that entered the failed state",
        &["cause"]
    )
    .context("Failed to register VM_FAILURES metric")?;

    let driver_call_duration = register_histogram_vec!(
        "microvm_driver_call_duration_seconds",
        "Hypervisor driver call latency in seconds",
        &["operation"]
    )
    .context("Failed to register DRIVER_CALL_DURATION metric")?;

    let admission_decisions = register_counter_vec!(
        "microvm_admission_decisions_total",
        "Host admission control decisions",
        &["outcome"]
    )
    .context("Failed to register ADMISSION_DECISIONS metric")?;

    let authz_decisions = register_counter_vec!(
        "microvm_authz_decisions_total",
        "Permission oracle decisions",
        &["permission", "outcome"]
    )
    .context("Failed to register AUTHZ_DECISIONS metric")?;

    let channel_messages = register_counter_vec!(
        "microvm_channel_messages_total",
        "Control channel messages",
        &["direction", "type"]
    )
    .context("Failed to register CHANNEL_MESSAGES metric")?;

    let channel_duplicates = register_counter_vec!(
        "microvm_channel_duplicates_total",
        "Inbound control messages discarded as duplicates",
        &["type"]
    )
    .context("Failed to register CHANNEL_DUPLICATES metric")?;

    let agents_online = register_gauge!("microvm_agents_online", "Agents currently online")
        .context("Failed to register AGENTS_ONLINE metric")?;

    let reconciler_dispatches = register_counter_vec!(
        "microvm_reconciler_dispatches_total",
        "Commands produced by the reconciler",
        &["action", "disposition"]
    )
    .context("Failed to register RECONCILER_DISPATCHES metric")?;

    VM_TRANSITIONS
        .set(vm_transitions)
        .map_err(|_| anyhow::anyhow!("Failed to set VM_TRANSITIONS"))?;
    VM_FAILURES
        .set(vm_failures)
        .map_err(|_| anyhow::anyhow!("Failed to set VM_FAILURES"))?;
    DRIVER_CALL_DURATION
        .set(driver_call_duration)
        .map_err(|_| anyhow::anyhow!("Failed to set DRIVER_CALL_DURATION"))?;
    ADMISSION_DECISIONS
        .set(admission_decisions)
        .map_err(|_| anyhow::anyhow!("Failed to set ADMISSION_DECISIONS"))?;
    AUTHZ_DECISIONS
        .set(authz_decisions)
        .map_err(|_| anyhow::anyhow!("Failed to set AUTHZ_DECISIONS"))?;
    CHANNEL_MESSAGES
        .set(channel_messages)
        .map_err(|_| anyhow::anyhow!("Failed to set CHANNEL_MESSAGES"))?;
    CHANNEL_DUPLICATES
        .set(channel_duplicates)
        .map_err(|_| anyhow::anyhow!("Failed to set CHANNEL_DUPLICATES"))?;
    AGENTS_ONLINE
        .set(agents_online)
        .map_err(|_| anyhow::anyhow!("Failed to set AGENTS_ONLINE"))?;
    RECONCILER_DISPATCHES
        .set(reconciler_dispatches)
        .map_err(|_| anyhow::anyhow!("Failed to set RECONCILER_DISPATCHES"))?;

    if let Some(gauge) = AGENTS_ONLINE.get() {
        gauge.set(0.0);
    }

    Ok(())
}

/// Serve the Prometheus text format on `0.0.0.0:<port>`.
pub async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    init_metrics().context("Failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    tracing::info!("Metrics server listening on http://0.0.0.0:{}", port);

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                tokio::spawn(async move {
                    let body = get_metrics();
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    if let Err(e) = stream.write_all(resp.as_bytes()).await {
                        tracing::error!("Metrics write error: {:?}", e);
                    }
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        record_transition("created", "starting");
        record_duplicate("state_update");

        let text = get_metrics();
        assert!(text.contains("microvm_vm_transitions_total"));
        assert!(text.contains("microvm_channel_duplicates_total"));
    }
}
