use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use stagewatch_core::config::{AppConfig, RetryConfig};
use stagewatch_core::traits::{ResyncSource, SnapshotLoader};
use stagewatch_transport::{FileLayoutLoader, HttpLayoutLoader, HttpResyncSource};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print one line per check. Returns the number of failed checks.
pub async fn run_doctor(config: &AppConfig) -> usize {
    let checks = vec![
        check_layout(config).await,
        check_events(config),
        check_resync(config).await,
        check_retry("Transport retry", &config.transport),
        check_retry("Layout retry", &config.layout_retry),
        check_gateway(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

async fn check_layout(config: &AppConfig) -> CheckResult {
    let timeout = Duration::from_secs(config.source.request_timeout_secs);
    let (origin, fetched) = match (&config.source.layout_file, &config.source.layout_url) {
        (Some(path), _) => (
            path.clone(),
            FileLayoutLoader::new(Path::new(path)).fetch_layout().await,
        ),
        (None, Some(url)) => (
            url.clone(),
            HttpLayoutLoader::new(url, timeout).fetch_layout().await,
        ),
        (None, None) => {
            return CheckResult {
                label: "Layout".into(),
                ok: false,
                detail: "No layout_url or layout_file configured".into(),
            }
        }
    };

    match fetched.and_then(|graph| graph.validate().map(|_| graph)) {
        Ok(graph) => CheckResult {
            label: "Layout".into(),
            ok: true,
            detail: format!(
                "{} ({} nodes, {} edges)",
                origin,
                graph.nodes.len(),
                graph.edges.len()
            ),
        },
        Err(e) => CheckResult {
            label: "Layout".into(),
            ok: false,
            detail: format!("{}: {}", origin, e),
        },
    }
}

fn check_events(config: &AppConfig) -> CheckResult {
    match &config.source.events_url {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => CheckResult {
            label: "Events".into(),
            ok: true,
            detail: url.clone(),
        },
        Some(url) => CheckResult {
            label: "Events".into(),
            ok: false,
            detail: format!("{} (not an http(s) URL)", url),
        },
        None => CheckResult {
            label: "Events".into(),
            ok: false,
            detail: "No events_url configured".into(),
        },
    }
}

async fn check_resync(config: &AppConfig) -> CheckResult {
    let Some(url) = &config.source.resync_url else {
        return CheckResult {
            label: "Resync".into(),
            ok: true,
            detail: "Not configured (reconnects show a visibility gap)".into(),
        };
    };
    let source = HttpResyncSource::new(url, Duration::from_secs(config.source.request_timeout_secs));
    match source.fetch_statuses().await {
        Ok(reports) => CheckResult {
            label: "Resync".into(),
            ok: true,
            detail: format!("{} ({} statuses)", url, reports.len()),
        },
        Err(e) => CheckResult {
            label: "Resync".into(),
            ok: false,
            detail: format!("{}: {}", url, e),
        },
    }
}

fn check_retry(label: &str, retry: &RetryConfig) -> CheckResult {
    let ok = retry.initial_backoff_ms > 0 && retry.initial_backoff_ms <= retry.max_backoff_ms;
    let limit = retry
        .max_retries
        .map(|n| format!("{} retries", n))
        .unwrap_or_else(|| "retries forever".into());
    CheckResult {
        label: label.into(),
        ok,
        detail: if ok {
            format!(
                "{}ms doubling to {}ms, {}",
                retry.initial_backoff_ms, retry.max_backoff_ms, limit
            )
        } else {
            format!(
                "initial_backoff_ms ({}) must be positive and <= max_backoff_ms ({})",
                retry.initial_backoff_ms, retry.max_backoff_ms
            )
        },
    }
}

fn check_gateway(config: &AppConfig) -> CheckResult {
    match config.gateway.bind.parse::<SocketAddr>() {
        Ok(addr) => CheckResult {
            label: "Gateway".into(),
            ok: true,
            detail: addr.to_string(),
        },
        Err(e) => CheckResult {
            label: "Gateway".into(),
            ok: false,
            detail: format!("{} ({})", config.gateway.bind, e),
        },
    }
}
