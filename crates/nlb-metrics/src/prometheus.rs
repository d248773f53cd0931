//! Prometheus text exposition format.
//!
//! Renders counters, registry pool gauges, bucket gauges and blue/green
//! splits for scraping by a Prometheus server or compatible agent.

use crate::collector::MetricsReport;
use nlb_ratelimit::BucketStats;
use nlb_rollout::DeploymentState;
use nlb_router::ProtocolStats;
use std::fmt::Write;

/// Everything one scrape renders.
pub struct Exposition<'a> {
    pub report: &'a MetricsReport,
    pub pools: &'a [ProtocolStats],
    pub buckets: &'a [BucketStats],
    pub deployments: &'a [DeploymentState],
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render one scrape in Prometheus text format.
pub fn render_prometheus(x: &Exposition<'_>) -> String {
    let mut out = String::new();
    let r = x.report;

    header(
        &mut out,
        "nlb_connections_accepted_total",
        "counter",
        "Connections accepted by the listener.",
    );
    let _ = writeln!(out, "nlb_connections_accepted_total {}", r.connections_accepted);

    header(
        &mut out,
        "nlb_classification_failures_total",
        "counter",
        "Connections dropped before a protocol was identified.",
    );
    let _ = writeln!(
        out,
        "nlb_classification_failures_total{{reason=\"unknown\"}} {}",
        r.classification_unknown
    );
    let _ = writeln!(
        out,
        "nlb_classification_failures_total{{reason=\"timeout\"}} {}",
        r.classification_timeouts
    );

    header(
        &mut out,
        "nlb_connections_routed_total",
        "counter",
        "Connections routed to a module instance.",
    );
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_connections_routed_total{{protocol=\"{}\"}} {}",
            c.protocol, c.routed
        );
    }

    header(
        &mut out,
        "nlb_routing_errors_total",
        "counter",
        "Connections with no backend available.",
    );
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_routing_errors_total{{protocol=\"{}\"}} {}",
            c.protocol, c.routing_errors
        );
    }

    header(
        &mut out,
        "nlb_rate_limit_decisions_total",
        "counter",
        "Rate limiter decisions on the data path.",
    );
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_rate_limit_decisions_total{{protocol=\"{}\",decision=\"allowed\"}} {}",
            c.protocol, c.rate_limit_allowed
        );
        let _ = writeln!(
            out,
            "nlb_rate_limit_decisions_total{{protocol=\"{}\",decision=\"denied\"}} {}",
            c.protocol, c.rate_limit_denied
        );
    }

    header(&mut out, "nlb_bytes_total", "counter", "Bytes proxied, by direction.");
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_bytes_total{{protocol=\"{}\",direction=\"upstream\"}} {}",
            c.protocol, c.bytes_to_upstream
        );
        let _ = writeln!(
            out,
            "nlb_bytes_total{{protocol=\"{}\",direction=\"client\"}} {}",
            c.protocol, c.bytes_to_client
        );
    }

    header(&mut out, "nlb_scaling_directives_total", "counter", "Scale directives issued.");
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_scaling_directives_total{{protocol=\"{}\",direction=\"up\"}} {}",
            c.protocol, c.scale_ups
        );
        let _ = writeln!(
            out,
            "nlb_scaling_directives_total{{protocol=\"{}\",direction=\"down\"}} {}",
            c.protocol, c.scale_downs
        );
    }

    header(
        &mut out,
        "nlb_deployment_transitions_total",
        "counter",
        "Blue/green weight transitions.",
    );
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_deployment_transitions_total{{protocol=\"{}\"}} {}",
            c.protocol, c.deployment_transitions
        );
    }

    header(&mut out, "nlb_deployment_rollbacks_total", "counter", "Blue/green rollbacks.");
    for c in &r.protocols {
        let _ = writeln!(
            out,
            "nlb_deployment_rollbacks_total{{protocol=\"{}\"}} {}",
            c.protocol, c.rollbacks
        );
    }

    header(&mut out, "nlb_modules", "gauge", "Registered module instances by state.");
    for p in x.pools {
        for (state, n) in [
            ("healthy", p.healthy_modules),
            ("degraded", p.degraded_modules),
            ("unhealthy", p.unhealthy_modules),
            ("draining", p.draining_modules),
        ] {
            let _ = writeln!(
                out,
                "nlb_modules{{protocol=\"{}\",state=\"{state}\"}} {n}",
                p.protocol
            );
        }
    }

    header(
        &mut out,
        "nlb_active_connections",
        "gauge",
        "Connections currently open to module instances.",
    );
    for p in x.pools {
        let _ = writeln!(
            out,
            "nlb_active_connections{{protocol=\"{}\"}} {}",
            p.protocol, p.active_connections
        );
    }

    header(&mut out, "nlb_rate_limit_tokens", "gauge", "Tokens currently available per bucket.");
    for b in x.buckets {
        let _ = writeln!(
            out,
            "nlb_rate_limit_tokens{{key=\"{}\"}} {:.2}",
            escape(&b.key),
            b.tokens
        );
    }

    header(
        &mut out,
        "nlb_rate_limit_utilization",
        "gauge",
        "Fraction of bucket capacity spent (0.0-1.0).",
    );
    for b in x.buckets {
        let _ = writeln!(
            out,
            "nlb_rate_limit_utilization{{key=\"{}\"}} {:.4}",
            escape(&b.key),
            b.utilization
        );
    }

    header(
        &mut out,
        "nlb_bluegreen_traffic_split",
        "gauge",
        "Traffic percentage per blue/green color.",
    );
    for d in x.deployments {
        let _ = writeln!(
            out,
            "nlb_bluegreen_traffic_split{{protocol=\"{}\",color=\"blue\",version=\"{}\"}} {}",
            d.protocol,
            escape(&d.blue_version),
            d.blue_weight
        );
        let _ = writeln!(
            out,
            "nlb_bluegreen_traffic_split{{protocol=\"{}\",color=\"green\",version=\"{}\"}} {}",
            d.protocol,
            escape(&d.green_version),
            d.green_weight
        );
    }

    out
}

/// Escape a label value.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
