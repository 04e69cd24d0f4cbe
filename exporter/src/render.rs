//! Prometheus text exposition.

use std::fmt::Write;

use crate::metrics::{Metric, MetricsByCounter};

/// Render one scrape's metrics. Label order is fixed: the identity block,
/// then collector labels, then attribution attributes.
pub fn render(metrics: &MetricsByCounter) -> String {
    let mut out = String::new();
    for (counter, list) in metrics.iter() {
        let renderable: Vec<&Metric> = list.iter().filter(|m| m.should_render()).collect();
        if renderable.is_empty() {
            continue;
        }
        let _ = writeln!(
            out,
            "# HELP {} {}",
            counter.field_name,
            escape_help(&counter.help)
        );
        let _ = writeln!(out, "# TYPE {} {}", counter.field_name, counter.prom_type.as_str());
        for metric in renderable {
            render_metric(&mut out, metric);
        }
    }
    out
}

fn render_metric(out: &mut String, metric: &Metric) {
    out.push_str(&metric.counter.field_name);
    out.push('{');
    let mut first = true;
    let mut label = |key: &str, value: &str| {
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(value));
        out.push('"');
    };

    label("gpu", &metric.gpu_id);
    label("UUID", &metric.gpu_uuid);
    label("pci_bus_id", &metric.gpu_pci_bus_id);
    label("device", &metric.gpu_device);
    label("modelName", &metric.gpu_model);
    label("Hostname", &metric.hostname);
    if !metric.mig_profile.is_empty() {
        label("GPU_I_PROFILE", &metric.mig_profile);
        label("GPU_I_ID", &metric.gpu_instance_id);
    }
    for (key, value) in &metric.labels {
        label(key, value);
    }
    for (key, value) in &metric.attributes {
        label(key, value);
    }

    out.push_str("} ");
    out.push_str(&metric.value);
    out.push('\n');
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}
