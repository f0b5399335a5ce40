//! Display utilities for rendering output

use std::collections::BTreeMap;

use anyhow::Result;
use clap::ValueEnum;
use console::style;
use govnode_rpc::{
    ChainCheck, ChainCheckStatus, EndpointHealthReport, EndpointStatus, PoolStatus,
    RpcMetricsSnapshot,
};
use serde::Serialize;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Output format for rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DisplayFormat {
    /// Text format (tables)
    Text,

    /// JSON format
    Json,

    /// YAML format
    Yaml,
}

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "Endpoint")]
    name: String,
    #[tabled(rename = "Priority")]
    priority: u32,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Errors")]
    errors: u32,
    #[tabled(rename = "Pool")]
    pool: String,
    #[tabled(rename = "Last Used")]
    last_used: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

#[derive(Tabled)]
struct HealthRow {
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Checks")]
    checks: u64,
    #[tabled(rename = "Success Rate")]
    success_rate: String,
    #[tabled(rename = "Avg Latency")]
    latency: String,
    #[tabled(rename = "Last Success")]
    last_success: String,
}

#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Chain ID")]
    chain_id: String,
    #[tabled(rename = "Result")]
    status: String,
}

#[derive(Tabled)]
struct MetricsRow {
    #[tabled(rename = "Metric")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Serialize)]
struct EndpointView<'a> {
    #[serde(flatten)]
    status: &'a EndpointStatus,
    pool: Option<PoolStatus>,
}

/// Renderer for formatting output
pub struct Renderer {
    /// Output format
    format: DisplayFormat,
}

impl Renderer {
    /// Create a new renderer
    pub fn new(format: DisplayFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> DisplayFormat {
        self.format
    }

    /// Render endpoint state together with pool occupancy
    pub fn render_endpoints(
        &self,
        endpoints: &[EndpointStatus],
        pool: &BTreeMap<String, PoolStatus>,
    ) -> Result<()> {
        match self.format {
            DisplayFormat::Text => print_table(endpoint_rows(endpoints, pool)),
            _ => {
                let views: Vec<_> = endpoints
                    .iter()
                    .map(|status| EndpointView {
                        status,
                        pool: pool.get(&status.name).copied(),
                    })
                    .collect();
                self.print_serialized(&views)?;
            }
        }
        Ok(())
    }

    /// Render aggregated probe results
    pub fn render_health(&self, report: &[EndpointHealthReport]) -> Result<()> {
        match self.format {
            DisplayFormat::Text => print_table(health_rows(report)),
            _ => self.print_serialized(&report)?,
        }
        Ok(())
    }

    /// Render chain validation results
    pub fn render_chain_checks(&self, checks: &[ChainCheck]) -> Result<()> {
        match self.format {
            DisplayFormat::Text => {
                let rows = checks
                    .iter()
                    .map(|check| ChainRow {
                        endpoint: check.endpoint.clone(),
                        chain_id: check
                            .chain_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        status: format_chain_status(check),
                    })
                    .collect::<Vec<_>>();
                print_table(rows);
            }
            _ => self.print_serialized(&checks)?,
        }
        Ok(())
    }

    /// Render dispatcher metrics
    pub fn render_metrics(&self, metrics: &RpcMetricsSnapshot) -> Result<()> {
        match self.format {
            DisplayFormat::Text => {
                let mut rows = vec![
                    MetricsRow {
                        name: "Requests".to_string(),
                        value: metrics.total_requests.to_string(),
                    },
                    MetricsRow {
                        name: "Succeeded".to_string(),
                        value: metrics.successful_requests.to_string(),
                    },
                    MetricsRow {
                        name: "Failed".to_string(),
                        value: metrics.failed_requests.to_string(),
                    },
                    MetricsRow {
                        name: "Retries".to_string(),
                        value: metrics.retries.to_string(),
                    },
                    MetricsRow {
                        name: "Rate Limit Hits".to_string(),
                        value: metrics.rate_limit_hits.to_string(),
                    },
                    MetricsRow {
                        name: "Timeouts".to_string(),
                        value: metrics.timeouts.to_string(),
                    },
                    MetricsRow {
                        name: "Avg Response Time (ms)".to_string(),
                        value: format!("{:.2}", metrics.average_response_time_ms),
                    },
                    MetricsRow {
                        name: "Active Provider".to_string(),
                        value: metrics
                            .active_provider
                            .clone()
                            .unwrap_or_else(|| "-".to_string()),
                    },
                ];
                let mut classes: Vec<_> = metrics.errors_by_class.iter().collect();
                classes.sort();
                rows.extend(classes.into_iter().map(|(class, count)| MetricsRow {
                    name: format!("Errors ({})", class),
                    value: count.to_string(),
                }));
                print_table(rows);
            }
            _ => self.print_serialized(metrics)?,
        }
        Ok(())
    }

    /// Render an arbitrary JSON-RPC result
    pub fn render_value(&self, value: &serde_json::Value) -> Result<()> {
        match self.format {
            DisplayFormat::Text | DisplayFormat::Json => {
                println!("{}", serde_json::to_string_pretty(value)?)
            }
            DisplayFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        }
        Ok(())
    }

    fn print_serialized<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        match self.format {
            DisplayFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
            _ => println!("{}", serde_json::to_string_pretty(value)?),
        }
        Ok(())
    }
}

fn print_table<T: Tabled>(rows: Vec<T>) {
    let mut table = Table::new(rows);
    table
        .with(Style::modern())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    println!("{}", table);
}

fn endpoint_rows(
    endpoints: &[EndpointStatus],
    pool: &BTreeMap<String, PoolStatus>,
) -> Vec<EndpointRow> {
    endpoints
        .iter()
        .map(|status| EndpointRow {
            name: status.name.clone(),
            priority: status.priority,
            state: format_state(status),
            errors: status.error_count,
            pool: pool
                .get(&status.name)
                .map(|p| format!("{}/{}", p.healthy, p.total))
                .unwrap_or_else(|| "-".to_string()),
            last_used: status
                .last_used_ms_ago
                .map(|ms| format!("{:.1}s ago", ms as f64 / 1000.0))
                .unwrap_or_else(|| "never".to_string()),
            last_error: status.last_error.clone().unwrap_or_default(),
        })
        .collect()
}

fn health_rows(report: &[EndpointHealthReport]) -> Vec<HealthRow> {
    report
        .iter()
        .map(|entry| HealthRow {
            endpoint: entry.endpoint.clone(),
            checks: entry.total_checks,
            success_rate: format!("{:.1}%", entry.success_rate * 100.0),
            latency: format!("{:.0} ms", entry.average_latency_ms),
            last_success: entry
                .seconds_since_last_success
                .map(|s| format!("{}s ago", s))
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect()
}

/// Format endpoint state for display
fn format_state(status: &EndpointStatus) -> String {
    if !status.enabled {
        style("Disabled").dim().to_string()
    } else if status.rate_limited {
        style("Rate limited").yellow().to_string()
    } else if status.healthy {
        style("Healthy").green().to_string()
    } else {
        style("Unhealthy").red().to_string()
    }
}

fn format_chain_status(check: &ChainCheck) -> String {
    match check.status {
        ChainCheckStatus::Matched => style("OK").green().to_string(),
        ChainCheckStatus::Mismatched => style("Wrong chain (disabled)").red().to_string(),
        ChainCheckStatus::Unreachable => {
            let reason = check.error.as_deref().unwrap_or("no response");
            style(format!("Unreachable: {}", reason)).yellow().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, healthy: bool, enabled: bool) -> EndpointStatus {
        EndpointStatus {
            name: name.to_string(),
            url: format!("https://{}.test", name),
            priority: 1,
            enabled,
            healthy,
            error_count: if healthy { 0 } else { 3 },
            rate_limited: false,
            last_used_ms_ago: Some(1500),
            last_error: None,
            last_checked: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_endpoint_rows() {
        console::set_colors_enabled(false);
        let mut pool = BTreeMap::new();
        pool.insert("a".to_string(), PoolStatus { healthy: 2, total: 3 });

        let rows = endpoint_rows(&[status("a", true, true), status("b", false, false)], &pool);

        assert_eq!(rows[0].state, "Healthy");
        assert_eq!(rows[0].pool, "2/3");
        assert_eq!(rows[0].last_used, "1.5s ago");
        assert_eq!(rows[1].state, "Disabled");
        assert_eq!(rows[1].pool, "-");
        assert_eq!(rows[1].errors, 3);
    }

    #[test]
    fn test_health_rows() {
        let rows = health_rows(&[EndpointHealthReport {
            endpoint: "a".to_string(),
            total_checks: 4,
            failed_checks: 1,
            success_rate: 0.75,
            average_latency_ms: 120.4,
            seconds_since_last_success: None,
        }]);

        assert_eq!(rows[0].success_rate, "75.0%");
        assert_eq!(rows[0].latency, "120 ms");
        assert_eq!(rows[0].last_success, "never");
    }
}
