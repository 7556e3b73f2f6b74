//! HTML rendering for the `/mpp/status` page: runtime information, build
//! information, and the candidate/selection table.

use std::time::Duration;

use crate::observability::metrics::{revision, version};
use crate::router::Status;

const PAGE_STYLE: &str = "\
body { font-family: sans-serif; margin: 2em; }
h2 { border-bottom: 1px solid #ddd; padding-bottom: 0.2em; }
table { border-collapse: collapse; margin-bottom: 2em; }
th, td { border: 1px solid #ddd; padding: 0.4em 0.8em; text-align: left; }
th { background: #f5f5f5; }
code { background: #f5f5f5; padding: 0 0.2em; }
.unavailable { color: #999; font-style: italic; }";

/// Render the full status page.
pub fn render(status: &Status, uptime: Duration) -> String {
    let mut endpoint_rows = String::new();
    for endpoint in &status.endpoints {
        let address = escape(&endpoint.address);
        let selected = if endpoint.selected { "&#10003;" } else { "" };
        let uptime_cell = if endpoint.uptime > Duration::ZERO {
            format_duration(endpoint.uptime)
        } else {
            r#"<span class="unavailable">unavailable</span>"#.to_string()
        };
        let comparison = endpoint
            .comparison_metric_value
            .as_deref()
            .map(escape)
            .unwrap_or_default();
        let error = endpoint.error.as_deref().map(escape).unwrap_or_default();
        endpoint_rows.push_str(&format!(
            "\t\t<tr>\n\
             \t\t\t<td><a href=\"{address}/status\">{address}</a></td>\n\
             \t\t\t<td>{selected}</td>\n\
             \t\t\t<td>{uptime_cell}</td>\n\
             \t\t\t<td>{comparison}</td>\n\
             \t\t\t<td>{error}</td>\n\
             \t\t</tr>\n"
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
	<meta http-equiv="Content-Type" content="text/html; charset=utf-8">
	<title>Multi-Prometheus Proxy Status</title>
	<style>{PAGE_STYLE}</style>
</head>
<body>
	<h2>Runtime Information</h2>
	<table>
		<tr><th>Uptime</th><td>{uptime}</td></tr>
		<tr><th>Selector Strategy</th><td><code>{strategy}</code> &mdash; {strategy_description}</td></tr>
		<tr><th>Comparison Metric</th><td><code>{comparison_metric}</code></td></tr>
		<tr><th>Affinity Options</th><td>{affinity_options}</td></tr>
		<tr><th>Selection Interval</th><td>{interval}</td></tr>
	</table>

	<h2>Build Information</h2>
	<table>
		<tr><th>Version</th><td>{version}</td></tr>
		<tr><th>Revision</th><td>{revision}</td></tr>
	</table>

	<h2>Prometheus Endpoints</h2>
	<table>
		<tr>
			<th>Endpoint</th>
			<th>Selected</th>
			<th>Uptime</th>
			<th><code>{comparison_metric}</code></th>
			<th>Error</th>
		</tr>
{endpoint_rows}	</table>
</body>
</html>
"#,
        uptime = format_duration(uptime),
        strategy = escape(&status.strategy),
        strategy_description = escape(&status.strategy_description),
        comparison_metric = escape(&status.comparison_metric),
        affinity_options = escape(&status.affinity_options),
        interval = format_duration(status.interval),
        version = version(),
        revision = revision(),
    )
}

/// Humanize a duration at whole-second granularity.
fn format_duration(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::PrometheusEndpoint;

    fn sample_status() -> Status {
        Status {
            endpoints: vec![
                PrometheusEndpoint {
                    address: "http://prom-a:9090".to_string(),
                    query_api: None,
                    uptime: Duration::from_secs(3700),
                    selected: true,
                    error: None,
                    comparison_metric_value: Some("123456".to_string()),
                },
                PrometheusEndpoint {
                    address: "http://prom-b:9090".to_string(),
                    query_api: None,
                    uptime: Duration::ZERO,
                    selected: false,
                    error: Some("connection refused".to_string()),
                    comparison_metric_value: None,
                },
            ],
            strategy: "single-most-data".to_string(),
            strategy_description: "Selects the single prometheus instance with the most ingested samples"
                .to_string(),
            comparison_metric: "prometheus_local_storage_ingested_samples_total".to_string(),
            affinity_options: "cookies".to_string(),
            interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_render_includes_endpoints_and_metadata() {
        let html = render(&sample_status(), Duration::from_secs(90));
        assert!(html.contains("http://prom-a:9090"));
        assert!(html.contains("&#10003;"));
        assert!(html.contains("connection refused"));
        assert!(html.contains("single-most-data"));
        assert!(html.contains("1m 30s"));
        assert!(html.contains("unavailable"));
    }

    #[test]
    fn test_render_escapes_markup() {
        let mut status = sample_status();
        status.endpoints[0].error = Some("<script>alert(1)</script>".to_string());
        let html = render(&status, Duration::ZERO);
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
