//! Static HTML rendering.

use std::fmt::Write;

use crate::processor::{Classification, Verdict};
use crate::report::{BuildSection, ReportDocument};

const STYLE: &str = r#"
body { font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; margin: 2em; color: #222; }
h1 { font-size: 1.6em; }
h2 { border-bottom: 1px solid #ddd; padding-bottom: .2em; margin-top: 1.6em; }
table { border-collapse: collapse; width: 100%; margin: .6em 0; }
th, td { text-align: left; padding: .35em .6em; border-bottom: 1px solid #eee; font-size: .92em; }
th { background: #f6f6f6; }
code { font-family: Menlo, Consolas, monospace; font-size: .9em; }
.badge { display: inline-block; padding: .2em .6em; border-radius: 3px; color: #fff; font-weight: 600; }
.ok { background: #2e7d32; }
.bad { background: #c62828; }
.warn { background: #ef6c00; }
.muted { background: #757575; }
.banner { padding: .8em 1em; border-left: 4px solid #ef6c00; background: #fff3e0; margin: 1em 0; }
"#;

/// Escape text for HTML element and attribute content.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn badge(class: &str, label: &str) -> String {
    format!(r#"<span class="badge {}">{}</span>"#, class, escape(label))
}

fn classification_badge(classification: Classification) -> String {
    match classification {
        Classification::Whitelisted => badge("ok", "whitelisted"),
        Classification::Unauthorized => badge("bad", "unauthorized"),
        Classification::Unresolvable => badge("warn", "unresolvable"),
    }
}

pub(crate) fn render(doc: &ReportDocument) -> String {
    let network = &doc.network;
    let mut html = String::new();

    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>Build report: {}</title>\n<style>{}</style>\n</head>\n<body>\n",
        escape(&network.bundle),
        STYLE
    );
    let _ = write!(html, "<h1>Build report: <code>{}</code></h1>\n", escape(&network.bundle));

    let _ = write!(
        html,
        "<table>\n<tr><th>Target</th><td>{}</td></tr>\n<tr><th>Package manager</th><td>{}</td></tr>\n<tr><th>Mode</th><td>{}</td></tr>\n<tr><th>Capture window</th><td>{} .. {} ({} ms)</td></tr>\n<tr><th>Run time</th><td>{:.1} s</td></tr>\n<tr><th>Policy version</th><td><code>{}</code></td></tr>\n</table>\n",
        escape(&doc.run.target),
        escape(&doc.run.package_manager),
        escape(&doc.run.mode),
        network.window.start.to_rfc3339(),
        network.window.stop.to_rfc3339(),
        network.elapsed_ms,
        doc.run.elapsed_secs(),
        escape(network.policy_version.as_str())
    );

    // Build section.
    html.push_str("<h2>Build</h2>\n");
    let build_badge = match &doc.build {
        BuildSection::Succeeded => badge("ok", "build succeeded"),
        BuildSection::Failed { step, .. } => badge("bad", &format!("build failed at step {}", step)),
        BuildSection::Interrupted => badge("warn", "build interrupted"),
        BuildSection::Unknown => badge("muted", "no build record"),
    };
    let _ = writeln!(html, "<p>{}</p>", build_badge);

    if let Some(build) = &network.build {
        html.push_str("<table>\n<tr><th>#</th><th>Command</th><th>Status</th><th>Transcript</th></tr>\n");
        for step in &build.steps {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td><code>{}</code></td><td>{}</td><td><a href=\"{}\">{}</a></td></tr>",
                step.index,
                escape(&step.command),
                escape(&step.status.label()),
                escape(&step.transcript),
                escape(&step.transcript)
            );
        }
        html.push_str("</table>\n");
    }

    // Network section.
    html.push_str("<h2>Network</h2>\n");
    let verdict_badge = match doc.verdict {
        Verdict::Clean => badge("ok", "no unauthorized access"),
        Verdict::UnauthorizedAccess => badge("bad", "unauthorized access found"),
        Verdict::Inconclusive => badge("warn", "inconclusive"),
    };
    let _ = writeln!(html, "<p>{}</p>", verdict_badge);

    if let Some(reason) = network.completeness.reason() {
        let _ = writeln!(
            html,
            "<div class=\"banner\"><strong>Capture incomplete:</strong> {}. Absence of unauthorized findings does not prove the build made no other connections.</div>",
            escape(reason)
        );
    }

    let _ = writeln!(
        html,
        "<p>{} events: {} whitelisted, {} unauthorized, {} unresolvable. {} events fell outside the capture window.</p>",
        network.counts.total(),
        network.counts.whitelisted,
        network.counts.unauthorized,
        network.counts.unresolvable,
        network.out_of_window
    );

    if !network.hosts.is_empty() {
        html.push_str("<table>\n<tr><th>Host</th><th>Classification</th><th>Addresses</th><th>Ports</th><th>Connections</th><th>Bytes</th></tr>\n");
        for host in &network.hosts {
            let addresses: Vec<&str> = host.addresses.iter().map(String::as_str).collect();
            let ports: Vec<String> = host.ports.iter().map(u16::to_string).collect();
            let _ = writeln!(
                html,
                "<tr><td><code>{}</code></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape(&host.host),
                classification_badge(host.classification),
                escape(&addresses.join(", ")),
                ports.join(", "),
                host.connections,
                host.bytes
            );
        }
        html.push_str("</table>\n");
    }

    let flagged: Vec<_> = network
        .findings
        .iter()
        .filter(|f| f.classification != Classification::Whitelisted)
        .collect();
    if !flagged.is_empty() {
        html.push_str("<h3>Flagged events</h3>\n<table>\n<tr><th>Time</th><th>Host</th><th>Port</th><th>Protocol</th><th>Classification</th><th>Detail</th></tr>\n");
        for finding in flagged {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td><code>{}</code></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                finding.event.timestamp.to_rfc3339(),
                escape(finding.host_label()),
                finding.event.port,
                finding.event.protocol,
                classification_badge(finding.classification),
                escape(finding.detail.as_deref().unwrap_or(""))
            );
        }
        html.push_str("</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
        assert_eq!(escape("plain"), "plain");
    }
}
