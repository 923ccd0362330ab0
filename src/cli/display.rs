//! Display formatting for CLI output
//!
//! Pure functions that format data for display

use super::commands::ContextInfo;
use crate::bulk::BulkReport;
use crate::diagnostics::LinkHealth;
use crate::fabric::LinkOutcome;
use crate::layout::Positions;
use crate::orchestrator::{NodeSummary, TopologyView};
use crate::provision::Removal;
use crate::topology::InterfaceAddress;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: &[String]| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    let header_row: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    push_row(&header_row);
    for row in &rows {
        push_row(row);
    }
    output
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn ip_cell(ip: Option<InterfaceAddress>) -> String {
    or_dash(ip.map(|ip| ip.to_string()))
}

// ============================================================================
// Context display
// ============================================================================

pub fn format_context_list(contexts: &[ContextInfo]) -> String {
    let rows = contexts
        .iter()
        .map(|ctx| {
            vec![
                if ctx.is_current { "*" } else { " " }.to_string(),
                ctx.name.clone(),
                ctx.server.clone(),
                or_dash(ctx.namespace.clone()),
            ]
        })
        .collect();
    format_table(&["", "NAME", "SERVER", "NAMESPACE"], rows)
}

// ============================================================================
// Topology display
// ============================================================================

pub fn format_node_list(nodes: &[NodeSummary]) -> String {
    let rows = nodes
        .iter()
        .map(|node| {
            vec![
                node.name.clone(),
                or_dash(node.kind.map(|k| k.to_string())),
                or_dash(node.ip.clone()),
                if node.peers.is_empty() {
                    "-".to_string()
                } else {
                    node.peers.join(",")
                },
            ]
        })
        .collect();
    format_table(&["NAME", "KIND", "IP", "PEERS"], rows)
}

pub fn format_topology(view: &TopologyView) -> String {
    let nodes = view
        .nodes
        .iter()
        .map(|n| {
            vec![
                n.id.clone(),
                n.kind.clone(),
                or_dash(n.ip.clone()),
                format!("{:.1}", n.position.x),
                format!("{:.1}", n.position.y),
            ]
        })
        .collect();
    let edges = view
        .edges
        .iter()
        .map(|e| vec![e.id.clone(), e.source.clone(), e.target.clone()])
        .collect();

    let mut output = format!("Layout: {}\n\n", view.layout);
    output.push_str(&format_table(&["NODE", "KIND", "IP", "X", "Y"], nodes));
    output.push('\n');
    output.push_str(&format_table(&["LINK", "SOURCE", "TARGET"], edges));
    output
}

pub fn format_positions(positions: &Positions) -> String {
    let rows = positions
        .iter()
        .map(|(name, (x, y))| vec![name.clone(), format!("{:.3}", x), format!("{:.3}", y)])
        .collect();
    format_table(&["NODE", "X", "Y"], rows)
}

pub fn format_link_outcome(outcome: &LinkOutcome) -> String {
    format!(
        "link {} {} ({}) <-> {} ({})\n",
        outcome.uid,
        outcome.a,
        ip_cell(outcome.a_ip),
        outcome.b,
        ip_cell(outcome.b_ip)
    )
}

pub fn format_removal(removal: &Removal) -> String {
    let mut output = if removal.neighbors.is_empty() {
        format!("{} deleted\n", removal.name)
    } else {
        format!(
            "{} deleted, unlinked from {}\n",
            removal.name,
            removal.neighbors.join(", ")
        )
    };
    if !removal.unscrubbed.is_empty() {
        output.push_str(&format!(
            "warning: {} still linked to {}\n",
            removal.unscrubbed.join(", "),
            removal.name
        ));
    }
    output
}

// ============================================================================
// Bulk and diagnostics display
// ============================================================================

pub fn format_bulk_report(report: &BulkReport) -> String {
    let rows = report
        .results
        .iter()
        .map(|r| {
            vec![
                r.action.clone(),
                or_dash(r.device.clone()),
                if r.succeeded() { "ok" } else { "failed" }.to_string(),
                r.error.clone().unwrap_or_default(),
            ]
        })
        .collect();

    let mut output = String::new();
    if !report.results.is_empty() {
        output.push_str(&format_table(&["ACTION", "DEVICE", "RESULT", "ERROR"], rows));
    }
    for rejected in &report.rejected {
        output.push_str(&format!("skipped: {}\n", rejected));
    }
    output.push_str(&format!(
        "{} succeeded, {} failed\n",
        report.succeeded(),
        report.failed()
    ));
    output
}

pub fn format_link_health(health: &[LinkHealth]) -> String {
    let rows = health
        .iter()
        .map(|h| {
            vec![
                h.uid.to_string(),
                h.source.clone(),
                h.target.clone(),
                or_dash(h.target_ip.map(|ip| ip.to_string())),
                or_dash(h.latency_ms.map(|ms| format!("{:.3}", ms))),
                or_dash(h.loss_percent.map(|loss| format!("{}%", loss))),
                or_dash(h.error.clone()),
            ]
        })
        .collect();
    format_table(&["LINK", "FROM", "TO", "IP", "RTT (MS)", "LOSS", "ERROR"], rows)
}
