//! Report generation
//!
//! Renders a scenario outcome as a plain-text summary or as JSON.

use crate::config::OutputFormat;
use crate::scenario::ScenarioOutcome;
use anyhow::Result;
use std::fmt::Write;

/// How many diagnostics the text report lists before summarising the rest
const DIAGNOSTICS_SHOWN: usize = 10;

pub fn render(outcome: &ScenarioOutcome, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Txt => {
            let mut out = String::new();
            write_txt(&mut out, outcome)?;
            Ok(out)
        }
        OutputFormat::Json => Ok(serde_json::to_string_pretty(outcome)?),
    }
}

fn write_txt(out: &mut String, outcome: &ScenarioOutcome) -> std::fmt::Result {
    let capacity = outcome
        .capacity
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unbounded".to_string());

    writeln!(out, "═══════════════════════════════════════════════")?;
    writeln!(out, "  Callback Channel - Scenario Report")?;
    writeln!(out, "═══════════════════════════════════════════════\n")?;
    writeln!(out, "Started:    {}", outcome.started_at)?;
    writeln!(out, "Producers:  {}", outcome.producers)?;
    writeln!(out, "Requests:   {} per producer", outcome.requests_per_producer)?;
    writeln!(out, "Capacity:   {}", capacity)?;
    writeln!(out, "Elapsed:    {} ms\n", outcome.elapsed_ms)?;

    writeln!(out, "Channel:")?;
    writeln!(out, "  Enqueued:      {}", outcome.enqueued)?;
    writeln!(out, "  Rejected full: {}", outcome.rejected_full)?;
    writeln!(out, "  Drain cycles:  {}\n", outcome.cycles)?;

    writeln!(out, "Deliveries:")?;
    writeln!(out, "  Delivered:     {}", outcome.delivered)?;
    writeln!(out, "  Unresolved:    {}", outcome.unresolved)?;
    writeln!(out, "  Failed:        {}", outcome.failed)?;
    writeln!(out, "  Cancelled:     {}", outcome.cancelled)?;
    writeln!(out, "  Out of order:  {}", outcome.out_of_order)?;

    if !outcome.diagnostics.is_empty() {
        writeln!(out, "\nDiagnostics ({}):", outcome.diagnostics.len())?;
        for line in outcome.diagnostics.iter().take(DIAGNOSTICS_SHOWN) {
            writeln!(out, "  - {}", line.replace('\n', "\n    "))?;
        }
        if outcome.diagnostics.len() > DIAGNOSTICS_SHOWN {
            writeln!(
                out,
                "  ... and {} more",
                outcome.diagnostics.len() - DIAGNOSTICS_SHOWN
            )?;
        }
    }

    let verdict = if outcome.is_consistent() {
        "✓ every accepted request accounted for, per-producer order preserved"
    } else {
        "✗ delivery accounting mismatch"
    };
    writeln!(out, "\n{}", verdict)
}
