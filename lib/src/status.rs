//! Summaries of saved provisioning runs for `devbox status`.

use std::io::Write;

use anyhow::{Context, Result};

use crate::cli::StatusOpts;
use crate::provision::{state_path, RunState};
use crate::state;
use crate::step::StepStatus;

fn render_table(st: &RunState) -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table
        .load_preset(comfy_table::presets::NOTHING)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
        .set_header(["STEP", "STATUS", "ATTEMPTS", "UPDATED", "DETAIL"]);
    for r in &st.journal.steps {
        let detail = match &r.status {
            StepStatus::Failed { reason } => reason.as_str(),
            _ => "",
        };
        let updated = r.updated.format("%Y-%m-%d %H:%M:%S").to_string();
        let attempts = r.attempts.to_string();
        table.add_row([
            r.name.as_str(),
            r.status.label(),
            attempts.as_str(),
            updated.as_str(),
            detail,
        ]);
    }
    table
}

fn print_human(st: &RunState, mut out: impl Write) -> Result<()> {
    let n = &st.naming;
    writeln!(out, "VM:             {}", n.vm)?;
    writeln!(out, "Resource group: {}", n.resource_group)?;
    writeln!(out, "Region:         {}", n.region)?;
    if let Some(ip) = &st.ip_address {
        writeln!(out, "Address:        {ip}:{}", st.ssh_port)?;
    }
    writeln!(out, "Host file:      {}", n.host_file)?;
    writeln!(out, "Log:            {}", n.log_file)?;
    if let Some(failed) = st.journal.failed() {
        writeln!(out, "Failed at:      {}", failed.name)?;
    }
    writeln!(out)?;
    writeln!(out, "{}", render_table(st))?;
    if !st.created.is_empty() {
        writeln!(out)?;
        writeln!(out, "Created:")?;
        for r in &st.created {
            writeln!(out, "  {r}")?;
        }
    }
    Ok(())
}

/// Implementation of the `devbox status` CLI command.
pub(crate) fn status(opts: &StatusOpts) -> Result<()> {
    let home = crate::utils::home_dir()?;
    let path = state_path(&home, &opts.vm);
    let st: RunState = state::load_optional(&path)?
        .with_context(|| format!("No saved state for {} at {path}", opts.vm))?;
    let out = std::io::stdout();
    let mut out = out.lock();
    if opts.json {
        serde_json::to_writer_pretty(&mut out, &st).context("Writing to stdout")?;
        writeln!(out)?;
    } else {
        print_human(&st, &mut out).context("Writing to stdout")?;
    }
    Ok(())
}
