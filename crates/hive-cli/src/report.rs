//! Terminal rendering of run reports

use nu_ansi_term::Color;

use hive_core::{RunReport, TaskRecord, TaskStatus, WorkflowOutcome};

/// Process exit code for an outcome
pub fn exit_code(outcome: &WorkflowOutcome) -> i32 {
    match outcome {
        WorkflowOutcome::Completed(_) => 0,
        WorkflowOutcome::Failed(_) => 1,
        WorkflowOutcome::Cancelled => 130,
    }
}

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Succeeded => Color::Green,
        TaskStatus::Failed => Color::Red,
        TaskStatus::Escalated => Color::Yellow,
        _ => Color::DarkGray,
    }
}

fn depth(record: &TaskRecord) -> usize {
    record.id.as_str().matches('.').count()
}

/// Render the outcome and, when `verbose`, the task tree and dispatch order
pub fn render(report: &RunReport, verbose: bool) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "{} {}\n",
        Color::Cyan.bold().paint("run"),
        report.run_id
    ));

    match &report.outcome {
        WorkflowOutcome::Completed(artifacts) => {
            out.push_str(&format!("{}\n", Color::Green.bold().paint("completed")));
            for (i, artifact) in artifacts.iter().enumerate() {
                out.push_str(&format!("  t{}: {}\n", i, artifact));
            }
        }
        WorkflowOutcome::Failed(chain) => {
            out.push_str(&format!("{}\n", Color::Red.bold().paint("failed")));
            for diagnostic in chain {
                out.push_str(&format!("  {}\n", diagnostic));
            }
        }
        WorkflowOutcome::Cancelled => {
            out.push_str(&format!("{}\n", Color::Yellow.bold().paint("cancelled")));
        }
    }

    if !verbose {
        return out;
    }

    out.push_str(&format!("\n{}\n", Color::Cyan.bold().paint("tasks")));
    for record in &report.trace.records {
        let indent = "  ".repeat(depth(record) + 1);
        let mut line = format!(
            "{}{} {} {}",
            indent,
            record.id,
            record.owner_agent_id,
            status_color(record.status).paint(record.status.as_str())
        );
        if record.retry_count > 0 {
            line.push_str(&format!(" retries={}", record.retry_count));
        }
        if let Some(replaced) = &record.replaces {
            line.push_str(&format!(" replaces={}", replaced));
        }
        out.push_str(&line);
        out.push('\n');
    }

    let order: Vec<&str> = report
        .trace
        .dispatch_order
        .iter()
        .map(|id| id.as_str())
        .collect();
    out.push_str(&format!(
        "\n{} {}\n",
        Color::Cyan.bold().paint("dispatch"),
        order.join(" ")
    ));

    out
}
