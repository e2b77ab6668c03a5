//! Terminal rendering of result records.

use scratchpad_core::{ResultRecord, RunOutcome, Severity};

use crate::colors;

/// Print one record. Errors and diagnostics go to stderr.
pub fn print_record(record: &ResultRecord) {
    match record {
        ResultRecord::Value {
            header: Some(header),
            text,
            children,
        } => {
            println!("{}{}:{} {}", colors::CYAN, header, colors::RESET, text);
            print_children(children, 1);
        }
        ResultRecord::Value { text, .. } => println!("{}", text),
        ResultRecord::Exception {
            exception_type,
            message,
            line_number,
            children,
        } => {
            let location = line_number
                .map(|line| format!(" (line {})", line))
                .unwrap_or_default();
            eprintln!(
                "{}{}{}{}: {}",
                colors::RED,
                exception_type,
                location,
                colors::RESET,
                message
            );
            print_children(children, 1);
        }
        ResultRecord::CompileDiagnostic(diagnostic) => {
            let color = match diagnostic.severity {
                Severity::Error => colors::RED,
                Severity::Warning => colors::YELLOW,
                Severity::Info => colors::DIM,
            };
            eprintln!(
                "{}:{}: {}{}{}: {}",
                diagnostic.line,
                diagnostic.column,
                color,
                diagnostic.severity,
                colors::RESET,
                diagnostic.message
            );
        }
        ResultRecord::RestoreProgress { message, is_error } => {
            if *is_error {
                eprintln!("{}{}{}", colors::RED, message, colors::RESET);
            } else {
                println!("{}{}{}", colors::DIM, message, colors::RESET);
            }
        }
    }
}

fn print_children(children: &[ResultRecord], depth: usize) {
    let indent = "  ".repeat(depth);
    for child in children {
        println!("{}{}-{} {}", indent, colors::DIM, colors::RESET, child);
        print_children(child.children(), depth + 1);
    }
}

/// One-line summary of a finished run.
pub fn outcome_line(outcome: &RunOutcome) -> String {
    let color = if outcome.is_success() {
        colors::GREEN
    } else if matches!(outcome, RunOutcome::Canceled) {
        colors::YELLOW
    } else {
        colors::RED
    };
    let mut text = outcome.to_string();
    if let Some(first) = text.get(0..1) {
        text = format!("{}{}", first.to_uppercase(), &text[1..]);
    }
    format!("{}{}{}", color, text, colors::RESET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_line_capitalizes() {
        let line = outcome_line(&RunOutcome::Completed);
        assert!(line.contains("Completed"));
        assert!(line.starts_with(colors::GREEN));

        let line = outcome_line(&RunOutcome::Crashed {
            message: "exit code 3".to_string(),
        });
        assert!(line.contains("Crashed: exit code 3"));
        assert!(line.starts_with(colors::RED));
    }
}
