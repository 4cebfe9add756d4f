//! User-facing text for Outbound and Rejected records.

use super::models::{RejectedFiles, TaskResult, TestResult, task_number};

/// Per-task summary: passed tasks first, then failed ones with reasons,
/// each group ordered by task number.
pub fn render_outbound(result: &TestResult) -> String {
    let mut text = format!("Test results for lab {}:\n", result.lab_number);
    for task in sorted(&result.successful_task) {
        text.push_str(&format!("✅ {}\n", task.file_name));
    }
    for task in sorted(&result.failed_task) {
        if task.description.is_empty() {
            text.push_str(&format!("❌ {}\n", task.file_name));
        } else {
            let reasons: Vec<&str> = task.description.iter().map(String::as_str).collect();
            text.push_str(&format!("❌ {} {}\n", task.file_name, reasons.join("; ")));
        }
    }
    text
}

pub fn render_rejected(rejected: &RejectedFiles) -> String {
    let mut text = format!("{}:", rejected.description);
    for file in &rejected.files {
        text.push_str(&format!("\n  {}", file));
    }
    text.push('\n');
    text
}

fn sorted(tasks: &[TaskResult]) -> Vec<&TaskResult> {
    let mut tasks: Vec<&TaskResult> = tasks.iter().collect();
    tasks.sort_by_key(|t| (task_number(&t.file_name).unwrap_or(t.task_id), t.task_id));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::models::RejectedType;
    use std::collections::BTreeSet;

    fn task(task_id: u32, reasons: &[&str]) -> TaskResult {
        TaskResult {
            task_id,
            file_name: format!("lab1-{}.py", task_id),
            description: reasons.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn outbound_lists_passed_then_failed_in_task_order() {
        let result = TestResult {
            discipline_id: 1,
            lab_number: 1,
            successful_task: vec![task(10, &[]), task(2, &[])],
            failed_task: vec![task(3, &["wrong answer", "crashed"])],
        };
        let text = render_outbound(&result);
        assert_eq!(
            text,
            "Test results for lab 1:\n✅ lab1-2.py\n✅ lab1-10.py\n❌ lab1-3.py crashed; wrong answer\n"
        );
    }

    #[test]
    fn rejected_lists_every_file() {
        let rejected = RejectedFiles::new(
            RejectedType::TemplateMismatch,
            vec!["ghost.py".into(), "lab9-1.py".into()],
        );
        let text = render_rejected(&rejected);
        assert!(text.starts_with(RejectedType::TemplateMismatch.description()));
        assert!(text.contains("\n  ghost.py"));
        assert!(text.contains("\n  lab9-1.py"));
    }
}
