//! Queue boundary commands: `labcheck submit`, `drain` and `status`.

use anyhow::{Context, Result};
use std::path::PathBuf;

use labcheck::checker::db::CheckerDb;
use labcheck::checker::models::{QueueKind, RejectedFiles, Submission, TestResult};
use labcheck::checker::notify::{render_outbound, render_rejected};
use labcheck::config::LabcheckConfig;

pub struct SubmitArgs<'a> {
    pub student_id: i64,
    pub channel_id: i64,
    pub discipline_id: i64,
    pub lab_number: u32,
    pub files: &'a [PathBuf],
}

/// Enqueue an Inbound record the way the chat front end does on upload.
pub fn cmd_submit(config: &LabcheckConfig, args: SubmitArgs<'_>) -> Result<()> {
    if args.files.is_empty() {
        anyhow::bail!("No files to submit");
    }
    let mut files_path = Vec::with_capacity(args.files.len());
    for file in args.files {
        let absolute = file
            .canonicalize()
            .with_context(|| format!("Cannot read submitted file {}", file.display()))?;
        files_path.push(absolute.to_string_lossy().to_string());
    }

    let db = CheckerDb::new(&config.checker.db_path)?;
    if db.get_discipline(args.discipline_id)?.is_none() {
        anyhow::bail!("Discipline {} does not exist", args.discipline_id);
    }
    let submission = Submission {
        discipline_id: args.discipline_id,
        lab_number: args.lab_number,
        files_path,
    };
    let id = db.push_json(
        QueueKind::Inbound,
        args.student_id,
        args.channel_id,
        &submission,
    )?;
    println!(
        "Queued submission #{} ({} file(s) for lab {})",
        id,
        submission.files_path.len(),
        submission.lab_number
    );
    Ok(())
}

/// Claim delivered records and print the messages a student would receive.
/// A record whose payload does not decode is reported on stderr together
/// with its raw data and skipped.
pub fn cmd_drain(config: &LabcheckConfig, limit: Option<usize>) -> Result<()> {
    let mut db = CheckerDb::new(&config.checker.db_path)?;
    let mut delivered = 0usize;
    let mut skipped = 0usize;

    for kind in [QueueKind::Outbound, QueueKind::Rejected] {
        while limit.is_none_or(|max| delivered < max) {
            let Some(record) = db.claim_oldest(kind)? else {
                break;
            };
            let text = match kind {
                QueueKind::Rejected => record
                    .payload::<RejectedFiles>()
                    .map(|payload| render_rejected(&payload)),
                _ => record
                    .payload::<TestResult>()
                    .map(|payload| render_outbound(&payload)),
            };
            let text = match text {
                Ok(text) => text,
                Err(e) => {
                    eprintln!(
                        "{} [{}] record #{} for {}: {:#}\n  data: {}",
                        console::style("Skipped undeliverable").yellow().bold(),
                        kind.as_str(),
                        record.id,
                        record.submitter_id,
                        e,
                        record.data
                    );
                    skipped += 1;
                    continue;
                }
            };
            println!(
                "{} to {} (chat {})",
                console::style(format!("[{}]", kind.as_str())).bold(),
                record.submitter_id,
                record.channel_id
            );
            println!("{}", text);
            delivered += 1;
        }
    }

    if delivered == 0 && skipped == 0 {
        println!("{}", console::style("Nothing to deliver.").dim());
    }
    Ok(())
}

pub fn cmd_status(config: &LabcheckConfig, student_id: Option<i64>) -> Result<()> {
    let db = CheckerDb::new(&config.checker.db_path)?;

    println!("{}", console::style("Queues").bold().cyan());
    for kind in QueueKind::ALL {
        println!("  {:<9} {}", kind.as_str(), db.count(kind)?);
    }

    println!();
    println!("{}", console::style("Disciplines").bold().cyan());
    for discipline in db.list_disciplines()? {
        println!(
            "  #{} {} ({}): {} labs, {} tasks",
            discipline.id,
            discipline.short_name,
            discipline.full_name,
            discipline.max_home_works,
            discipline.max_tasks
        );
    }

    let Some(student_id) = student_id else {
        return Ok(());
    };
    println!();
    println!("{}", console::style(format!("Student {}", student_id)).bold().cyan());
    let records = db.list_homeworks(student_id)?;
    if records.is_empty() {
        println!("  not enrolled in any discipline");
    }
    for record in records {
        println!("  discipline {}: {:.2} points", record.discipline_id, record.points);
        for lab in &record.labs {
            let mark = if lab.is_done {
                console::style("done").green()
            } else {
                console::style("open").yellow()
            };
            println!(
                "    lab {:<3} {}/{} tasks  {}  deadline {}",
                lab.number,
                lab.tasks_completed,
                lab.tasks.len(),
                mark,
                lab.deadline
            );
        }
    }
    Ok(())
}
