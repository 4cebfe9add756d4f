//! Catalogue setup: `labcheck init` and `labcheck enroll`.

use anyhow::{Context, Result};
use std::path::Path;

use labcheck::checker::db::CheckerDb;
use labcheck::checker::models::DisciplinesConfig;
use labcheck::config::LabcheckConfig;

pub fn cmd_init(config: &LabcheckConfig, disciplines: Option<&Path>) -> Result<()> {
    let db_path = &config.checker.db_path;
    let db = CheckerDb::new(db_path)?;
    println!("Database initialized at {}", db_path.display());

    let Some(path) = disciplines else {
        return Ok(());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read disciplines file: {}", path.display()))?;
    let parsed: DisciplinesConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse disciplines file: {}", path.display()))?;

    for entry in &parsed.disciplines {
        let discipline = db.insert_discipline(entry)?;
        println!(
            "  {} #{} {} ({} labs, {} tasks)",
            console::style("+").green(),
            discipline.id,
            discipline.short_name,
            discipline.max_home_works,
            discipline.max_tasks
        );
    }
    Ok(())
}

pub fn cmd_enroll(config: &LabcheckConfig, student_id: i64, discipline_id: i64) -> Result<()> {
    let db = CheckerDb::new(&config.checker.db_path)?;
    let record = db.enroll(student_id, discipline_id)?;
    println!(
        "Student {} enrolled in discipline {} with {} lab(s)",
        student_id,
        discipline_id,
        record.labs.len()
    );
    Ok(())
}
