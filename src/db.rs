use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use std::path::Path;

use crate::schedule::{
    day_from_storage, day_to_storage, LessonRecord, ScheduleStore, SchoolRef, Subject,
};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            teacher_id TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;

    // day_of_week is kept in storage numbering (0=Sunday..6=Saturday).
    // week_start_date is NULL exactly when is_stable = 1.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            day_of_week INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            room TEXT,
            is_stable INTEGER NOT NULL,
            week_start_date TEXT,
            stable_lesson_id TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(stable_lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_subject ON lessons(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_week ON lessons(is_stable, week_start_date)",
        [],
    )?;

    // Existing workspaces may predate these columns. Add if needed.
    ensure_subjects_teacher_id(&conn)?;
    ensure_lessons_stable_link(&conn)?;

    Ok(conn)
}

fn ensure_subjects_teacher_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "teacher_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE subjects ADD COLUMN teacher_id TEXT", [])?;
    Ok(())
}

fn ensure_lessons_stable_link(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "lessons", "stable_lesson_id")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE lessons ADD COLUMN stable_lesson_id TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// SQLite adapter behind the engine's store trait. This is the single place
/// where day numbers cross between the canonical and storage conventions.
pub struct SqliteScheduleStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteScheduleStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

const LESSON_COLUMNS: &str = "l.id, l.subject_id, l.day_of_week, l.start_time, l.end_time, \
     l.room, l.is_stable, l.week_start_date, l.stable_lesson_id";

fn lesson_row_to_record(row: &rusqlite::Row) -> rusqlite::Result<LessonRecord> {
    let storage_day: i64 = row.get(2)?;
    let value = json!({
        "id": row.get::<_, String>(0)?,
        "subjectId": row.get::<_, String>(1)?,
        "dayOfWeek": day_from_storage(storage_day),
        "startTime": row.get::<_, String>(3)?,
        "endTime": row.get::<_, String>(4)?,
        "room": row.get::<_, Option<String>>(5)?,
        "isStable": row.get::<_, i64>(6)? != 0,
        "weekStartDate": row.get::<_, Option<String>>(7)?,
        "stableLessonId": row.get::<_, Option<String>>(8)?,
    });
    match value {
        JsonValue::Object(map) => Ok(map),
        _ => Ok(LessonRecord::new()),
    }
}

fn field_str(rec: &LessonRecord, key: &str) -> anyhow::Result<String> {
    rec.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .with_context(|| format!("lesson record missing {}", key))
}

fn field_opt_str(rec: &LessonRecord, key: &str) -> Option<String> {
    rec.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn field_i64(rec: &LessonRecord, key: &str) -> anyhow::Result<i64> {
    rec.get(key)
        .and_then(|v| v.as_i64())
        .with_context(|| format!("lesson record missing {}", key))
}

fn field_bool(rec: &LessonRecord, key: &str) -> anyhow::Result<bool> {
    rec.get(key)
        .and_then(|v| v.as_bool())
        .with_context(|| format!("lesson record missing {}", key))
}

impl ScheduleStore for SqliteScheduleStore<'_> {
    fn list_override_lessons(
        &self,
        class_id: &str,
        week_anchor: NaiveDate,
    ) -> anyhow::Result<Vec<LessonRecord>> {
        let sql = format!(
            "SELECT {LESSON_COLUMNS}
             FROM lessons l
             JOIN subjects s ON s.id = l.subject_id
             WHERE s.class_id = ?1 AND l.is_stable = 0 AND l.week_start_date = ?2
             ORDER BY l.rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![class_id, week_anchor.format("%Y-%m-%d").to_string()],
                lesson_row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_stable_lessons(&self, class_id: &str) -> anyhow::Result<Vec<LessonRecord>> {
        let sql = format!(
            "SELECT {LESSON_COLUMNS}
             FROM lessons l
             JOIN subjects s ON s.id = l.subject_id
             WHERE s.class_id = ?1 AND l.is_stable = 1
             ORDER BY l.rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([class_id], lesson_row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn fetch_lesson(&self, lesson_id: &str) -> anyhow::Result<Option<LessonRecord>> {
        let sql = format!("SELECT {LESSON_COLUMNS} FROM lessons l WHERE l.id = ?1");
        let rec = self
            .conn
            .query_row(&sql, [lesson_id], lesson_row_to_record)
            .optional()?;
        Ok(rec)
    }

    fn fetch_subject(&self, subject_id: &str) -> anyhow::Result<Option<Subject>> {
        let subject = self
            .conn
            .query_row(
                "SELECT id, class_id, name, teacher_id FROM subjects WHERE id = ?1",
                [subject_id],
                |row| {
                    Ok(Subject {
                        id: row.get(0)?,
                        class_id: row.get(1)?,
                        name: row.get(2)?,
                        teacher_id: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(subject)
    }

    fn fetch_class_school(&self, class_id: &str) -> anyhow::Result<Option<SchoolRef>> {
        let school = self
            .conn
            .query_row(
                "SELECT sc.id, sc.name
                 FROM classes c
                 JOIN schools sc ON sc.id = c.school_id
                 WHERE c.id = ?1",
                [class_id],
                |row| {
                    Ok(SchoolRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(school)
    }

    fn create_lesson_record(&self, fields: &LessonRecord) -> anyhow::Result<LessonRecord> {
        let id = field_str(fields, "id")?;
        let day = field_i64(fields, "dayOfWeek")?;
        self.conn.execute(
            "INSERT INTO lessons(
                id, subject_id, day_of_week, start_time, end_time, room,
                is_stable, week_start_date, stable_lesson_id
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                field_str(fields, "subjectId")?,
                day_to_storage(day),
                field_str(fields, "startTime")?,
                field_str(fields, "endTime")?,
                field_opt_str(fields, "room"),
                field_bool(fields, "isStable")? as i64,
                field_opt_str(fields, "weekStartDate"),
                field_opt_str(fields, "stableLessonId"),
            ],
        )?;
        // Round-trip through the row mapper so every record the engine sees
        // comes from one place.
        self.fetch_lesson(&id)?
            .with_context(|| format!("lesson {} vanished after insert", id))
    }

    fn update_lesson_record(
        &self,
        lesson_id: &str,
        fields: &LessonRecord,
    ) -> anyhow::Result<LessonRecord> {
        let day = field_i64(fields, "dayOfWeek")?;
        let changed = self.conn.execute(
            "UPDATE lessons SET
                subject_id = ?, day_of_week = ?, start_time = ?, end_time = ?,
                room = ?, week_start_date = ?, stable_lesson_id = ?
             WHERE id = ?",
            params![
                field_str(fields, "subjectId")?,
                day_to_storage(day),
                field_str(fields, "startTime")?,
                field_str(fields, "endTime")?,
                field_opt_str(fields, "room"),
                field_opt_str(fields, "weekStartDate"),
                field_opt_str(fields, "stableLessonId"),
                lesson_id,
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("no lesson row with id {}", lesson_id);
        }
        self.fetch_lesson(lesson_id)?
            .with_context(|| format!("lesson {} vanished after update", lesson_id))
    }

    fn delete_lesson_record(&self, lesson_id: &str) -> anyhow::Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM lessons WHERE id = ?", [lesson_id])?;
        Ok(deleted > 0)
    }
}
