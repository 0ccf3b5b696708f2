use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Fixed subject palette. Colors are derived from the subject id on every
/// call and never stored, so the palette order is part of the contract.
pub const SUBJECT_PALETTE: [&str; 15] = [
    "#E57373", "#F06292", "#BA68C8", "#9575CD", "#7986CB", "#64B5F6", "#4FC3F7", "#4DD0E1",
    "#4DB6AC", "#81C784", "#AED581", "#FFD54F", "#FFB74D", "#FF8A65", "#A1887F",
];

/// Deterministic subject color: first four digest bytes, big-endian, mod
/// palette size. SHA-256 keeps the mapping identical across runs and
/// platforms, unlike the std hasher.
pub fn color_for_subject(subject_id: &str) -> &'static str {
    let digest = Sha256::digest(subject_id.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    SUBJECT_PALETTE[n as usize % SUBJECT_PALETTE.len()]
}

/// Application numbering is 1=Monday..7=Sunday; the store keeps
/// 0=Sunday,1..6=Monday..Saturday. Translated in the store adapter and
/// nowhere else.
pub fn day_to_storage(day: i64) -> i64 {
    if day == 7 {
        0
    } else {
        day
    }
}

pub fn day_from_storage(day: i64) -> i64 {
    if day == 0 {
        7
    } else {
        day
    }
}

/// Monday of the ISO week containing `date`. Every date inside one week
/// maps to the same anchor, which is what scopes override lessons.
pub fn monday_anchor(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Strict HH:MM / HH:MM:SS to minutes since midnight. Seconds are accepted
/// but do not participate in ordering.
pub fn parse_time_minutes(raw: &str) -> Option<i64> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return None;
    }
    for part in &parts {
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    let hour: i64 = parts[0].parse().ok()?;
    let minute: i64 = parts[1].parse().ok()?;
    let second: i64 = if parts.len() == 3 {
        parts[2].parse().ok()?
    } else {
        0
    };
    if hour > 23 || minute > 59 || second > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    fn new(field: &str, reason: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// All collected field violations, in reporting order.
    Validation(Vec<FieldViolation>),
    /// Subject/class relationship mismatch. Create-time only.
    Referential(String),
    NotFound(String),
    /// Underlying store failure, wrapped once with the attempted operation.
    Storage(anyhow::Error),
}

fn storage_error(cause: anyhow::Error, op: String) -> EngineError {
    EngineError::Storage(cause.context(op))
}

/// A raw store row. Loosely typed on purpose: rows only become `Lesson`s
/// through `Lesson::from_record`, never by field access elsewhere.
pub type LessonRecord = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordError {
    pub field: String,
    pub reason: String,
}

impl RecordError {
    fn new(field: &str, reason: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lesson record field {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for RecordError {}

fn record_str(rec: &LessonRecord, key: &str) -> Result<String, RecordError> {
    rec.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| RecordError::new(key, "missing or not a string"))
}

fn record_opt_str(rec: &LessonRecord, key: &str) -> Result<Option<String>, RecordError> {
    match rec.get(key) {
        None => Ok(None),
        Some(JsonValue::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| RecordError::new(key, "not a string")),
    }
}

fn record_i64(rec: &LessonRecord, key: &str) -> Result<i64, RecordError> {
    rec.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RecordError::new(key, "missing or not an integer"))
}

fn record_bool(rec: &LessonRecord, key: &str) -> Result<bool, RecordError> {
    rec.get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| RecordError::new(key, "missing or not a boolean"))
}

/// One lesson slot, either from the stable weekly template
/// (`is_stable == true`, no week) or scoped to a single week
/// (`is_stable == false`, `week_start_date` is that week's Monday).
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub id: String,
    pub subject_id: String,
    pub day_of_week: i64,
    pub start_time: String,
    pub end_time: String,
    pub room: Option<String>,
    pub is_stable: bool,
    pub week_start_date: Option<NaiveDate>,
    pub stable_lesson_id: Option<String>,
}

impl Lesson {
    /// The typed boundary for raw store rows. Anything that fails here is a
    /// storage-side defect; untyped data never travels past this point.
    pub fn from_record(rec: &LessonRecord) -> Result<Lesson, RecordError> {
        let id = record_str(rec, "id")?;
        let subject_id = record_str(rec, "subjectId")?;
        let day_of_week = record_i64(rec, "dayOfWeek")?;
        if !(1..=7).contains(&day_of_week) {
            return Err(RecordError::new("dayOfWeek", "out of canonical range 1..7"));
        }
        let start_time = record_str(rec, "startTime")?;
        if parse_time_minutes(&start_time).is_none() {
            return Err(RecordError::new("startTime", "bad time format"));
        }
        let end_time = record_str(rec, "endTime")?;
        if parse_time_minutes(&end_time).is_none() {
            return Err(RecordError::new("endTime", "bad time format"));
        }
        let room = record_opt_str(rec, "room")?;
        let is_stable = record_bool(rec, "isStable")?;
        let week_start_date = match record_opt_str(rec, "weekStartDate")? {
            None => None,
            Some(raw) => Some(
                parse_iso_date(&raw).ok_or_else(|| RecordError::new("weekStartDate", "bad date"))?,
            ),
        };
        // Week scoping is mutually exclusive with the stable flag.
        if is_stable && week_start_date.is_some() {
            return Err(RecordError::new("weekStartDate", "set on a stable lesson"));
        }
        if !is_stable && week_start_date.is_none() {
            return Err(RecordError::new("weekStartDate", "missing on an override lesson"));
        }
        let stable_lesson_id = record_opt_str(rec, "stableLessonId")?;
        Ok(Lesson {
            id,
            subject_id,
            day_of_week,
            start_time,
            end_time,
            room,
            is_stable,
            week_start_date,
            stable_lesson_id,
        })
    }

    pub fn start_minutes(&self) -> i64 {
        parse_time_minutes(&self.start_time).unwrap_or(0)
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "id": self.id,
            "subjectId": self.subject_id,
            "dayOfWeek": self.day_of_week,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "room": self.room.clone(),
            "isStable": self.is_stable,
            "weekStartDate": self.week_start_date.map(|d| d.format("%Y-%m-%d").to_string()),
            "stableLessonId": self.stable_lesson_id.clone(),
        })
    }

    pub fn to_record(&self) -> LessonRecord {
        match self.to_json() {
            JsonValue::Object(map) => map,
            _ => LessonRecord::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub teacher_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchoolRef {
    pub id: String,
    pub name: String,
}

/// The abstract store the engine runs against. The SQLite adapter in
/// `db.rs` is the production implementation; tests use an in-memory fake.
pub trait ScheduleStore {
    fn list_override_lessons(
        &self,
        class_id: &str,
        week_anchor: NaiveDate,
    ) -> anyhow::Result<Vec<LessonRecord>>;
    fn list_stable_lessons(&self, class_id: &str) -> anyhow::Result<Vec<LessonRecord>>;
    fn fetch_lesson(&self, lesson_id: &str) -> anyhow::Result<Option<LessonRecord>>;
    fn fetch_subject(&self, subject_id: &str) -> anyhow::Result<Option<Subject>>;
    fn fetch_class_school(&self, class_id: &str) -> anyhow::Result<Option<SchoolRef>>;
    fn create_lesson_record(&self, fields: &LessonRecord) -> anyhow::Result<LessonRecord>;
    fn update_lesson_record(
        &self,
        lesson_id: &str,
        fields: &LessonRecord,
    ) -> anyhow::Result<LessonRecord>;
    fn delete_lesson_record(&self, lesson_id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLesson {
    pub lesson: Lesson,
    pub color: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSchedule {
    pub class_id: String,
    pub week_start_date: Option<NaiveDate>,
    pub lessons: Vec<ResolvedLesson>,
}

impl ResolvedSchedule {
    pub fn to_json(&self) -> JsonValue {
        let lessons: Vec<JsonValue> = self
            .lessons
            .iter()
            .map(|entry| {
                let mut obj = entry.lesson.to_json();
                obj["color"] = json!(entry.color);
                obj
            })
            .collect();
        json!({
            "classId": self.class_id,
            "weekStartDate": self.week_start_date.map(|d| d.format("%Y-%m-%d").to_string()),
            "lessons": lessons,
        })
    }
}

enum ResolutionTier {
    WeekOverrides,
    StableTemplate,
}

/// Effective schedule for a class and optional target week.
///
/// Override lessons for the anchored week, when any exist, replace the
/// stable template wholesale for that week; the two sets are never merged
/// slot-by-slot. Falling through to the stable template is a designed path,
/// not a failure.
pub fn resolve_schedule<S: ScheduleStore>(
    store: &S,
    class_id: &str,
    week_start: Option<NaiveDate>,
) -> Result<ResolvedSchedule, EngineError> {
    let anchor = week_start.map(monday_anchor);

    // Tiers in precedence order; the first non-empty set wins.
    let tiers = [ResolutionTier::WeekOverrides, ResolutionTier::StableTemplate];
    let mut rows: Vec<LessonRecord> = Vec::new();
    for tier in tiers {
        rows = match tier {
            ResolutionTier::WeekOverrides => match anchor {
                Some(a) => store.list_override_lessons(class_id, a).map_err(|e| {
                    storage_error(e, format!("list override lessons: class={class_id} week={a}"))
                })?,
                None => Vec::new(),
            },
            ResolutionTier::StableTemplate => store
                .list_stable_lessons(class_id)
                .map_err(|e| storage_error(e, format!("list stable lessons: class={class_id}")))?,
        };
        if !rows.is_empty() {
            break;
        }
    }

    let mut lessons = Vec::with_capacity(rows.len());
    for rec in &rows {
        let lesson = Lesson::from_record(rec).map_err(|e| {
            storage_error(
                anyhow::Error::new(e),
                format!("decode lesson row: class={class_id}"),
            )
        })?;
        lessons.push(lesson);
    }
    // Stable sort: rows arrive in store insertion order, which stays the
    // tie-breaker for equal (day, start) keys.
    lessons.sort_by_key(|l| (l.day_of_week, l.start_minutes()));

    let lessons = lessons
        .into_iter()
        .map(|lesson| ResolvedLesson {
            color: color_for_subject(&lesson.subject_id),
            lesson,
        })
        .collect();

    Ok(ResolvedSchedule {
        class_id: class_id.to_string(),
        week_start_date: anchor,
        lessons,
    })
}

fn validate_schedule_fields(
    day_of_week: i64,
    start_time: &str,
    end_time: &str,
) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    if !(1..=7).contains(&day_of_week) {
        violations.push(FieldViolation::new("day_of_week", "day_of_week out of range"));
    }
    let start = parse_time_minutes(start_time);
    if start.is_none() {
        violations.push(FieldViolation::new("start_time", "bad time format"));
    }
    let end = parse_time_minutes(end_time);
    if end.is_none() {
        violations.push(FieldViolation::new("end_time", "bad time format"));
    }
    if let (Some(start), Some(end)) = (start, end) {
        if end <= start {
            violations.push(FieldViolation::new("end_time", "end before start"));
        }
    }
    violations
}

/// All violations are collected in reporting order, never short-circuited.
pub fn validate_lesson_fields(
    day_of_week: i64,
    start_time: &str,
    end_time: &str,
    subject_id: &str,
    class_id: &str,
) -> Vec<FieldViolation> {
    let mut violations = validate_schedule_fields(day_of_week, start_time, end_time);
    if subject_id.trim().is_empty() {
        violations.push(FieldViolation::new("subject_id", "subject_id required"));
    }
    if class_id.trim().is_empty() {
        violations.push(FieldViolation::new("class_id", "class_id required"));
    }
    violations
}

fn validate_week_scoping(is_stable: bool, week_start_date: Option<NaiveDate>) -> Option<FieldViolation> {
    match (is_stable, week_start_date) {
        (true, Some(_)) => Some(FieldViolation::new(
            "week_start_date",
            "week_start_date not allowed",
        )),
        (false, None) => Some(FieldViolation::new(
            "week_start_date",
            "week_start_date required",
        )),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LessonDraft {
    pub subject_id: String,
    pub class_id: String,
    pub day_of_week: i64,
    pub start_time: String,
    pub end_time: String,
    pub room: Option<String>,
    pub is_stable: bool,
    pub week_start_date: Option<NaiveDate>,
    pub stable_lesson_id: Option<String>,
}

pub fn create_lesson<S: ScheduleStore>(
    store: &S,
    draft: &LessonDraft,
) -> Result<Lesson, EngineError> {
    let mut violations = validate_lesson_fields(
        draft.day_of_week,
        &draft.start_time,
        &draft.end_time,
        &draft.subject_id,
        &draft.class_id,
    );
    if let Some(v) = validate_week_scoping(draft.is_stable, draft.week_start_date) {
        violations.push(v);
    }
    if !violations.is_empty() {
        return Err(EngineError::Validation(violations));
    }

    // Referential check, create only: the lesson is reached through its
    // subject, so the subject must belong to the target class.
    let subject = store
        .fetch_subject(&draft.subject_id)
        .map_err(|e| storage_error(e, format!("fetch subject {}", draft.subject_id)))?
        .ok_or_else(|| EngineError::Referential("subject not found".to_string()))?;
    if subject.class_id != draft.class_id {
        return Err(EngineError::Referential(
            "subject does not belong to class".to_string(),
        ));
    }

    let lesson = Lesson {
        id: Uuid::new_v4().to_string(),
        subject_id: draft.subject_id.clone(),
        day_of_week: draft.day_of_week,
        start_time: draft.start_time.clone(),
        end_time: draft.end_time.clone(),
        room: draft.room.clone(),
        is_stable: draft.is_stable,
        // Writers normalize the same way the resolver does, so a mid-week
        // date can never create a week the resolver would miss.
        week_start_date: draft.week_start_date.map(monday_anchor),
        stable_lesson_id: draft.stable_lesson_id.clone(),
    };

    let created = store.create_lesson_record(&lesson.to_record()).map_err(|e| {
        storage_error(
            e,
            format!(
                "create lesson record: subject={} day={}",
                draft.subject_id, draft.day_of_week
            ),
        )
    })?;
    Lesson::from_record(&created)
        .map_err(|e| storage_error(anyhow::Error::new(e), "decode created lesson row".to_string()))
}

/// Partial update. `None` leaves a field untouched; the nested `Option`s
/// distinguish "clear the field" from "leave it alone".
#[derive(Debug, Clone, Default)]
pub struct LessonPatch {
    pub subject_id: Option<String>,
    pub day_of_week: Option<i64>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub room: Option<Option<String>>,
    pub week_start_date: Option<Option<NaiveDate>>,
    pub stable_lesson_id: Option<Option<String>>,
}

impl LessonPatch {
    pub fn is_empty(&self) -> bool {
        self.subject_id.is_none()
            && self.day_of_week.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.room.is_none()
            && self.week_start_date.is_none()
            && self.stable_lesson_id.is_none()
    }
}

pub fn update_lesson<S: ScheduleStore>(
    store: &S,
    lesson_id: &str,
    patch: &LessonPatch,
) -> Result<Lesson, EngineError> {
    let existing_rec = store
        .fetch_lesson(lesson_id)
        .map_err(|e| storage_error(e, format!("fetch lesson {lesson_id}")))?
        .ok_or_else(|| EngineError::NotFound(format!("lesson not found: {lesson_id}")))?;
    let existing = Lesson::from_record(&existing_rec)
        .map_err(|e| storage_error(anyhow::Error::new(e), format!("decode lesson row {lesson_id}")))?;

    // The merged view is what gets re-validated, so cross-field rules hold
    // even when only one side of a pair was touched. The stable flag itself
    // is fixed at creation.
    let merged = Lesson {
        id: existing.id.clone(),
        subject_id: patch.subject_id.clone().unwrap_or(existing.subject_id),
        day_of_week: patch.day_of_week.unwrap_or(existing.day_of_week),
        start_time: patch.start_time.clone().unwrap_or(existing.start_time),
        end_time: patch.end_time.clone().unwrap_or(existing.end_time),
        room: patch.room.clone().unwrap_or(existing.room),
        is_stable: existing.is_stable,
        week_start_date: patch
            .week_start_date
            .unwrap_or(existing.week_start_date)
            .map(monday_anchor),
        stable_lesson_id: patch
            .stable_lesson_id
            .clone()
            .unwrap_or(existing.stable_lesson_id),
    };

    let mut violations =
        validate_schedule_fields(merged.day_of_week, &merged.start_time, &merged.end_time);
    if merged.subject_id.trim().is_empty() {
        violations.push(FieldViolation::new("subject_id", "subject_id required"));
    }
    if let Some(v) = validate_week_scoping(merged.is_stable, merged.week_start_date) {
        violations.push(v);
    }
    if !violations.is_empty() {
        return Err(EngineError::Validation(violations));
    }

    let updated = store
        .update_lesson_record(lesson_id, &merged.to_record())
        .map_err(|e| storage_error(e, format!("update lesson record {lesson_id}")))?;
    Lesson::from_record(&updated)
        .map_err(|e| storage_error(anyhow::Error::new(e), "decode updated lesson row".to_string()))
}

pub fn delete_lesson<S: ScheduleStore>(store: &S, lesson_id: &str) -> Result<(), EngineError> {
    let deleted = store
        .delete_lesson_record(lesson_id)
        .map_err(|e| storage_error(e, format!("delete lesson record {lesson_id}")))?;
    if deleted {
        Ok(())
    } else {
        Err(EngineError::NotFound(format!("lesson not found: {lesson_id}")))
    }
}

/// Class-to-school memo. Lives in the IPC state, not inside the engine, so
/// the refresh action (and tests) control its lifecycle. Negative lookups
/// are cached too; only `invalidate` ever clears it.
#[derive(Debug, Default)]
pub struct SchoolDirectoryCache {
    by_class: HashMap<String, Option<SchoolRef>>,
}

impl SchoolDirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn school_for<S: ScheduleStore>(
        &mut self,
        store: &S,
        class_id: &str,
    ) -> Result<Option<SchoolRef>, EngineError> {
        if let Some(hit) = self.by_class.get(class_id) {
            return Ok(hit.clone());
        }
        let school = store
            .fetch_class_school(class_id)
            .map_err(|e| storage_error(e, format!("fetch school for class {class_id}")))?;
        self.by_class.insert(class_id.to_string(), school.clone());
        Ok(school)
    }

    pub fn invalidate(&mut self) {
        self.by_class.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn date(raw: &str) -> NaiveDate {
        parse_iso_date(raw).expect("test date")
    }

    fn rec(
        id: &str,
        subject_id: &str,
        day: i64,
        start: &str,
        end: &str,
        week: Option<&str>,
    ) -> LessonRecord {
        let value = json!({
            "id": id,
            "subjectId": subject_id,
            "dayOfWeek": day,
            "startTime": start,
            "endTime": end,
            "room": JsonValue::Null,
            "isStable": week.is_none(),
            "weekStartDate": week,
            "stableLessonId": JsonValue::Null,
        });
        match value {
            JsonValue::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[derive(Default)]
    struct FakeStore {
        stable: Vec<LessonRecord>,
        overrides: Vec<LessonRecord>,
        subjects: Vec<Subject>,
        school: Option<SchoolRef>,
        school_fetches: Cell<usize>,
        listing_fails: bool,
        delete_hits: bool,
    }

    impl ScheduleStore for FakeStore {
        fn list_override_lessons(
            &self,
            _class_id: &str,
            week_anchor: NaiveDate,
        ) -> anyhow::Result<Vec<LessonRecord>> {
            if self.listing_fails {
                anyhow::bail!("store offline");
            }
            let anchor = week_anchor.format("%Y-%m-%d").to_string();
            Ok(self
                .overrides
                .iter()
                .filter(|r| r.get("weekStartDate").and_then(|v| v.as_str()) == Some(anchor.as_str()))
                .cloned()
                .collect())
        }

        fn list_stable_lessons(&self, _class_id: &str) -> anyhow::Result<Vec<LessonRecord>> {
            if self.listing_fails {
                anyhow::bail!("store offline");
            }
            Ok(self.stable.clone())
        }

        fn fetch_lesson(&self, lesson_id: &str) -> anyhow::Result<Option<LessonRecord>> {
            Ok(self
                .stable
                .iter()
                .chain(self.overrides.iter())
                .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(lesson_id))
                .cloned())
        }

        fn fetch_subject(&self, subject_id: &str) -> anyhow::Result<Option<Subject>> {
            Ok(self.subjects.iter().find(|s| s.id == subject_id).cloned())
        }

        fn fetch_class_school(&self, _class_id: &str) -> anyhow::Result<Option<SchoolRef>> {
            self.school_fetches.set(self.school_fetches.get() + 1);
            Ok(self.school.clone())
        }

        fn create_lesson_record(&self, fields: &LessonRecord) -> anyhow::Result<LessonRecord> {
            Ok(fields.clone())
        }

        fn update_lesson_record(
            &self,
            _lesson_id: &str,
            fields: &LessonRecord,
        ) -> anyhow::Result<LessonRecord> {
            Ok(fields.clone())
        }

        fn delete_lesson_record(&self, _lesson_id: &str) -> anyhow::Result<bool> {
            Ok(self.delete_hits)
        }
    }

    fn store_with_stable_week() -> FakeStore {
        FakeStore {
            stable: vec![
                rec("l-math", "subj-math", 1, "08:00", "08:45", None),
                rec("l-sci", "subj-sci", 2, "09:00", "09:45", None),
            ],
            overrides: vec![rec(
                "l-hist",
                "subj-hist",
                1,
                "08:00",
                "08:45",
                Some("2024-06-03"),
            )],
            subjects: vec![Subject {
                id: "subj-math".to_string(),
                class_id: "class-a".to_string(),
                name: "Mathematics".to_string(),
                teacher_id: None,
            }],
            ..FakeStore::default()
        }
    }

    #[test]
    fn day_numbering_round_trips() {
        for d in 0..=6 {
            assert_eq!(day_to_storage(day_from_storage(d)), d);
        }
        for d in 1..=7 {
            assert_eq!(day_from_storage(day_to_storage(d)), d);
        }
        assert_eq!(day_to_storage(7), 0);
        assert_eq!(day_from_storage(0), 7);
    }

    #[test]
    fn monday_anchor_is_constant_within_a_week() {
        let monday = date("2024-06-03");
        for offset in 0..7 {
            let day = monday + Duration::days(offset);
            assert_eq!(monday_anchor(day), monday, "offset {offset}");
        }
        assert_eq!(monday_anchor(date("2024-06-10")), date("2024-06-10"));
    }

    #[test]
    fn subject_colors_are_stable_and_in_palette() {
        let distinct: std::collections::HashSet<&str> = SUBJECT_PALETTE.iter().copied().collect();
        assert_eq!(distinct.len(), 15);
        for id in ["subj-math", "subj-sci", "", "äöü", "a-very-long-subject-identifier"] {
            let color = color_for_subject(id);
            assert_eq!(color, color_for_subject(id));
            assert!(SUBJECT_PALETTE.contains(&color));
        }
    }

    #[test]
    fn time_parsing_is_strict() {
        assert_eq!(parse_time_minutes("08:00"), Some(480));
        assert_eq!(parse_time_minutes("08:00:30"), Some(480));
        assert_eq!(parse_time_minutes("23:59"), Some(1439));
        assert_eq!(parse_time_minutes("8:00"), None);
        assert_eq!(parse_time_minutes("08:60"), None);
        assert_eq!(parse_time_minutes("24:00"), None);
        assert_eq!(parse_time_minutes("0800"), None);
        assert_eq!(parse_time_minutes("08:00:61"), None);
        assert_eq!(parse_time_minutes(""), None);
    }

    #[test]
    fn validator_collects_all_violations_in_reporting_order() {
        let violations = validate_lesson_fields(0, "junk", "also junk", "", "");
        let reasons: Vec<&str> = violations.iter().map(|v| v.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "day_of_week out of range",
                "bad time format",
                "bad time format",
                "subject_id required",
                "class_id required",
            ]
        );
    }

    #[test]
    fn validator_rejects_end_not_after_start() {
        let violations = validate_lesson_fields(1, "08:45", "08:45", "s", "c");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].reason, "end before start");

        let violations = validate_lesson_fields(1, "09:00", "08:00", "s", "c");
        assert_eq!(violations[0].reason, "end before start");

        assert!(validate_lesson_fields(1, "08:00", "08:45", "s", "c").is_empty());
    }

    #[test]
    fn record_boundary_accepts_well_formed_rows() {
        let lesson = Lesson::from_record(&rec("l1", "s1", 7, "10:00", "10:45", None)).unwrap();
        assert_eq!(lesson.day_of_week, 7);
        assert!(lesson.is_stable);
        assert_eq!(lesson.start_minutes(), 600);

        let back = Lesson::from_record(&lesson.to_record()).unwrap();
        assert_eq!(back, lesson);
    }

    #[test]
    fn record_boundary_rejects_malformed_rows() {
        let mut broken = rec("l1", "s1", 1, "08:00", "08:45", None);
        broken.remove("subjectId");
        assert_eq!(Lesson::from_record(&broken).unwrap_err().field, "subjectId");

        let broken = rec("l1", "s1", 8, "08:00", "08:45", None);
        assert_eq!(Lesson::from_record(&broken).unwrap_err().field, "dayOfWeek");

        // Override rows must carry their week; stable rows must not.
        let mut broken = rec("l1", "s1", 1, "08:00", "08:45", Some("2024-06-03"));
        broken.insert("isStable".to_string(), json!(true));
        assert_eq!(
            Lesson::from_record(&broken).unwrap_err().field,
            "weekStartDate"
        );
        let mut broken = rec("l1", "s1", 1, "08:00", "08:45", None);
        broken.insert("isStable".to_string(), json!(false));
        assert_eq!(
            Lesson::from_record(&broken).unwrap_err().field,
            "weekStartDate"
        );
    }

    #[test]
    fn resolve_without_week_uses_stable_template() {
        let store = store_with_stable_week();
        let resolved = resolve_schedule(&store, "class-a", None).unwrap();
        assert_eq!(resolved.week_start_date, None);
        let ids: Vec<&str> = resolved.lessons.iter().map(|l| l.lesson.id.as_str()).collect();
        assert_eq!(ids, vec!["l-math", "l-sci"]);
    }

    #[test]
    fn resolve_override_week_replaces_template_wholesale() {
        let store = store_with_stable_week();
        // The stable Tuesday lesson must not be merged in.
        let resolved = resolve_schedule(&store, "class-a", Some(date("2024-06-03"))).unwrap();
        let ids: Vec<&str> = resolved.lessons.iter().map(|l| l.lesson.id.as_str()).collect();
        assert_eq!(ids, vec!["l-hist"]);
        assert_eq!(resolved.week_start_date, Some(date("2024-06-03")));

        // A mid-week date resolves to the same week.
        let midweek = resolve_schedule(&store, "class-a", Some(date("2024-06-05"))).unwrap();
        assert_eq!(midweek.week_start_date, Some(date("2024-06-03")));
        assert_eq!(midweek.lessons.len(), 1);
    }

    #[test]
    fn resolve_falls_back_to_stable_for_weeks_without_overrides() {
        let store = store_with_stable_week();
        let resolved = resolve_schedule(&store, "class-a", Some(date("2024-06-10"))).unwrap();
        let ids: Vec<&str> = resolved.lessons.iter().map(|l| l.lesson.id.as_str()).collect();
        assert_eq!(ids, vec!["l-math", "l-sci"]);
        assert_eq!(resolved.week_start_date, Some(date("2024-06-10")));
    }

    #[test]
    fn resolve_sorts_by_day_then_start_keeping_insertion_order_on_ties() {
        let store = FakeStore {
            stable: vec![
                rec("l-late", "s1", 2, "10:00", "10:45", None),
                rec("l-tie-first", "s2", 1, "08:00", "08:45", None),
                rec("l-tie-second", "s3", 1, "08:00", "08:45", None),
                rec("l-early", "s4", 1, "07:30", "07:50", None),
            ],
            ..FakeStore::default()
        };
        let resolved = resolve_schedule(&store, "class-a", None).unwrap();
        let ids: Vec<&str> = resolved.lessons.iter().map(|l| l.lesson.id.as_str()).collect();
        assert_eq!(ids, vec!["l-early", "l-tie-first", "l-tie-second", "l-late"]);
    }

    #[test]
    fn resolve_decorates_each_lesson_with_its_subject_color() {
        let store = store_with_stable_week();
        let resolved = resolve_schedule(&store, "class-a", None).unwrap();
        for entry in &resolved.lessons {
            assert_eq!(entry.color, color_for_subject(&entry.lesson.subject_id));
        }
    }

    #[test]
    fn resolve_wraps_store_failures() {
        let store = FakeStore {
            listing_fails: true,
            ..FakeStore::default()
        };
        match resolve_schedule(&store, "class-a", None) {
            Err(EngineError::Storage(e)) => {
                let chain = format!("{e:#}");
                assert!(chain.contains("class=class-a"), "context missing: {chain}");
                assert!(chain.contains("store offline"), "cause missing: {chain}");
            }
            other => panic!("expected storage error, got {other:?}"),
        }
    }

    fn draft(subject_id: &str, class_id: &str) -> LessonDraft {
        LessonDraft {
            subject_id: subject_id.to_string(),
            class_id: class_id.to_string(),
            day_of_week: 1,
            start_time: "08:00".to_string(),
            end_time: "08:45".to_string(),
            room: None,
            is_stable: true,
            week_start_date: None,
            stable_lesson_id: None,
        }
    }

    #[test]
    fn create_rejects_subject_from_another_class() {
        let store = store_with_stable_week();
        match create_lesson(&store, &draft("subj-math", "class-b")) {
            Err(EngineError::Referential(message)) => {
                assert_eq!(message, "subject does not belong to class");
            }
            other => panic!("expected referential error, got {other:?}"),
        }
        match create_lesson(&store, &draft("subj-ghost", "class-a")) {
            Err(EngineError::Referential(message)) => assert_eq!(message, "subject not found"),
            other => panic!("expected referential error, got {other:?}"),
        }
    }

    #[test]
    fn create_collects_week_scoping_violations() {
        let store = store_with_stable_week();
        let mut d = draft("subj-math", "class-a");
        d.is_stable = false;
        match create_lesson(&store, &d) {
            Err(EngineError::Validation(violations)) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].reason, "week_start_date required");
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        let mut d = draft("subj-math", "class-a");
        d.week_start_date = Some(date("2024-06-03"));
        match create_lesson(&store, &d) {
            Err(EngineError::Validation(violations)) => {
                assert_eq!(violations[0].reason, "week_start_date not allowed");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn create_normalizes_week_to_monday_anchor() {
        let store = store_with_stable_week();
        let mut d = draft("subj-math", "class-a");
        d.is_stable = false;
        d.week_start_date = Some(date("2024-06-05"));
        let lesson = create_lesson(&store, &d).unwrap();
        assert_eq!(lesson.week_start_date, Some(date("2024-06-03")));
    }

    #[test]
    fn update_revalidates_the_merged_lesson() {
        let store = store_with_stable_week();
        let patch = LessonPatch {
            end_time: Some("07:59".to_string()),
            ..LessonPatch::default()
        };
        match update_lesson(&store, "l-math", &patch) {
            Err(EngineError::Validation(violations)) => {
                assert_eq!(violations[0].reason, "end before start");
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        let patch = LessonPatch {
            start_time: Some("10:00".to_string()),
            end_time: Some("10:45".to_string()),
            room: Some(Some("B12".to_string())),
            ..LessonPatch::default()
        };
        let updated = update_lesson(&store, "l-math", &patch).unwrap();
        assert_eq!(updated.start_time, "10:00");
        assert_eq!(updated.room.as_deref(), Some("B12"));
        assert_eq!(updated.day_of_week, 1);
    }

    #[test]
    fn update_of_missing_lesson_is_not_found() {
        let store = store_with_stable_week();
        match update_lesson(&store, "l-ghost", &LessonPatch::default()) {
            Err(EngineError::NotFound(_)) => {}
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn delete_maps_store_miss_to_not_found() {
        let store = FakeStore {
            delete_hits: true,
            ..FakeStore::default()
        };
        assert!(delete_lesson(&store, "l-any").is_ok());

        let store = FakeStore::default();
        match delete_lesson(&store, "l-any") {
            Err(EngineError::NotFound(_)) => {}
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[test]
    fn school_cache_memoizes_until_invalidated() {
        let store = FakeStore {
            school: Some(SchoolRef {
                id: "school-1".to_string(),
                name: "Northside".to_string(),
            }),
            ..FakeStore::default()
        };
        let mut cache = SchoolDirectoryCache::new();
        let first = cache.school_for(&store, "class-a").unwrap();
        let second = cache.school_for(&store, "class-a").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.school_fetches.get(), 1);

        cache.invalidate();
        let _ = cache.school_for(&store, "class-a").unwrap();
        assert_eq!(store.school_fetches.get(), 2);
    }
}
