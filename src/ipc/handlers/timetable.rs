use crate::db::SqliteScheduleStore;
use crate::ipc::error::{engine_err, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, LessonDraft, LessonPatch, ScheduleStore};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn parse_opt_date(
    req: &Request,
    v: Option<&JsonValue>,
    key: &str,
) -> Result<Option<NaiveDate>, serde_json::Value> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let raw = v.as_str().ok_or_else(|| {
                err(&req.id, "bad_params", format!("{} must be string or null", key), None)
            })?;
            schedule::parse_iso_date(raw).map(Some).ok_or_else(|| {
                err(&req.id, "bad_params", format!("{} must be YYYY-MM-DD", key), None)
            })
        }
    }
}

fn ensure_class_exists(conn: &Connection, class_id: &str) -> Result<bool, rusqlite::Error> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM classes WHERE id = ? LIMIT 1",
            [class_id],
            |_r| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}

fn handle_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_start = match parse_opt_date(req, req.params.get("weekStartDate"), "weekStartDate") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match ensure_class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let store = SqliteScheduleStore::new(conn);
    let resolved = match schedule::resolve_schedule(&store, &class_id, week_start) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };
    let school = match state.school_cache.school_for(&store, &class_id) {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, e),
    };

    // Subject legend: one entry per distinct subject, carrying the same
    // derived color as its lessons.
    let mut legend: Vec<JsonValue> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for entry in &resolved.lessons {
        let subject_id = entry.lesson.subject_id.as_str();
        if !seen.insert(subject_id) {
            continue;
        }
        match store.fetch_subject(subject_id) {
            Ok(Some(subject)) => legend.push(json!({
                "id": subject.id,
                "name": subject.name,
                "teacherId": subject.teacher_id,
                "color": entry.color,
            })),
            Ok(None) => {}
            Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
        }
    }

    let mut result = resolved.to_json();
    result["subjects"] = json!(legend);
    result["school"] = match school {
        Some(s) => json!({ "id": s.id, "name": s.name }),
        None => JsonValue::Null,
    };
    ok(&req.id, result)
}

fn handle_lessons_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_start = match parse_opt_date(req, req.params.get("weekStartDate"), "weekStartDate") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match ensure_class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Raw sets for the editing UI, unlike resolve which picks a winner.
    let store = SqliteScheduleStore::new(conn);
    let stable = match store.list_stable_lessons(&class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
    };
    let overrides = match week_start.map(schedule::monday_anchor) {
        Some(anchor) => match store.list_override_lessons(&class_id, anchor) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", format!("{e:#}"), None),
        },
        None => Vec::new(),
    };

    ok(
        &req.id,
        json!({
            "stableLessons": stable,
            "overrideLessons": overrides,
        }),
    )
}

fn parse_lesson_input(req: &Request, class_id: &str) -> Result<LessonDraft, serde_json::Value> {
    let Some(input) = req.params.get("input").and_then(|v| v.as_object()) else {
        return Err(err(&req.id, "bad_params", "missing input", None));
    };

    let subject_id = match input.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return Err(err(&req.id, "bad_params", "input.subjectId is required", None)),
    };
    let day_of_week = match input.get("dayOfWeek").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => {
            return Err(err(&req.id, "bad_params", "input.dayOfWeek must be integer", None));
        }
    };
    let start_time = match input.get("startTime").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return Err(err(&req.id, "bad_params", "input.startTime is required", None)),
    };
    let end_time = match input.get("endTime").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return Err(err(&req.id, "bad_params", "input.endTime is required", None)),
    };
    let room = match input.get("room") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(_) => None,
            None => return Err(err(&req.id, "bad_params", "input.room must be string or null", None)),
        },
    };
    let is_stable = match input.get("isStable").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return Err(err(&req.id, "bad_params", "input.isStable must be boolean", None)),
    };
    let week_start_date = match parse_opt_date(req, input.get("weekStartDate"), "input.weekStartDate")
    {
        Ok(v) => v,
        Err(e) => return Err(e),
    };
    let stable_lesson_id = match input.get("stableLessonId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(_) => None,
            None => {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "input.stableLessonId must be string or null",
                    None,
                ))
            }
        },
    };

    Ok(LessonDraft {
        subject_id,
        class_id: class_id.to_string(),
        day_of_week,
        start_time,
        end_time,
        room,
        is_stable,
        week_start_date,
        stable_lesson_id,
    })
}

fn handle_lessons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ensure_class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let draft = match parse_lesson_input(req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let store = SqliteScheduleStore::new(conn);
    match schedule::create_lesson(&store, &draft) {
        Ok(lesson) => ok(&req.id, json!({ "lesson": lesson.to_json() })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn parse_lesson_patch(req: &Request) -> Result<LessonPatch, serde_json::Value> {
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(err(&req.id, "bad_params", "missing patch", None));
    };

    let mut out = LessonPatch::default();
    for (k, v) in patch {
        match k.as_str() {
            "subjectId" => {
                let Some(s) = v.as_str() else {
                    return Err(err(&req.id, "bad_params", "patch.subjectId must be string", None));
                };
                out.subject_id = Some(s.trim().to_string());
            }
            "dayOfWeek" => {
                let Some(n) = v.as_i64() else {
                    return Err(err(&req.id, "bad_params", "patch.dayOfWeek must be integer", None));
                };
                out.day_of_week = Some(n);
            }
            "startTime" => {
                let Some(s) = v.as_str() else {
                    return Err(err(&req.id, "bad_params", "patch.startTime must be string", None));
                };
                out.start_time = Some(s.trim().to_string());
            }
            "endTime" => {
                let Some(s) = v.as_str() else {
                    return Err(err(&req.id, "bad_params", "patch.endTime must be string", None));
                };
                out.end_time = Some(s.trim().to_string());
            }
            "room" => {
                if v.is_null() {
                    out.room = Some(None);
                } else if let Some(s) = v.as_str() {
                    let s = s.trim();
                    out.room = Some(if s.is_empty() { None } else { Some(s.to_string()) });
                } else {
                    return Err(err(&req.id, "bad_params", "patch.room must be string or null", None));
                }
            }
            "weekStartDate" => {
                if v.is_null() {
                    out.week_start_date = Some(None);
                } else {
                    let parsed = parse_opt_date(req, Some(v), "patch.weekStartDate")?;
                    out.week_start_date = Some(parsed);
                }
            }
            "stableLessonId" => {
                if v.is_null() {
                    out.stable_lesson_id = Some(None);
                } else if let Some(s) = v.as_str() {
                    out.stable_lesson_id = Some(Some(s.trim().to_string()));
                } else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        "patch.stableLessonId must be string or null",
                        None,
                    ));
                }
            }
            "isStable" => {
                return Err(err(&req.id, "bad_params", "patch.isStable cannot be changed", None));
            }
            _ => {
                return Err(err(&req.id, "bad_params", format!("unknown patch field: {}", k), None));
            }
        }
    }
    Ok(out)
}

fn handle_lessons_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match parse_lesson_patch(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if patch.is_empty() {
        return err(&req.id, "bad_params", "patch must touch at least one field", None);
    }

    let store = SqliteScheduleStore::new(conn);
    match schedule::update_lesson(&store, &lesson_id, &patch) {
        Ok(lesson) => ok(&req.id, json!({ "lesson": lesson.to_json() })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_lessons_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let lesson_id = match required_str(req, "lessonId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let store = SqliteScheduleStore::new(conn);
    match schedule::delete_lesson(&store, &lesson_id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => engine_err(&req.id, e),
    }
}

fn handle_refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.school_cache.invalidate();
    ok(&req.id, json!({ "refreshed": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.resolve" => Some(handle_resolve(state, req)),
        "timetable.lessons.list" => Some(handle_lessons_list(state, req)),
        "timetable.lessons.create" => Some(handle_lessons_create(state, req)),
        "timetable.lessons.update" => Some(handle_lessons_update(state, req)),
        "timetable.lessons.delete" => Some(handle_lessons_delete(state, req)),
        "timetable.refresh" => Some(handle_refresh(state, req)),
        _ => None,
    }
}
