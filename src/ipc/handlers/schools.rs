use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_schools_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "schools": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           sc.id,
           sc.name,
           (SELECT COUNT(*) FROM classes c WHERE c.school_id = sc.id) AS class_count
         FROM schools sc
         ORDER BY sc.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let class_count: i64 = row.get(2)?;
            Ok(json!({
                "id": id,
                "name": name,
                "classCount": class_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(schools) => ok(&req.id, json!({ "schools": schools })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let school_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)",
        (&school_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "schools" })),
        );
    }

    ok(&req.id, json!({ "schoolId": school_id, "name": name }))
}

fn handle_schools_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match req.params.get("schoolId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };
    let name = match patch.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "patch.name must be string", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "patch.name must not be empty", None);
    }

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "school not found", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE schools SET name = ? WHERE id = ?",
        (&name, &school_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // The class-to-school memo is NOT touched here; callers see the new
    // name only after timetable.refresh.
    ok(&req.id, json!({ "schoolId": school_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.list" => Some(handle_schools_list(state, req)),
        "schools.create" => Some(handle_schools_create(state, req)),
        "schools.update" => Some(handle_schools_update(state, req)),
        _ => None,
    }
}
