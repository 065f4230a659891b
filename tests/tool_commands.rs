//! End-to-end tests of the administrative command surface, exercised the
//! way the CLI binary drives it.

use std::fs;

use tempfile::tempdir;

fn write_schema(dir: &std::path::Path) -> std::path::PathBuf {
    let schema_path = dir.join("schema.json");
    fs::write(
        &schema_path,
        serde_json::json!({
            "name": "shop",
            "version": "1.0.0",
            "tables": {
                "items": { "columns": { "x": {"type": "integer"} } }
            }
        })
        .to_string(),
    )
    .unwrap();
    schema_path
}

#[test]
fn create_then_db_name_reports_schema_name() {
    let dir = tempdir().unwrap();
    let schema_path = write_schema(dir.path());
    let db_path = dir.path().join("a.db");

    let code = stratadb::tool::run(&[
        "create".into(),
        db_path.to_string_lossy().into_owned(),
        schema_path.to_string_lossy().into_owned(),
    ]);
    assert_eq!(code, 0);

    let code = stratadb::tool::run(&["db-name".into(), db_path.to_string_lossy().into_owned()]);
    assert_eq!(code, 0);
}

#[test]
fn transact_then_query_round_trips_a_row() {
    let dir = tempdir().unwrap();
    let schema_path = write_schema(dir.path());
    let db_path = dir.path().join("a.db");
    stratadb::tool::run(&[
        "create".into(),
        db_path.to_string_lossy().into_owned(),
        schema_path.to_string_lossy().into_owned(),
    ]);

    let code = stratadb::tool::run(&[
        "transact".into(),
        db_path.to_string_lossy().into_owned(),
        r#"["n",{"op":"insert","table":"items","row":{"x":1}}]"#.into(),
    ]);
    assert_eq!(code, 0);

    let code = stratadb::tool::run(&[
        "query".into(),
        db_path.to_string_lossy().into_owned(),
        r#"["n",{"op":"select","table":"items","columns":["x"]}]"#.into(),
    ]);
    assert_eq!(code, 0);
}

#[test]
fn create_twice_fails() {
    let dir = tempdir().unwrap();
    let schema_path = write_schema(dir.path());
    let db_path = dir.path().join("a.db");
    let args = [
        "create".to_string(),
        db_path.to_string_lossy().into_owned(),
        schema_path.to_string_lossy().into_owned(),
    ];
    assert_eq!(stratadb::tool::run(&args), 0);
    assert_eq!(stratadb::tool::run(&args), 1);
}

#[test]
fn needs_conversion_reports_no_for_identical_schema() {
    let dir = tempdir().unwrap();
    let schema_path = write_schema(dir.path());
    let db_path = dir.path().join("a.db");
    stratadb::tool::run(&[
        "create".into(),
        db_path.to_string_lossy().into_owned(),
        schema_path.to_string_lossy().into_owned(),
    ]);
    let code = stratadb::tool::run(&[
        "needs-conversion".into(),
        db_path.to_string_lossy().into_owned(),
        schema_path.to_string_lossy().into_owned(),
    ]);
    assert_eq!(code, 0);
}

#[test]
fn list_commands_succeeds() {
    assert_eq!(stratadb::tool::run(&["list-commands".into()]), 0);
}

#[test]
fn compact_through_a_symlink_preserves_the_link() {
    let dir = tempdir().unwrap();
    let schema_path = write_schema(dir.path());
    let real_path = dir.path().join("real.db");
    let link_path = dir.path().join("link.db");

    stratadb::tool::run(&[
        "create".into(),
        real_path.to_string_lossy().into_owned(),
        schema_path.to_string_lossy().into_owned(),
    ]);
    for i in 0..5 {
        stratadb::tool::run(&[
            "transact".into(),
            real_path.to_string_lossy().into_owned(),
            format!(r#"["n",{{"op":"insert","table":"items","row":{{"x":{}}}}}]"#, i),
        ]);
    }

    std::os::unix::fs::symlink(&real_path, &link_path).unwrap();

    let code = stratadb::tool::run(&["compact".into(), link_path.to_string_lossy().into_owned()]);
    assert_eq!(code, 0);

    let meta = fs::symlink_metadata(&link_path).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(fs::read_link(&link_path).unwrap(), real_path);

    let code = stratadb::tool::run(&["db-name".into(), real_path.to_string_lossy().into_owned()]);
    assert_eq!(code, 0);
}
