//! Administrative command dispatcher, mirroring the command surface of a
//! classic `*-tool` utility that operates directly on the file format:
//! `create`, `compact`, `convert`, schema/version/cksum probes, `query`,
//! `transact`, and `show-log`.
//!
//! Argument parsing here follows the same manual, no-framework style the
//! teacher's `main.rs` used for its own CLI flags.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value as Json;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::execute;
use crate::file::{save_copy, File};
use crate::log::Locking;
use crate::schema::{self, schema_equal};
use crate::txn::Transaction;

const ALL_COMMANDS: &[(&str, &str)] = &[
    ("create", "[db [schema]]"),
    ("compact", "[db [dst]]"),
    ("convert", "[db [schema [dst]]]"),
    ("needs-conversion", "[db [schema]]"),
    ("db-name", "[db]"),
    ("db-version", "[db]"),
    ("db-cksum", "[db]"),
    ("schema-name", "[schema]"),
    ("schema-version", "[schema]"),
    ("schema-cksum", "[schema]"),
    ("query", "[db] trns"),
    ("transact", "[db] trns"),
    ("show-log", "[-m]... [db]"),
    ("help", ""),
    ("list-commands", ""),
];

/// Resolve the default data directory from `STRATADB_DIR`, falling back to
/// `./data`.
fn data_dir() -> PathBuf {
    std::env::var("STRATADB_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

fn default_db() -> PathBuf {
    data_dir().join("db")
}

fn default_schema() -> PathBuf {
    data_dir().join("schema")
}

/// Follow a symlink to its target so in-place operations replace the
/// target file and leave the link itself pointing at it.
fn follow_symlinks(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Run one administrative command, printing output to stdout and errors to
/// stderr. Returns the process exit code.
pub fn run(args: &[String]) -> i32 {
    // `-m` is a global verbosity flag (only consulted by `show-log`) that
    // may appear anywhere on the command line, not just after the command.
    let positional: Vec<&String> = args.iter().filter(|a| a.as_str() != "-m").collect();
    if positional.is_empty() {
        eprintln!("stratadb-tool: no command given; try 'help'");
        return 1;
    }
    let command = positional[0].as_str();
    let verbosity = args.iter().filter(|a| a.as_str() == "-m").count() as u32;
    let rest: Vec<String> = positional[1..].iter().map(|s| (*s).clone()).collect();
    let result = dispatch(command, &rest, verbosity);
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("stratadb-tool: {}: {}", command, e);
            e.exit_code()
        }
    }
}

fn dispatch(command: &str, args: &[String], verbosity: u32) -> Result<()> {
    match command {
        "create" => do_create(args.get(0), args.get(1)),
        "compact" => do_compact(args.get(0), args.get(1)),
        "convert" => do_convert(args.get(0), args.get(1), args.get(2)),
        "needs-conversion" => do_needs_conversion(args.get(0), args.get(1)),
        "db-name" => do_db_field(args.get(0), |s| s.name.clone()),
        "db-version" => do_db_field(args.get(0), |s| s.version.clone()),
        "db-cksum" => do_db_field(args.get(0), |s| s.cksum()),
        "schema-name" => do_schema_field(args.get(0), |s| s.name.clone()),
        "schema-version" => do_schema_field(args.get(0), |s| s.version.clone()),
        "schema-cksum" => do_schema_field(args.get(0), |s| s.cksum()),
        "query" => do_query(args),
        "transact" => do_transact(args),
        "show-log" => do_show_log(args.get(0), verbosity),
        "help" => do_help(),
        "list-commands" => do_list_commands(),
        other => Err(DbError::syntax(format!("unknown command '{}'", other))),
    }
}

fn path_arg(arg: Option<&String>, default: impl FnOnce() -> PathBuf) -> PathBuf {
    arg.map(PathBuf::from).unwrap_or_else(default)
}

fn do_create(db: Option<&String>, schema_path: Option<&String>) -> Result<()> {
    let db_path = path_arg(db, default_db);
    let schema_path = path_arg(schema_path, default_schema);
    let schema_json: Json = serde_json::from_str(&fs::read_to_string(&schema_path)?)?;
    let schema = schema::schema_from_json(&schema_json)?;
    File::create(&db_path, &schema)
}

fn do_compact(db: Option<&String>, dst: Option<&String>) -> Result<()> {
    let db_path = path_arg(db, default_db);
    match dst {
        None => {
            let real_path = follow_symlinks(&db_path);
            let (mut file, database) = File::open(&real_path, None, false, Locking::ForceLock)?;
            file.compact(&database)
        }
        Some(dst) => {
            let (_file, database) = File::open(&db_path, None, true, Locking::ForbidLock)?;
            save_copy(follow_symlinks(Path::new(dst)), &database)
        }
    }
}

fn do_convert(db: Option<&String>, schema_path: Option<&String>, dst: Option<&String>) -> Result<()> {
    let db_path = path_arg(db, default_db);
    let schema_path = path_arg(schema_path, default_schema);
    let schema_json: Json = serde_json::from_str(&fs::read_to_string(&schema_path)?)?;
    let alternate = schema::schema_from_json(&schema_json)?;

    match dst {
        None => {
            let real_path = follow_symlinks(&db_path);
            let (mut file, database) = File::open(&real_path, Some(alternate), false, Locking::ForceLock)?;
            file.compact(&database)
        }
        Some(dst) => {
            let (_file, database) = File::open(&db_path, Some(alternate), true, Locking::ForbidLock)?;
            save_copy(follow_symlinks(Path::new(dst)), &database)
        }
    }
}

fn do_needs_conversion(db: Option<&String>, schema_path: Option<&String>) -> Result<()> {
    let db_path = path_arg(db, default_db);
    let schema_path = path_arg(schema_path, default_schema);
    let stored = File::read_schema(&db_path)?;
    let schema_json: Json = serde_json::from_str(&fs::read_to_string(&schema_path)?)?;
    let candidate = schema::schema_from_json(&schema_json)?;
    println!("{}", if schema_equal(&stored, &candidate) { "no" } else { "yes" });
    Ok(())
}

fn do_db_field(db: Option<&String>, f: impl FnOnce(&crate::schema::Schema) -> String) -> Result<()> {
    let db_path = path_arg(db, default_db);
    let schema = File::read_schema(&db_path)?;
    println!("{}", f(&schema));
    Ok(())
}

fn do_schema_field(schema_path: Option<&String>, f: impl FnOnce(&crate::schema::Schema) -> String) -> Result<()> {
    let schema_path = path_arg(schema_path, default_schema);
    let schema_json: Json = serde_json::from_str(&fs::read_to_string(&schema_path)?)?;
    let schema = schema::schema_from_json(&schema_json)?;
    println!("{}", f(&schema));
    Ok(())
}

/// Split `args` into an optional leading db path and a trailing
/// transaction argument, the way `query`/`transact` share their argument
/// convention: the last argument is always the transaction, anything
/// before it is the (optional) db path.
fn split_db_and_trns(args: &[String]) -> Result<(PathBuf, &str)> {
    match args.len() {
        1 => Ok((default_db(), args[0].as_str())),
        2 => Ok((PathBuf::from(&args[0]), args[1].as_str())),
        _ => Err(DbError::syntax("expected '[db] trns'")),
    }
}

fn parse_trns(trns: &str) -> Result<Vec<Json>> {
    let value: Json = serde_json::from_str(trns)?;
    let array = value
        .as_array()
        .ok_or_else(|| DbError::syntax("transaction must be a JSON array"))?;
    // First element is the database name/comment, per convention; the rest
    // are operations.
    Ok(array.iter().skip(1).cloned().collect())
}

fn run_ops(database: &mut Database, ops: &[Json]) -> Result<(Transaction, Vec<Json>)> {
    let mut txn = Transaction::new();
    let results = execute::execute(database, &mut txn, ops)?;
    Ok((txn, results.iter().map(|r| r.to_json()).collect()))
}

fn do_query(args: &[String]) -> Result<()> {
    let (db_path, trns) = split_db_and_trns(args)?;
    let ops = parse_trns(trns)?;
    let (_file, mut database) = File::open(&db_path, None, true, Locking::ForbidLock)?;
    let (_txn, results) = run_ops(&mut database, &ops)?;
    println!("{}", serde_json::to_string_pretty(&Json::Array(results))?);
    Ok(())
}

fn do_transact(args: &[String]) -> Result<()> {
    let (db_path, trns) = split_db_and_trns(args)?;
    let ops = parse_trns(trns)?;
    let (mut file, mut database) = File::open(&db_path, None, false, Locking::ForceLock)?;
    let (txn, results) = run_ops(&mut database, &ops)?;
    file.commit(&txn, &database, true)?;
    println!("{}", serde_json::to_string_pretty(&Json::Array(results))?);
    Ok(())
}

fn do_show_log(db: Option<&String>, verbosity: u32) -> Result<()> {
    let db_path = path_arg(db, default_db);
    let mut log = crate::log::Log::open(
        &db_path,
        crate::log::MAGIC_DB,
        &[crate::log::MAGIC_DB, crate::log::MAGIC_LOG],
        crate::log::OpenMode::ReadOnly,
        Locking::ForbidLock,
    )?;

    let mut index = 0usize;
    loop {
        match log.read()? {
            None => break,
            Some(record) => {
                let clustered = log.last_magic() == Some(crate::log::MAGIC_LOG);
                if clustered {
                    print_clustered_record(index, &record);
                } else {
                    print_record_summary(index, &record, verbosity);
                }
                index += 1;
            }
        }
    }
    Ok(())
}

fn print_record_summary(index: usize, record: &Json, verbosity: u32) {
    if index == 0 {
        println!(
            "record {}: schema \"{}\"",
            index,
            record.get("name").and_then(Json::as_str).unwrap_or("?")
        );
        return;
    }
    let mut parts = Vec::new();
    if let Some(date) = record.get("_date").and_then(Json::as_i64) {
        // Old databases recorded the timestamp in seconds; scale up
        // anything that looks too small to be milliseconds.
        let ms = if date < (1i64 << 31) { date * 1000 } else { date };
        parts.push(format!("_date={}", ms));
    }
    if let Some(comment) = record.get("_comment").and_then(Json::as_str) {
        parts.push(format!("_comment={:?}", comment));
    }
    if verbosity == 0 {
        return;
    }
    let table_count = record
        .as_object()
        .map(|o| o.keys().filter(|k| !k.starts_with('_')).count())
        .unwrap_or(0);
    parts.push(format!("{} table(s) touched", table_count));
    println!("record {}: {}", index, parts.join(" "));

    if verbosity < 2 {
        return;
    }
    let Some(obj) = record.as_object() else { return };
    for (table, delta) in obj {
        if table.starts_with('_') {
            continue;
        }
        let Some(rows) = delta.as_object() else { continue };
        for (uuid, row_op) in rows {
            if row_op.is_null() {
                println!("    {}[{}]: deleted", table, uuid);
                continue;
            }
            let Some(row) = row_op.as_object() else { continue };
            for (col, val) in row {
                println!("    {}[{}].{} = {}", table, uuid, col, val);
            }
        }
    }
}

/// Record-dump layout for the clustered consensus log format: record 0
/// carries cluster identity, later records carry one consensus log entry.
fn print_clustered_record(index: usize, record: &Json) {
    if index == 0 {
        let mut parts = vec![format!(
            "cluster \"{}\" address={} server_id={} cluster_id={}",
            record.get("name").and_then(Json::as_str).unwrap_or("?"),
            record.get("address").and_then(Json::as_str).unwrap_or("?"),
            record.get("server_id").and_then(Json::as_str).unwrap_or("?"),
            record.get("cluster_id").and_then(Json::as_str).unwrap_or("?"),
        )];
        for key in ["prev_term", "prev_index", "prev_servers", "prev_data"] {
            if let Some(val) = record.get(key) {
                parts.push(format!("{}={}", key, val));
            }
        }
        if let Some(remotes) = record.get("remotes") {
            parts.push(format!("remotes={}", remotes));
        }
        println!("record {}: {}", index, parts.join(" "));
        return;
    }
    let mut parts = Vec::new();
    if let Some(term) = record.get("term") {
        parts.push(format!("term={}", term));
    }
    if let Some(index) = record.get("index") {
        parts.push(format!("index={}", index));
    }
    if let Some(servers) = record.get("servers") {
        parts.push(format!("servers={}", servers));
    }
    if let Some(vote) = record.get("vote") {
        parts.push(format!("vote={}", vote));
    }
    if record.get("data").is_some() {
        parts.push("data".to_string());
    }
    println!("record {}: {}", index, parts.join(" "));
}

fn do_help() -> Result<()> {
    println!("usage: stratadb-tool COMMAND [ARG...]");
    println!();
    do_list_commands()
}

fn do_list_commands() -> Result<()> {
    for (name, args) in ALL_COMMANDS {
        if args.is_empty() {
            println!("  {}", name);
        } else {
            println!("  {} {}", name, args);
        }
    }
    Ok(())
}
