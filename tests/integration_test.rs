use minilake::ingestion::{TableLocks, Value};
use minilake::{
    DatasetConfig, FileStatus, IngestError, IngestionOrchestrator, RunSummary, Store,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn orchestrator_at(path: &Path) -> IngestionOrchestrator {
    let store = Store::open(path, Duration::from_secs(1)).unwrap();
    IngestionOrchestrator::new(
        Arc::new(store),
        TableLocks::new(),
        vec!["utf-8".to_string(), "latin1".to_string()],
    )
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Table contents as a sorted list of rows, for set comparison.
fn row_set(store: &Store, table: &str) -> Vec<Vec<Option<String>>> {
    let relation = store.read_table(table).unwrap().expect("table should exist");
    let mut rows: Vec<Vec<Option<String>>> = relation
        .rows
        .iter()
        .map(|row| row.iter().map(Value::canonical).collect())
        .collect();
    rows.sort();
    rows
}

fn run_ok(orch: &IngestionOrchestrator, dataset: &DatasetConfig) -> RunSummary {
    match orch.run(dataset) {
        Ok(summary) => summary,
        Err(e) => panic!("run failed: {}", e),
    }
}

#[test]
fn test_date_keyed_batch_replaces_existing_day() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let corona = DatasetConfig::new("corona", data.path())
        .with_key("day_wise", ["Date"])
        .with_default_key(["Date", "Country/Region"]);

    fs::write(data.path().join("day_wise.csv"), "Date,Confirmed\n2024-01-01,5\n").unwrap();
    run_ok(&orch, &corona);

    fs::write(
        data.path().join("day_wise.csv"),
        "Date,Confirmed\n2024-01-01,9\n2024-01-02,3\n",
    )
    .unwrap();
    let summary = run_ok(&orch, &corona);
    let FileStatus::Merged { version, stats } = &summary.files[0].status else {
        panic!("expected a merge, got {:?}", summary.files[0].status);
    };
    assert_eq!(*version, 2);
    assert_eq!(stats.replaced, 1);

    let table = orch.store().read_table("day_wise").unwrap().unwrap();
    assert_eq!(
        table.rows,
        vec![
            vec![text("2024-01-01"), Value::Integer(9)],
            vec![text("2024-01-02"), Value::Integer(3)],
        ]
    );
}

#[test]
fn test_second_file_updates_views_per_video() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let videos = DatasetConfig::new("youtube", data.path())
        .with_prefix("youtube_")
        .with_table("videos")
        .with_default_key(["video_id"]);

    fs::write(
        data.path().join("2024-01-01.csv"),
        "video_id,title,views\nv1,Intro,100\nv2,Outro,50\n",
    )
    .unwrap();
    fs::write(
        data.path().join("2024-01-02.csv"),
        "video_id,title,views\nv1,Intro,250\n",
    )
    .unwrap();

    let summary = run_ok(&orch, &videos);
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.rows_ingested(), 3);

    let table = orch.store().read_table("youtube_videos").unwrap().unwrap();
    assert_eq!(table.len(), 2);
    let views: Vec<_> = (0..table.len())
        .map(|i| (table.get(i, "video_id").cloned(), table.get(i, "views").cloned()))
        .collect();
    assert!(views.contains(&(Some(text("v1")), Some(Value::Integer(250)))));
    assert!(views.contains(&(Some(text("v2")), Some(Value::Integer(50)))));
}

#[test]
fn test_latin1_file_ingests_with_degraded_warning() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let youtube = DatasetConfig::new("youtube", data.path())
        .with_prefix("youtube_")
        .with_default_key(["video_id"]);

    fs::write(
        data.path().join("FRvideos.csv"),
        b"video_id,title\nv9,Caf\xE9 cr\xE8me\n".as_slice(),
    )
    .unwrap();
    fs::write(data.path().join("USvideos.csv"), "video_id,title\nv1,Hello\n").unwrap();

    let summary = run_ok(&orch, &youtube);
    assert_eq!(summary.files[0].degraded_encoding.as_deref(), Some("windows-1252"));
    assert_eq!(summary.files[1].degraded_encoding, None);

    let table = orch.store().read_table("youtube_frvideos").unwrap().unwrap();
    assert_eq!(table.get(0, "title"), Some(&text("Café crème")));
    assert_eq!(
        orch.store().list_tables().unwrap(),
        vec!["youtube_frvideos", "youtube_usvideos"]
    );
}

#[test]
fn test_undecodable_file_is_reported_and_others_continue() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let store = Store::open(lake.path().join("minilake.sqlite"), Duration::from_secs(1)).unwrap();
    let orch = IngestionOrchestrator::new(Arc::new(store), TableLocks::new(), vec!["utf-8".into()]);
    let dataset = DatasetConfig::new("strict", data.path()).with_default_key(["id"]);

    fs::write(data.path().join("a_bad.csv"), b"id,name\n1,\xFF\xFE\n".as_slice()).unwrap();
    fs::write(data.path().join("b_good.csv"), "id,name\n1,ok\n").unwrap();

    let err = orch.run(&dataset).unwrap_err();
    let IngestError::DatasetFailed { dataset, failed, summary, .. } = err else {
        panic!("expected DatasetFailed");
    };
    assert_eq!(dataset, "strict");
    assert_eq!(failed, 1);
    let FileStatus::Failed { error } = &summary.files[0].status else {
        panic!("first file should fail");
    };
    assert!(error.contains("a_bad.csv"));
    assert!(orch.store().table_exists("b_good").unwrap());
}

#[test]
fn test_header_only_file_leaves_table_unchanged() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let dataset = DatasetConfig::new("corona", data.path()).with_key("day_wise", ["Date"]);

    fs::write(data.path().join("day_wise.csv"), "Date,Confirmed\n2024-01-01,5\n").unwrap();
    run_ok(&orch, &dataset);
    let before = row_set(orch.store(), "day_wise");

    fs::write(data.path().join("day_wise.csv"), "Date,Confirmed\n").unwrap();
    let summary = run_ok(&orch, &dataset);
    assert_eq!(summary.files[0].status, FileStatus::Unchanged);
    assert_eq!(row_set(orch.store(), "day_wise"), before);
    assert_eq!(orch.store().table_version("day_wise").unwrap(), 1);
}

#[test]
fn test_reingesting_same_file_is_idempotent() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let dataset = DatasetConfig::new("corona", data.path())
        .with_key("full_grouped", ["Date", "Country/Region"]);

    fs::write(
        data.path().join("full_grouped.csv"),
        "Date,Country/Region,Confirmed\n\
         2024-01-01,Chad,1\n\
         2024-01-01,Peru,2\n\
         2024-01-01,Chad,4\n\
         2024-01-02,,7\n",
    )
    .unwrap();

    run_ok(&orch, &dataset);
    let once = row_set(orch.store(), "full_grouped");
    run_ok(&orch, &dataset);
    let twice = row_set(orch.store(), "full_grouped");

    assert_eq!(once, twice);
    assert_eq!(once.len(), 3);
    assert!(once.contains(&vec![
        Some("2024-01-01".to_string()),
        Some("Chad".to_string()),
        Some("4".to_string()),
    ]));
}

#[test]
fn test_unregistered_table_falls_back_to_default_key() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let dataset = DatasetConfig::new("corona", data.path())
        .with_key("day_wise", ["Date"])
        .with_default_key(["Date", "Country/Region"]);

    fs::write(
        data.path().join("country_daily.csv"),
        "Date,Country/Region,Deaths\n2024-01-01,Chad,1\n2024-01-01,Chad,2\n2024-01-01,Peru,3\n",
    )
    .unwrap();
    run_ok(&orch, &dataset);
    assert_eq!(orch.store().row_count("country_daily").unwrap(), 2);
}

#[test]
fn test_new_columns_appear_as_nulls_for_older_rows() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let dataset = DatasetConfig::new("youtube", data.path())
        .with_table("videos")
        .with_default_key(["video_id"]);

    fs::write(data.path().join("1.csv"), "video_id,views\nv1,10\n").unwrap();
    fs::write(data.path().join("2.csv"), "video_id,views,likes\nv2,20,5\n").unwrap();
    run_ok(&orch, &dataset);

    let columns = orch.store().table_columns("videos").unwrap();
    let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["video_id", "views", "likes"]);

    let table = orch.store().read_table("videos").unwrap().unwrap();
    assert_eq!(table.get(0, "likes"), Some(&Value::Null));
    assert_eq!(table.get(1, "likes"), Some(&Value::Integer(5)));
}

#[test]
fn test_no_transient_relations_survive_a_run() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let db_path = lake.path().join("minilake.sqlite");
    let orch = orchestrator_at(&db_path);
    let dataset = DatasetConfig::new("d", data.path()).with_default_key(["id"]);

    fs::write(data.path().join("a.csv"), "id,v\n1,x\n").unwrap();
    fs::write(data.path().join("b.csv"), "id,v\n1,2,3\n").unwrap();
    assert!(orch.run(&dataset).is_err());

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap();
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(names, vec!["_minilake_catalog", "a"]);
}

#[test]
fn test_separate_reader_sees_committed_table() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let db_path = lake.path().join("minilake.sqlite");
    let orch = orchestrator_at(&db_path);
    let dataset = DatasetConfig::new("corona", data.path()).with_key("day_wise", ["Date"]);

    fs::write(data.path().join("day_wise.csv"), "Date,Confirmed\n2024-01-01,5\n").unwrap();
    run_ok(&orch, &dataset);

    let reader = Store::open(&db_path, Duration::from_secs(1)).unwrap();
    assert_eq!(reader.list_tables().unwrap(), vec!["day_wise"]);
    assert_eq!(reader.row_count("day_wise").unwrap(), 1);
    let entry = reader.catalog_entry("day_wise").unwrap().unwrap();
    assert_eq!(entry.last_source.as_deref(), Some("day_wise.csv"));
}

#[test]
fn test_shipped_config_parses() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/minilake.json");
    let config = minilake::Config::load(&path).unwrap();
    assert_eq!(config.datasets.len(), 2);

    let corona = config.dataset("corona").unwrap();
    let registry = corona.schema_registry();
    assert_eq!(
        registry.primary_key_for("usa_county_wise").key.columns,
        vec!["County", "State", "Date"]
    );
    assert!(registry.primary_key_for("some_new_file").fallback);

    let youtube = config.dataset("youtube").unwrap();
    assert_eq!(youtube.table_name_for(Path::new("USvideos.csv")), "youtube_usvideos");
}

#[test]
fn test_null_keys_collide_when_configured() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let body = "Province/State,Country/Region,Confirmed\n,Chad,1\n,Chad,2\nOntario,Canada,3\n";
    fs::write(data.path().join("covid.csv"), body).unwrap();
    fs::write(data.path().join("covid_raw.csv"), body).unwrap();

    let content = serde_json::json!({
        "store_path": lake.path().join("minilake.sqlite"),
        "datasets": [{
            "name": "corona",
            "source_dir": data.path(),
            "primary_keys": {
                "covid": ["Province/State", "Country/Region"],
                "covid_raw": ["Province/State", "Country/Region"]
            },
            "null_keys_collide": ["covid"]
        }]
    })
    .to_string();
    let config = minilake::Config::from_json_str(&content, lake.path()).unwrap();
    let orch = IngestionOrchestrator::from_config(&config).unwrap();
    let corona = config.dataset("corona").unwrap();

    run_ok(&orch, corona);
    assert_eq!(
        row_set(orch.store(), "covid"),
        vec![
            vec![None, Some("Chad".to_string()), Some("2".to_string())],
            vec![Some("Ontario".to_string()), Some("Canada".to_string()), Some("3".to_string())],
        ]
    );
    assert_eq!(orch.store().row_count("covid_raw").unwrap(), 3);

    run_ok(&orch, corona);
    assert_eq!(orch.store().row_count("covid").unwrap(), 2);
    assert_eq!(orch.store().row_count("covid_raw").unwrap(), 3);
}

#[test]
fn test_rerun_after_failed_file_converges() {
    let data = TempDir::new().unwrap();
    let dataset = DatasetConfig::new("d", data.path())
        .with_table("t")
        .with_default_key(["id"]);
    fs::write(data.path().join("a.csv"), "id,v\n1,a\n2,a\n").unwrap();
    fs::write(data.path().join("b.csv"), "id,v\n2,b,oops\n").unwrap();
    fs::write(data.path().join("c.csv"), "id,v\n3,c\n1,c\n").unwrap();

    let lake = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    assert!(matches!(
        orch.run(&dataset),
        Err(IngestError::DatasetFailed { failed: 1, .. })
    ));

    fs::write(data.path().join("b.csv"), "id,v\n2,b\n").unwrap();
    run_ok(&orch, &dataset);

    let clean_lake = TempDir::new().unwrap();
    let clean = orchestrator_at(&clean_lake.path().join("minilake.sqlite"));
    run_ok(&clean, &dataset);

    assert_eq!(row_set(orch.store(), "t"), row_set(clean.store(), "t"));
    assert_eq!(
        row_set(orch.store(), "t"),
        vec![
            vec![Some("1".to_string()), Some("c".to_string())],
            vec![Some("2".to_string()), Some("b".to_string())],
            vec![Some("3".to_string()), Some("c".to_string())],
        ]
    );
}

#[test]
fn test_writers_in_separate_processes_never_lose_or_duplicate_rows() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let db_path = lake.path().join("minilake.sqlite");
    let body: String = std::iter::once("id,v\n".to_string())
        .chain((0..2_000).map(|i| format!("{},{}\n", i, i * 2)))
        .collect();
    fs::write(data.path().join("batch.csv"), body).unwrap();
    let dataset = DatasetConfig::new("d", data.path())
        .with_table("t")
        .with_default_key(["id"]);

    // separate stores and lock registries stand in for two processes
    let writers: Vec<IngestionOrchestrator> =
        (0..2).map(|_| orchestrator_at(&db_path)).collect();
    let barrier = std::sync::Barrier::new(writers.len());
    let (barrier, dataset) = (&barrier, &dataset);

    let errors: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = writers
            .iter()
            .map(|orch| {
                scope.spawn(move || {
                    let mut errors = Vec::new();
                    for _ in 0..10 {
                        barrier.wait();
                        if let Err(IngestError::DatasetFailed { summary, .. }) = orch.run(dataset) {
                            for file in summary.failed() {
                                if let FileStatus::Failed { error } = &file.status {
                                    errors.push(error.clone());
                                }
                            }
                        }
                    }
                    errors
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    for error in &errors {
        assert!(
            error.contains("changed while merging") || error.contains("locked"),
            "unexpected failure: {}",
            error
        );
    }

    let reader = Store::open(&db_path, Duration::from_secs(1)).unwrap();
    assert_eq!(reader.list_tables().unwrap(), vec!["t"]);
    assert_eq!(reader.row_count("t").unwrap(), 2_000);
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let transient: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 't\\_\\_%' ESCAPE '\\'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(transient, 0);
}

#[test]
fn test_key_drift_through_text_keeps_stored_keys_unique() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let dataset = DatasetConfig::new("d", data.path())
        .with_table("t")
        .with_default_key(["k"]);
    for (name, body) in [
        ("1.csv", "k,v\n5.5,b\n"),
        ("2.csv", "k,v\nx,c\n"),
        ("3.csv", "k,v\n5.0,e\n"),
        ("4.csv", "k,v\ny,f\n"),
        ("5.csv", "k,v\n5.0,g\n"),
    ] {
        fs::write(data.path().join(name), body).unwrap();
    }

    run_ok(&orch, &dataset);
    let once = row_set(orch.store(), "t");
    let pair = |k: &str, v: &str| vec![Some(k.to_string()), Some(v.to_string())];
    assert_eq!(
        once,
        vec![pair("5.0", "g"), pair("5.5", "b"), pair("x", "c"), pair("y", "f")]
    );

    run_ok(&orch, &dataset);
    assert_eq!(row_set(orch.store(), "t"), once);
}

#[test]
fn test_header_case_change_merges_into_existing_column() {
    let lake = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    let orch = orchestrator_at(&lake.path().join("minilake.sqlite"));
    let dataset = DatasetConfig::new("youtube", data.path())
        .with_table("videos")
        .with_default_key(["id"]);
    fs::write(data.path().join("1.csv"), "id,Views\n1,10\n").unwrap();
    fs::write(data.path().join("2.csv"), "ID,views\n2,20\n1,15\n").unwrap();

    run_ok(&orch, &dataset);
    let table = orch.store().read_table("videos").unwrap().unwrap();
    assert_eq!(table.column_names(), vec!["id", "Views"]);
    assert_eq!(
        table.rows,
        vec![
            vec![Value::Integer(2), Value::Integer(20)],
            vec![Value::Integer(1), Value::Integer(15)],
        ]
    );
}
