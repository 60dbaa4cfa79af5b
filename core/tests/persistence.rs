#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Export/import and checkpoint restart.

mod common;

use common::{addr, fixture, fixture_with};
use pretty_assertions::assert_eq;
use serde_json::json;
use slotgrid_core::{CheckpointStore, ErrorKind, RowState, SessionId};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkpoint_restores_log_and_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::with_base_dir(dir.path().to_path_buf()).unwrap();

    let fx = fixture();
    let unit = fx.create("U1", "v1");
    fx.edit(&unit, "v2");
    fx.commit_open("a1", &unit);
    fx.grid.execute(&addr("a1"), json!(1), None).unwrap();
    fx.grid.tick_row("a").await.unwrap();
    fx.grid.push_input(&addr("a1"), json!("later")).unwrap();
    fx.grid.save_checkpoint(&store).unwrap();

    let restored = fixture_with(common::config());
    restored.grid.restore_checkpoint(&store).unwrap();

    assert_eq!(
        restored.grid.get_snapshot(&unit, None).unwrap(),
        fx.grid.get_snapshot(&unit, None).unwrap()
    );
    let view = restored.view("a1");
    assert_eq!(view.unit_id, Some(unit.clone()));
    assert_eq!(view.committed_version, 2);
    assert_eq!(view.executed_version, 0);
    assert_eq!(view.execution_count, 1);
    assert_eq!(view.pending_inputs, 1);
    assert_eq!(restored.grid.read_output(&addr("a1"), 10).unwrap().len(), 1);

    // The first tick reloads the code and serves the carried-over input.
    let report = restored.grid.tick_row("a").await.unwrap();
    assert_eq!(report.hot_swaps, 1);
    assert_eq!(
        restored.view("a1").last_output,
        Some(json!("v2:\"later\""))
    );

    // The restored session keeps appending after its last sequence.
    let before = restored
        .grid
        .log()
        .last_sequence(&fx.session)
        .unwrap()
        .unwrap();
    restored
        .grid
        .record_code_edit(&fx.session, &unit, "v3", "after restore")
        .unwrap();
    assert!(restored.grid.log().last_sequence(&fx.session).unwrap().unwrap() > before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkpoint_files_stay_inside_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::with_base_dir(dir.path().join("store")).unwrap();
    let fx = fixture();

    let err = fx
        .grid
        .open_session_with_id(SessionId::from("../../escaped"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSession);
    let named = fx
        .grid
        .open_session_with_id(SessionId::from("review-2"))
        .unwrap();

    fx.grid.save_checkpoint(&store).unwrap();
    assert!(!dir.path().join("escaped.json").exists());
    let mut expected = vec![fx.session.clone(), named];
    expected.sort();
    assert_eq!(store.list_sessions().unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn importing_an_existing_session_is_rejected() {
    let fx = fixture();
    fx.create("U1", "v1");
    let export = fx.grid.export_log(&fx.session).unwrap();
    let err = fx.grid.import_log(export).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionAlreadyExists);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn matrix_import_requires_stopped_rows() {
    let fx = fixture();
    let export = fx.grid.export_matrix().unwrap();
    fx.grid.start_row("b").await.unwrap();
    assert_eq!(fx.grid.row_state("b").unwrap(), RowState::Running);

    let err = fx.grid.import_matrix(export.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRowState);

    fx.grid.stop_row("b").await.unwrap();
    fx.grid.import_matrix(export).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_records_historical_code_as_new_version() {
    let fx = fixture();
    let unit = fx.create("U1", "v1");
    fx.edit(&unit, "v2");
    fx.commit_open("a1", &unit);

    let version = fx.grid.rollback(&addr("a1"), 1).unwrap();
    assert_eq!(version, 3);
    let snapshot = fx.grid.get_snapshot(&unit, None).unwrap();
    assert_eq!(snapshot.current_code, "v1");
    assert_eq!(
        snapshot.code_at(3).map(|v| v.reason.as_str()),
        Some("rollback_to_v1")
    );
    assert_eq!(fx.view("a1").committed_version, 3);

    assert_eq!(
        fx.grid.rollback(&addr("a1"), 9).unwrap_err().kind(),
        ErrorKind::VersionNotFound
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_all_places_units_by_runtime_in_order() {
    let fx = fixture();
    let order = fx.grid.begin_import(&fx.session, "main.py").unwrap();
    assert_eq!(order, 1);
    let first = fx.create("first", "f");
    let second = fx.create("second", "s");
    let ir = fx.create_on("ir", "i", slotgrid_core::RuntimeId::UNIVERSAL_IR);

    let placed = fx.grid.commit_all(&fx.session).unwrap();
    let addresses: Vec<&str> = placed.iter().map(|v| v.address.as_str()).collect();
    assert_eq!(addresses, vec!["a1", "a2", "b1"]);
    assert_eq!(fx.grid.slot_of_unit(&first).unwrap().as_deref(), Some("a1"));
    assert_eq!(fx.grid.slot_of_unit(&second).unwrap().as_deref(), Some("a2"));
    assert_eq!(fx.grid.slot_of_unit(&ir).unwrap().as_deref(), Some("b1"));
    assert_eq!(fx.grid.dirty_slots().unwrap(), vec!["a1", "a2", "b1"]);

    // Placing again refreshes in place.
    assert_eq!(fx.grid.commit_all(&fx.session).unwrap().len(), 3);
    assert_eq!(fx.grid.matrix_summary().unwrap().occupied_slots, 3);
}
