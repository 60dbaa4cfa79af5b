#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end scenarios: log, materializer, matrix and engine together.

mod common;

use common::{addr, fixture};
use pretty_assertions::assert_eq;
use serde_json::json;
use slotgrid_core::{ErrorKind, PermissionSet, SlotEvent, UnitId};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_then_edit_yields_version_two() {
    let fx = fixture();
    let unit = fx.create("U1", "v1");
    fx.edit(&unit, "v2");

    let snapshot = fx.grid.get_snapshot(&unit, None).unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.current_code, "v2");
    assert_eq!(snapshot.original_code, "v1");
    assert!(snapshot.flags.modified);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edit_after_commit_hot_swaps_once_before_next_execution() {
    let fx = fixture();
    let unit = fx.create("U1", "v1");
    fx.edit(&unit, "v2");
    fx.commit_open("a1", &unit);
    fx.grid.tick_row("a").await.unwrap();
    assert_eq!(fx.view("a1").executed_version, 2);

    let mut events = fx.grid.subscribe_events();
    fx.edit(&unit, "v3");
    fx.grid.execute(&addr("a1"), json!("x"), None).unwrap();

    let report = fx.grid.tick_row("a").await.unwrap();
    assert_eq!(report.hot_swaps, 1);
    assert_eq!(report.executions, 1);

    let view = fx.view("a1");
    assert_eq!(view.committed_version, 3);
    assert_eq!(view.executed_version, 3);
    assert_eq!(view.last_output, Some(json!("v3:\"x\"")));
    assert_eq!(fx.loads_of("v3"), 1);

    let mut swaps = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SlotEvent::HotSwapped {
            from_version,
            to_version,
            ..
        } = event
        {
            swaps.push((from_version, to_version));
        }
    }
    assert_eq!(swaps, vec![(2, 3)]);

    // Nothing left to swap.
    assert_eq!(fx.grid.tick_row("a").await.unwrap().hot_swaps, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_commit_to_occupied_slot_fails() {
    let fx = fixture();
    let u1 = fx.create("U1", "v1");
    let u2 = fx.create("U2", "v1");
    fx.grid.commit(&addr("a1"), &u1).unwrap();

    let err = fx.grid.commit(&addr("a1"), &u2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SlotOccupied);
    assert_eq!(err.kind().as_str(), "SLOT_OCCUPIED");
    assert_eq!(fx.view("a1").unit_id, Some(u1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_without_permission_is_denied_and_changes_nothing() {
    let fx = fixture();
    let unit = fx.create("U1", "v1");
    fx.grid.commit(&addr("a1"), &unit).unwrap();
    fx.grid
        .set_permissions(&addr("a1"), PermissionSet::default())
        .unwrap();
    let before = fx.view("a1");

    let err = fx.grid.push_input(&addr("a1"), json!(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(fx.view("a1"), before);
    assert_eq!(before.pending_inputs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hanging_unit_times_out_and_row_moves_on() {
    let fx = fixture();
    let stuck = fx.create("stuck", "hang");
    let fine = fx.create("fine", "ok");
    fx.commit_open("a1", &stuck);
    fx.commit_open("a2", &fine);
    fx.grid.execute(&addr("a1"), json!(1), None).unwrap();
    fx.grid.execute(&addr("a2"), json!(2), None).unwrap();

    let report = fx.grid.tick_row("a").await.unwrap();
    assert_eq!(report.executions, 2);
    assert_eq!(report.failures, 1);

    let stuck_view = fx.view("a1");
    assert_eq!(
        stuck_view.last_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::ExecutionTimeout)
    );
    assert_eq!(stuck_view.execution_count, 1);
    assert_eq!(fx.view("a2").last_output, Some(json!("ok:2")));

    // The next tick still serves the slot.
    fx.grid
        .execute(&addr("a1"), json!(3), Some(std::time::Duration::from_millis(20)))
        .unwrap();
    fx.grid.tick_row("a").await.unwrap();
    assert_eq!(fx.view("a1").execution_count, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_then_commit_starts_fresh() {
    let fx = fixture();
    let u1 = fx.create("U1", "v1");
    let u2 = fx.create("U2", "w1");
    fx.commit_open("a1", &u1);
    fx.grid.execute(&addr("a1"), json!(1), None).unwrap();
    fx.grid.tick_row("a").await.unwrap();
    fx.grid.push_input(&addr("a1"), json!("queued")).unwrap();
    assert_eq!(fx.view("a1").execution_count, 1);

    assert_eq!(fx.grid.release(&addr("a1")).unwrap(), u1);
    let view = fx.grid.commit(&addr("a1"), &u2).unwrap();

    assert_eq!(view.unit_id, Some(UnitId::from("U2")));
    assert_eq!(view.execution_count, 0);
    assert_eq!(view.pending_inputs, 0);
    assert_eq!(view.buffered_outputs, 0);
    assert_eq!(view.last_output, None);
    assert_eq!(view.executed_version, 0);
    assert!(fx.grid.read_output(&addr("a1"), 10).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flat_and_grid_addresses_share_a_slot() {
    let fx = fixture();
    let unit = fx.create("U1", "v1");
    // Row a has four slots, so b2 is the sixth slot overall.
    let ir_unit = fx.create_on("U2", "v1", slotgrid_core::RuntimeId::UNIVERSAL_IR);
    fx.grid.commit(&addr("slot-6"), &ir_unit).unwrap();
    let view = fx.view("b2");
    assert_eq!(view.unit_id, Some(ir_unit.clone()));
    assert_eq!(view.flat_index, 6);
    assert_eq!(fx.grid.slot_of_unit(&ir_unit).unwrap().as_deref(), Some("b2"));

    assert_eq!(
        fx.grid.commit(&addr("slot-99"), &unit).unwrap_err().kind(),
        ErrorKind::SlotNotFound
    );
}
