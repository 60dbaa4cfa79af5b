#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]
//! Shared fixture: a two-row grid with in-process executors.
//!
//! Unit code is a tiny command language understood by the test executor:
//! - `hang`: never finishes (exercises timeouts)
//! - `fail`: returns an executor error
//! - `reject`: fails to load
//! - anything else: returns `"<code>:<input>"`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use slotgrid_core::{
    CoreConfig, ExecutorError, ExecutorTable, FnExecutor, IdentifierRegistry, RowConfig,
    RuntimeId, SessionId, SlotAddress, SlotGrid, SlotView, UnitId, UnitKind, UnitSpec,
};

pub struct Fixture {
    pub grid: SlotGrid,
    pub session: SessionId,
    /// Code bodies in the order the executors loaded them.
    pub loads: Arc<Mutex<Vec<String>>>,
}

pub fn config() -> CoreConfig {
    CoreConfig {
        default_timeout_ms: 150,
        rows: vec![
            RowConfig {
                id: "a".to_string(),
                runtime: "python".to_string(),
                max_slots: 4,
                tick_interval_ms: 10,
            },
            RowConfig {
                id: "b".to_string(),
                runtime: "ir".to_string(),
                max_slots: 4,
                tick_interval_ms: 10,
            },
        ],
        ..CoreConfig::default()
    }
}

pub fn executors(loads: &Arc<Mutex<Vec<String>>>) -> ExecutorTable {
    let mut table = ExecutorTable::new();
    for (runtime, name) in [(RuntimeId::PYTHON, "py-test"), (RuntimeId::UNIVERSAL_IR, "ir-test")] {
        let loads = Arc::clone(loads);
        table.register(
            runtime,
            Arc::new(
                FnExecutor::new(name, |code, input| async move {
                    match code.as_ref() {
                        "hang" => {
                            std::future::pending::<()>().await;
                            Ok(Value::Null)
                        }
                        "fail" => Err(ExecutorError::Failed("unit raised".to_string())),
                        other => Ok(json!(format!("{other}:{input}"))),
                    }
                })
                .with_check(move |code| {
                    loads.lock().unwrap().push(code.to_string());
                    if code == "reject" {
                        Err(ExecutorError::Load("syntax error".to_string()))
                    } else {
                        Ok(())
                    }
                }),
            ),
        );
    }
    table
}

pub fn fixture() -> Fixture {
    fixture_with(config())
}

pub fn fixture_with(config: CoreConfig) -> Fixture {
    let loads = Arc::new(Mutex::new(Vec::new()));
    let grid = SlotGrid::new(config, IdentifierRegistry::builtin(), executors(&loads)).unwrap();
    let session = grid.open_session().unwrap();
    Fixture {
        grid,
        session,
        loads,
    }
}

pub fn addr(address: &str) -> SlotAddress {
    address.parse().unwrap()
}

impl Fixture {
    pub fn create(&self, name: &str, code: &str) -> UnitId {
        self.create_on(name, code, RuntimeId::PYTHON)
    }

    pub fn create_on(&self, name: &str, code: &str, runtime: RuntimeId) -> UnitId {
        self.grid
            .record_unit_created(
                &self.session,
                Some(UnitId::from(name)),
                UnitSpec::new(UnitKind::Function, runtime, name, code),
            )
            .unwrap()
    }

    pub fn edit(&self, unit: &UnitId, code: &str) {
        self.grid
            .record_code_edit(&self.session, unit, code, "test")
            .unwrap();
    }

    /// Commit and open every permission on the slot.
    pub fn commit_open(&self, address: &str, unit: &UnitId) -> SlotView {
        self.grid.commit(&addr(address), unit).unwrap();
        self.grid
            .apply_permission_group(&addr(address), slotgrid_core::PermissionGroup::Admin)
            .unwrap();
        self.view(address)
    }

    pub fn view(&self, address: &str) -> SlotView {
        self.grid.slot_view(&addr(address)).unwrap()
    }

    pub fn loads_of(&self, code: &str) -> usize {
        self.loads.lock().unwrap().iter().filter(|c| *c == code).count()
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
