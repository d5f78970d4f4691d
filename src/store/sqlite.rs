//! SQLite-backed run store.
//!
//! Same contract as the in-memory store, durable across restarts: an event
//! that was acknowledged to a subscriber survives a crash because `seq`
//! assignment and the row insert commit in one transaction, serialized by a
//! per-run append lock. Live subscriptions are in-process only — a restarted
//! process replays from the log instead.
//!
//! With the `sqlite-migrations` feature (default) embedded migrations run on
//! connect; without it, migration orchestration is external.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{RunStore, StoreError, is_known_node};
use crate::events::{Event, EventInput, EventKind};
use crate::plan::Plan;
use crate::types::{NodeState, NodeStateUpdate, NodeStatus, Run, RunFilter, RunStatus};

const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Durable [`RunStore`] implementation over a SQLite pool.
pub struct SqliteStore {
    pool: SqlitePool,
    notifiers: Mutex<FxHashMap<String, broadcast::Sender<Event>>>,
    write_locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    event_buffer: usize,
}

impl SqliteStore {
    /// Connect to `url` (e.g. `sqlite://runloom.db`), creating the database
    /// file if needed, and run embedded migrations when enabled.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(backend_err)?;
        #[cfg(feature = "sqlite-migrations")]
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(backend_err)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            notifiers: Mutex::new(FxHashMap::default()),
            write_locks: Mutex::new(FxHashMap::default()),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Serializes mutations for one run (and in particular `seq` assignment).
    fn write_lock(&self, run_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.write_locks
                .lock()
                .entry(run_id.to_string())
                .or_default(),
        )
    }

    fn notifier(&self, run_id: &str) -> broadcast::Sender<Event> {
        self.notifiers
            .lock()
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(self.event_buffer).0)
            .clone()
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, status, created_at, started_at, finished_at FROM runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?
        .ok_or_else(|| StoreError::run_not_found(run_id))?;
        run_from_row(&row)
    }

    async fn fetch_plan(&self, run_id: &str) -> Result<Plan, StoreError> {
        let row = sqlx::query("SELECT plan_json FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or_else(|| StoreError::run_not_found(run_id))?;
        let plan_json: String = row.try_get("plan_json").map_err(backend_err)?;
        serde_json::from_str(&plan_json).map_err(backend_err)
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, name: &str, plan: Plan) -> Result<Run, StoreError> {
        plan.validate()?;
        let run = Run {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let plan_json = serde_json::to_string(&plan).map_err(backend_err)?;
        sqlx::query(
            "INSERT INTO runs (id, name, status, plan_json, created_at, started_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, NULL, NULL)",
        )
        .bind(&run.id)
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(&plan_json)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.fetch_run(run_id).await
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT id, name, status, created_at, started_at, finished_at FROM runs \
                     WHERE status = ? ORDER BY created_at",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, name, status, created_at, started_at, finished_at FROM runs \
                     ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(backend_err)?;
        let mut runs = rows
            .iter()
            .map(run_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if filter.limit > 0 {
            runs.truncate(filter.limit);
        }
        Ok(runs)
    }

    async fn get_plan(&self, run_id: &str) -> Result<Plan, StoreError> {
        self.fetch_plan(run_id).await
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, StoreError> {
        let lock = self.write_lock(run_id);
        let _guard = lock.lock().await;
        let mut run = self.fetch_run(run_id).await?;
        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidRunTransition {
                run_id: run_id.to_string(),
                from: run.status,
                to: status,
            });
        }
        let now = Utc::now();
        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.finished_at = Some(now);
        }
        sqlx::query("UPDATE runs SET status = ?, started_at = ?, finished_at = ? WHERE id = ?")
            .bind(run.status.as_str())
            .bind(run.started_at)
            .bind(run.finished_at)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(run)
    }

    async fn cancel_run(&self, run_id: &str) -> Result<Run, StoreError> {
        // Terminal check and transition under the per-run write lock:
        // concurrent cancels must both succeed, with exactly one of them
        // performing the write.
        let lock = self.write_lock(run_id);
        let _guard = lock.lock().await;
        let mut run = self.fetch_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        sqlx::query("UPDATE runs SET status = ?, finished_at = ? WHERE id = ?")
            .bind(run.status.as_str())
            .bind(run.finished_at)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(run)
    }

    async fn get_node_state(&self, run_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
        let row = sqlx::query(
            "SELECT node_id, status, started_at, finished_at, exit_code, retries, error \
             FROM node_states WHERE run_id = ? AND node_id = ?",
        )
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        if let Some(row) = row {
            return node_from_row(&row);
        }
        let plan = self.fetch_plan(run_id).await?;
        if is_known_node(&plan, node_id) {
            Ok(NodeState::pending(node_id))
        } else {
            Err(StoreError::node_not_found(node_id))
        }
    }

    async fn list_node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError> {
        let plan = self.fetch_plan(run_id).await?;
        let rows = sqlx::query(
            "SELECT node_id, status, started_at, finished_at, exit_code, retries, error \
             FROM node_states WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        let mut by_id: FxHashMap<String, NodeState> = FxHashMap::default();
        for row in &rows {
            let state = node_from_row(row)?;
            by_id.insert(state.node_id.clone(), state);
        }
        let mut states: Vec<NodeState> = plan
            .nodes
            .iter()
            .map(|spec| {
                by_id
                    .remove(&spec.id)
                    .unwrap_or_else(|| NodeState::pending(&spec.id))
            })
            .collect();
        let mut extra: Vec<NodeState> = by_id.into_values().collect();
        extra.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        states.extend(extra);
        Ok(states)
    }

    async fn update_node_state(
        &self,
        run_id: &str,
        node_id: &str,
        update: NodeStateUpdate,
    ) -> Result<NodeState, StoreError> {
        let lock = self.write_lock(run_id);
        let _guard = lock.lock().await;
        let mut state = self.get_node_state(run_id, node_id).await?;
        if let Some(status) = update.status {
            if !state.status.can_transition_to(status) {
                return Err(StoreError::InvalidNodeTransition {
                    run_id: run_id.to_string(),
                    node_id: node_id.to_string(),
                    from: state.status,
                    to: status,
                });
            }
            let now = Utc::now();
            state.status = status;
            if status == NodeStatus::Running && state.started_at.is_none() {
                state.started_at = Some(now);
            }
            if status.is_terminal() {
                state.finished_at = Some(now);
            }
        }
        if let Some(exit_code) = update.exit_code {
            state.exit_code = Some(exit_code);
        }
        if let Some(retries) = update.retries {
            state.retries = retries;
        }
        if let Some(error) = update.error {
            state.error = Some(error);
        }
        sqlx::query(
            "INSERT INTO node_states \
             (run_id, node_id, status, started_at, finished_at, exit_code, retries, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, node_id) DO UPDATE SET \
             status = excluded.status, started_at = excluded.started_at, \
             finished_at = excluded.finished_at, exit_code = excluded.exit_code, \
             retries = excluded.retries, error = excluded.error",
        )
        .bind(run_id)
        .bind(node_id)
        .bind(state.status.as_str())
        .bind(state.started_at)
        .bind(state.finished_at)
        .bind(state.exit_code)
        .bind(state.retries as i64)
        .bind(&state.error)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(state)
    }

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let plan = self.fetch_plan(run_id).await?;
        if !is_known_node(&plan, node_id) {
            return Err(StoreError::node_not_found(node_id));
        }
        let outputs_json = serde_json::to_string(&Value::Object(outputs)).map_err(backend_err)?;
        sqlx::query(
            "INSERT INTO node_outputs (run_id, node_id, outputs_json) VALUES (?, ?, ?) \
             ON CONFLICT (run_id, node_id) DO UPDATE SET outputs_json = excluded.outputs_json",
        )
        .bind(run_id)
        .bind(node_id)
        .bind(&outputs_json)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        let row = sqlx::query(
            "SELECT outputs_json FROM node_outputs WHERE run_id = ? AND node_id = ?",
        )
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        let Some(row) = row else {
            let plan = self.fetch_plan(run_id).await?;
            if is_known_node(&plan, node_id) {
                return Ok(None);
            }
            return Err(StoreError::node_not_found(node_id));
        };
        let outputs_json: String = row.try_get("outputs_json").map_err(backend_err)?;
        match serde_json::from_str(&outputs_json).map_err(backend_err)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(StoreError::Backend {
                message: format!("node {node_id} outputs are not a JSON object"),
            }),
        }
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event, StoreError> {
        let lock = self.write_lock(run_id);
        let _guard = lock.lock().await;
        // Existence check doubles as NotFound detection.
        self.fetch_run(run_id).await?;

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS tail FROM events WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_err)?;
        let tail: i64 = row.try_get("tail").map_err(backend_err)?;
        let event = Event {
            seq: tail as u64 + 1,
            run_id: run_id.to_string(),
            kind: input.kind,
            node_id: input.node_id,
            data: input.data,
            ts: Utc::now(),
        };
        let data_json = serde_json::to_string(&event.data).map_err(backend_err)?;
        sqlx::query(
            "INSERT INTO events (run_id, seq, kind, node_id, data_json, ts) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(event.seq as i64)
        .bind(event.kind.as_str())
        .bind(&event.node_id)
        .bind(&data_json)
        .bind(event.ts)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;

        let _ = self.notifier(run_id).send(event.clone());
        Ok(event)
    }

    async fn events_since(&self, run_id: &str, last_seq: u64) -> Result<Vec<Event>, StoreError> {
        self.fetch_run(run_id).await?;
        let rows = sqlx::query(
            "SELECT seq, kind, node_id, data_json, ts FROM events \
             WHERE run_id = ? AND seq > ? ORDER BY seq",
        )
        .bind(run_id)
        .bind(last_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(|row| event_from_row(run_id, row)).collect()
    }

    async fn last_events(&self, run_id: &str, n: usize) -> Result<Vec<Event>, StoreError> {
        self.fetch_run(run_id).await?;
        let rows = sqlx::query(
            "SELECT seq, kind, node_id, data_json, ts FROM events \
             WHERE run_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(run_id)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        let mut events = rows
            .iter()
            .map(|row| event_from_row(run_id, row))
            .collect::<Result<Vec<_>, _>>()?;
        events.reverse();
        Ok(events)
    }

    async fn tail_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        self.fetch_run(run_id).await?;
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS tail FROM events WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        let tail: i64 = row.try_get("tail").map_err(backend_err)?;
        Ok(tail as u64)
    }

    async fn subscribe_events(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        self.fetch_run(run_id).await?;
        Ok(self.notifier(run_id).subscribe())
    }
}

fn backend_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: err.to_string(),
    }
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status").map_err(backend_err)?;
    Ok(Run {
        id: row.try_get("id").map_err(backend_err)?,
        name: row.try_get("name").map_err(backend_err)?,
        status: parse_run_status(&status)?,
        created_at: row.try_get("created_at").map_err(backend_err)?,
        started_at: row.try_get("started_at").map_err(backend_err)?,
        finished_at: row.try_get("finished_at").map_err(backend_err)?,
    })
}

fn node_from_row(row: &SqliteRow) -> Result<NodeState, StoreError> {
    let status: String = row.try_get("status").map_err(backend_err)?;
    let retries: i64 = row.try_get("retries").map_err(backend_err)?;
    let exit_code: Option<i64> = row.try_get("exit_code").map_err(backend_err)?;
    Ok(NodeState {
        node_id: row.try_get("node_id").map_err(backend_err)?,
        status: parse_node_status(&status)?,
        started_at: row.try_get("started_at").map_err(backend_err)?,
        finished_at: row.try_get("finished_at").map_err(backend_err)?,
        exit_code: exit_code.map(|c| c as i32),
        retries: retries as u32,
        error: row.try_get("error").map_err(backend_err)?,
    })
}

fn event_from_row(run_id: &str, row: &SqliteRow) -> Result<Event, StoreError> {
    let seq: i64 = row.try_get("seq").map_err(backend_err)?;
    let kind: String = row.try_get("kind").map_err(backend_err)?;
    let data_json: String = row.try_get("data_json").map_err(backend_err)?;
    Ok(Event {
        seq: seq as u64,
        run_id: run_id.to_string(),
        kind: parse_event_kind(&kind)?,
        node_id: row.try_get("node_id").map_err(backend_err)?,
        data: serde_json::from_str(&data_json).map_err(backend_err)?,
        ts: row.try_get::<DateTime<Utc>, _>("ts").map_err(backend_err)?,
    })
}

fn parse_run_status(raw: &str) -> Result<RunStatus, StoreError> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|_| StoreError::Backend {
        message: format!("unknown run status in store: {raw}"),
    })
}

fn parse_node_status(raw: &str) -> Result<NodeStatus, StoreError> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|_| StoreError::Backend {
        message: format!("unknown node status in store: {raw}"),
    })
}

fn parse_event_kind(raw: &str) -> Result<EventKind, StoreError> {
    serde_json::from_value(Value::String(raw.to_string())).map_err(|_| StoreError::Backend {
        message: format!("unknown event kind in store: {raw}"),
    })
}
