//! The benchmark orchestrator.
//!
//! A [`Task`] owns the whole lifecycle of one run: target-side setup
//! (database, table, concurrent pre-population), the concurrent run of the
//! agent pool under a shared cancellation token with fail-fast error
//! propagation, live progress reporting, and teardown.
//!
//! Cancellation of the caller-supplied token (the CLI wires it to SIGINT)
//! is honored at every stage; deadline expiry and agent failures cancel a
//! child token so they never affect the caller's.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::Agent;
use crate::client::{BoxedClient, Connect};
use crate::recorder::{Recorder, Report};
use crate::workload::{StatementGenerator, TABLE_NAME, WorkloadConfig};

/// Period of the live progress report.
const PROGRESS_PERIOD: Duration = Duration::from_secs(1);

/// Options governing one benchmark run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Display identity of the target, without credentials. Report echo only.
    pub target: String,
    /// Name of the benchmark database.
    pub database: String,
    /// Number of concurrent agents.
    pub agents: u32,
    /// Run duration; zero means no deadline.
    #[serde(with = "humantime_serde")]
    pub time: Duration,
    /// Per-agent target statement rate; zero means unlimited.
    pub rate: u32,
    /// Per-agent statement budget; zero means unlimited.
    pub number_queries_to_execute: u32,
    /// Drop a pre-existing benchmark database during setup.
    pub drop_existing_database: bool,
    /// Keep the benchmark database on teardown.
    pub no_drop_database: bool,
    /// Storage engine to set as the session default during setup.
    pub engine: Option<String>,
    /// Custom create statements, replacing the auto-generated table setup.
    pub creates: Vec<String>,
    /// Print statements instead of executing them; suppresses progress.
    pub only_print: bool,
    /// Fixed seed for reproducible statement streams.
    pub seed: Option<u64>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            target: String::new(),
            database: "sqlstress".to_owned(),
            agents: 1,
            time: Duration::from_secs(60),
            rate: 0,
            number_queries_to_execute: 0,
            drop_existing_database: false,
            no_drop_database: false,
            engine: None,
            creates: Vec::new(),
            only_print: false,
            seed: None,
        }
    }
}

/// One line of live progress, emitted once per second during the run.
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    /// Time since the run started.
    pub elapsed: Duration,
    /// Agents still executing statements.
    pub running_agents: u32,
    /// Statements executed so far.
    pub executed: usize,
    /// Statements executed during the last period.
    pub current_qps: f64,
}

/// Orchestrator for one benchmark run: setup, concurrent run, teardown.
#[derive(Debug)]
pub struct Task {
    options: Arc<TaskOptions>,
    workload: Arc<WorkloadConfig>,
    connector: Arc<dyn Connect>,
    agents: Vec<Agent>,
    populate_seeds: Vec<u64>,
    id_list: Vec<u64>,
    use_existing_database: bool,
}

impl Task {
    /// Creates the agent pool.
    ///
    /// Per-agent seeds are drawn from the task seed here, so a fixed
    /// [`TaskOptions::seed`] makes the whole run reproducible.
    pub fn new(
        options: TaskOptions,
        workload: WorkloadConfig,
        connector: Arc<dyn Connect>,
    ) -> Self {
        let options = Arc::new(options);
        let workload = Arc::new(workload);
        let mut seeder = SmallRng::seed_from_u64(options.seed.unwrap_or_else(rand::random));

        let agents = (0..options.agents)
            .map(|id| {
                Agent::new(
                    id,
                    Arc::clone(&options),
                    Arc::clone(&workload),
                    Arc::clone(&connector),
                    seeder.random(),
                )
            })
            .collect();
        let populate_seeds = (0..options.agents).map(|_| seeder.random()).collect();

        Self {
            options,
            workload,
            connector,
            agents,
            populate_seeds,
            id_list: Vec::new(),
            use_existing_database: false,
        }
    }

    /// Performs target-side setup: database, table, pre-population, and
    /// per-agent initialization.
    ///
    /// The first failure aborts setup entirely. A cancelled token makes this
    /// return early without error; the caller decides how to unwind.
    pub async fn prepare(&mut self, cancel: &CancellationToken) -> Result<()> {
        let id_list = self
            .setup_database(cancel)
            .await
            .context("failed to set up target database")?;

        if cancel.is_cancelled() {
            return Ok(());
        }

        for agent in &mut self.agents {
            agent
                .prepare(&id_list)
                .await
                .with_context(|| format!("failed to prepare agent id={}", agent.id()))?;
        }

        self.id_list = id_list;
        Ok(())
    }

    async fn setup_database(&mut self, cancel: &CancellationToken) -> Result<Vec<u64>> {
        let options = Arc::clone(&self.options);
        let database = options.database.as_str();

        let mut client = self.connector.connect().await.context("connection error")?;

        if let Some(engine) = &options.engine {
            client
                .execute(&format!("SET default_storage_engine = {engine}"))
                .await
                .context("set default_storage_engine error")?;
        }

        if options.drop_existing_database {
            client
                .execute(&format!("DROP DATABASE IF EXISTS `{database}`"))
                .await
                .context("drop database error")?;
        }

        let row = client
            .query_row(&format!(
                "SELECT COUNT(1) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = '{database}'"
            ))
            .await
            .context("database existence check error")?;

        let exists = if options.only_print {
            false
        } else {
            let count: u64 = row
                .as_ref()
                .and_then(|row| row.first())
                .map(|value| value.parse())
                .transpose()
                .context("database existence check error")?
                .unwrap_or(0);
            count > 0
        };

        if exists {
            // Someone else's database: remember not to drop it on teardown.
            self.use_existing_database = true;
        } else {
            client
                .execute(&format!("CREATE DATABASE `{database}`"))
                .await
                .context("create database error")?;
        }

        client
            .execute(&format!("USE `{database}`"))
            .await
            .context("use database error")?;

        if !options.creates.is_empty() {
            for statement in &options.creates {
                client
                    .execute(statement)
                    .await
                    .with_context(|| format!("create table error (statement={statement})"))?;
            }

            close_quietly(client).await;
            return Ok(Vec::new());
        }

        client
            .execute(&format!("DROP TABLE IF EXISTS {TABLE_NAME}"))
            .await
            .context("drop table error")?;

        let table_statement =
            StatementGenerator::new(Arc::clone(&self.workload), Vec::new(), 0)
                .create_table_statement();
        client
            .execute(&table_statement)
            .await
            .with_context(|| format!("create table error (statement={table_statement})"))?;

        self.pre_populate(cancel)
            .await
            .context("pre-populate data error")?;

        if cancel.is_cancelled() {
            close_quietly(client).await;
            return Ok(Vec::new());
        }

        let expected = u64::from(self.workload.number_pre_populated_rows) * u64::from(options.agents);
        let id_list = if options.only_print {
            // Nothing can be read back from a print-only target; synthesize
            // the identifiers the inserts would have generated.
            (1..=expected).collect()
        } else {
            let rows = client
                .query(&format!("SELECT id FROM {TABLE_NAME}"))
                .await
                .context("fetch id error")?;

            rows.iter()
                .map(|row| {
                    row.first()
                        .context("fetch id error: empty row")?
                        .parse::<u64>()
                        .context("fetch id error: non-numeric id")
                })
                .collect::<Result<Vec<u64>>>()?
        };

        close_quietly(client).await;
        Ok(id_list)
    }

    /// Inserts each agent's share of rows concurrently, fail-fast.
    async fn pre_populate(&self, cancel: &CancellationToken) -> Result<()> {
        let child = cancel.child_token();
        let mut group = JoinSet::new();

        for seed in self.populate_seeds.iter().copied() {
            let connector = Arc::clone(&self.connector);
            let workload = Arc::clone(&self.workload);
            let database = self.options.database.clone();
            let cancel = child.clone();

            group.spawn(async move {
                let mut client = connector.connect().await.context("connection error")?;

                if !database.is_empty() {
                    client
                        .execute(&format!("USE `{database}`"))
                        .await
                        .context("use database error")?;
                }

                let mut generator =
                    StatementGenerator::new(workload.clone(), Vec::new(), seed);

                for _ in 0..workload.number_pre_populated_rows {
                    if cancel.is_cancelled() {
                        break;
                    }

                    let statement = generator.insert_statement();
                    client
                        .execute(&statement)
                        .await
                        .with_context(|| format!("insert error (statement={statement})"))?;
                }

                close_quietly(client).await;
                Ok(())
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = group.join_next().await {
            let result: Result<()> = joined.unwrap_or_else(|err| {
                Err(anyhow::Error::new(err).context("populate task panicked"))
            });

            if let Err(error) = result {
                if first_error.is_none() {
                    first_error = Some(error);
                }
                child.cancel();
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Runs all agents concurrently and reduces the recorded samples into
    /// the final [`Report`].
    ///
    /// The run ends when every agent has exhausted its statement budget, the
    /// configured deadline expires, an agent fails (fail-fast: the first
    /// error cancels all peers), or the caller's token is cancelled. A
    /// cancelled run is not an error and still yields a report.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(Progress) + Send + 'static,
    ) -> Result<Report> {
        let options = Arc::clone(&self.options);
        let token = Uuid::new_v4().to_string();
        let child = cancel.child_token();

        let recorder = Recorder::start((options.agents as usize * 3).max(1));
        let terminated = Arc::new(AtomicU32::new(0));

        let mut group = JoinSet::new();
        for mut agent in self.agents.drain(..) {
            let cancel = child.clone();
            let sender = recorder.sender();
            let token = token.clone();
            let terminated = Arc::clone(&terminated);

            group.spawn(async move {
                let result = agent.run(&cancel, &sender, &token).await;
                terminated.fetch_add(1, Ordering::Relaxed);
                (agent, result)
            });
        }

        // Live progress, suppressed in print-only mode.
        let progress = {
            let cancel = child.clone();
            let counter = recorder.counter();
            let terminated = Arc::clone(&terminated);
            let agents = options.agents;
            let only_print = options.only_print;

            tokio::spawn(async move {
                if only_print {
                    return;
                }

                let started = Instant::now();
                let mut tick = tokio::time::interval_at(started + PROGRESS_PERIOD, PROGRESS_PERIOD);
                let mut previous = 0usize;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let executed = counter.get();
                            on_progress(Progress {
                                elapsed: started.elapsed(),
                                running_agents: agents - terminated.load(Ordering::Relaxed),
                                executed,
                                current_qps: (executed - previous) as f64
                                    / PROGRESS_PERIOD.as_secs_f64(),
                            });
                            previous = executed;
                        }
                    }
                }
            })
        };

        // Deadline; zero means run until budget exhaustion or cancellation.
        if !options.time.is_zero() {
            let cancel = child.clone();
            let time = options.time;

            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(time) => cancel.cancel(),
                }
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        let mut agents = Vec::with_capacity(options.agents as usize);
        while let Some(joined) = group.join_next().await {
            match joined {
                Ok((agent, result)) => {
                    agents.push(agent);
                    if let Err(error) = result {
                        if first_error.is_none() {
                            first_error = Some(error.into());
                        }
                        child.cancel();
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error =
                            Some(anyhow::Error::new(join_error).context("agent task panicked"));
                    }
                    child.cancel();
                }
            }
        }

        child.cancel();
        let _ = progress.await;

        let closed = recorder.close().await;

        for agent in &mut agents {
            if let Err(error) = agent.close().await {
                tracing::warn!("failed to close agent: {error}");
            }
        }
        self.agents = agents;

        if let Some(error) = first_error {
            return Err(error.context("error during agent run"));
        }

        Ok(closed.report(&token, &options.target, &options, &self.workload))
    }

    /// Drops the benchmark database, unless the caller opted out or the
    /// database pre-existed this run.
    pub async fn close(&mut self) -> Result<()> {
        if self.options.no_drop_database || self.use_existing_database {
            return Ok(());
        }

        let mut client = self.connector.connect().await.context("connection error")?;
        client
            .execute(&format!("DROP DATABASE `{}`", self.options.database))
            .await
            .context("drop database error")?;

        close_quietly(client).await;
        Ok(())
    }
}

/// Teardown-path close; failures are logged, never propagated.
async fn close_quietly(mut client: BoxedClient) {
    if let Err(error) = client.close().await {
        tracing::warn!("failed to close setup connection: {error}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::client::mock::MockConnect;
    use crate::workload::LoadType;

    fn key_workload(pre_populated: u32) -> WorkloadConfig {
        WorkloadConfig {
            load_type: LoadType::Key,
            number_pre_populated_rows: pre_populated,
            ..Default::default()
        }
    }

    fn task_options(agents: u32, queries: u32) -> TaskOptions {
        TaskOptions {
            agents,
            number_queries_to_execute: queries,
            time: Duration::ZERO,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn prepare_sets_up_database_table_and_rows() {
        let connector = Arc::new(MockConnect {
            id_rows: vec![1, 2, 3, 4],
            ..MockConnect::new()
        });
        let mut task = Task::new(
            task_options(2, 1),
            key_workload(2),
            connector.clone(),
        );

        let cancel = CancellationToken::new();
        task.prepare(&cancel).await.unwrap();

        let statements = connector.statements();
        assert!(statements.contains(&"CREATE DATABASE `sqlstress`".to_owned()));
        assert!(statements.contains(&"DROP TABLE IF EXISTS t1".to_owned()));
        assert!(statements.iter().any(|s| s.starts_with("CREATE TABLE t1 ")));
        // Two agents inserting their share of two rows each.
        let inserts = statements
            .iter()
            .filter(|s| s.starts_with("INSERT INTO t1 "))
            .count();
        assert_eq!(inserts, 4);
        assert_eq!(task.id_list, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn print_only_prepare_synthesizes_identifiers() {
        let connector = Arc::new(MockConnect::new());
        let options = TaskOptions {
            only_print: true,
            ..task_options(3, 1)
        };
        let mut task = Task::new(options, key_workload(2), connector);

        task.prepare(&CancellationToken::new()).await.unwrap();
        assert_eq!(task.id_list, (1..=6).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn custom_creates_skip_generated_table_setup() {
        let connector = Arc::new(MockConnect::new());
        let options = TaskOptions {
            creates: vec!["CREATE TABLE custom (x INT)".to_owned()],
            ..task_options(2, 1)
        };
        let mut task = Task::new(options, key_workload(5), connector.clone());

        task.prepare(&CancellationToken::new()).await.unwrap();

        let statements = connector.statements();
        assert!(statements.contains(&"CREATE TABLE custom (x INT)".to_owned()));
        assert!(!statements.iter().any(|s| s.starts_with("CREATE TABLE t1 ")));
        assert!(!statements.iter().any(|s| s.starts_with("INSERT INTO t1 ")));
        assert!(task.id_list.is_empty());
    }

    #[tokio::test]
    async fn run_executes_budget_and_reports() {
        let connector = Arc::new(MockConnect {
            id_rows: vec![1, 2],
            ..MockConnect::new()
        });
        let mut task = Task::new(
            task_options(2, 3),
            key_workload(1),
            connector.clone(),
        );

        let cancel = CancellationToken::new();
        task.prepare(&cancel).await.unwrap();
        let report = task.run(&cancel, |_| {}).await.unwrap();

        assert_eq!(report.query_count, 6);
        assert_eq!(report.options.agents, 2);
        assert!(!report.token.is_empty());

        let statements = connector.statements();
        for id in 0..2 {
            let start = format!("SELECT 'agent({id}) start: token={}'", report.token);
            let end = format!("SELECT 'agent({id}) end: token={}'", report.token);
            assert!(statements.contains(&start));
            assert!(statements.contains(&end));
        }
    }

    #[tokio::test]
    async fn one_failing_agent_cancels_its_siblings() {
        // Only agent 1's start marker matches, so exactly one agent fails
        // while its unbounded sibling must be stopped by fail-fast.
        let connector = Arc::new(MockConnect {
            fail_on: Some("agent(1) start".to_owned()),
            id_rows: vec![1, 2],
            ..MockConnect::new()
        });
        let mut task = Task::new(
            task_options(2, 0),
            key_workload(1),
            connector.clone(),
        );

        let cancel = CancellationToken::new();
        task.prepare(&cancel).await.unwrap();
        let error = task.run(&cancel, |_| {}).await.unwrap_err();
        assert!(format!("{error:#}").contains("agent(1) start"));

        // The failing agent never reaches its end marker; its cancelled
        // sibling still emits one.
        let statements = connector.statements();
        let end_markers: Vec<_> = statements
            .iter()
            .filter(|s| s.contains(") end: token="))
            .collect();
        assert_eq!(end_markers.len(), 1);
        assert!(end_markers[0].contains("agent(0) end"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_ends_an_unbounded_run() {
        let connector = Arc::new(MockConnect {
            latency: Duration::from_millis(1),
            id_rows: vec![1, 2],
            ..MockConnect::new()
        });
        let options = TaskOptions {
            time: Duration::from_millis(200),
            ..task_options(2, 0)
        };
        let mut task = Task::new(options, key_workload(1), connector);

        let cancel = CancellationToken::new();
        task.prepare(&cancel).await.unwrap();
        let report = task.run(&cancel, |_| {}).await.unwrap();

        assert!(report.query_count > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancellation_still_yields_a_report() {
        let connector = Arc::new(MockConnect {
            latency: Duration::from_millis(1),
            id_rows: vec![1],
            ..MockConnect::new()
        });
        let mut task = Task::new(task_options(1, 0), key_workload(1), connector);

        let cancel = CancellationToken::new();
        task.prepare(&cancel).await.unwrap();

        let interrupt = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            interrupt.cancel();
        });

        let report = task.run(&cancel, |_| {}).await.unwrap();
        assert!(report.query_count > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_reported_once_per_second()  {
        let connector = Arc::new(MockConnect {
            latency: Duration::from_millis(1),
            id_rows: vec![1],
            ..MockConnect::new()
        });
        let options = TaskOptions {
            time: Duration::from_millis(3500),
            ..task_options(1, 0)
        };
        let mut task = Task::new(options, key_workload(1), connector);

        let cancel = CancellationToken::new();
        task.prepare(&cancel).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        task.run(&cancel, move |progress| sink.lock().unwrap().push(progress))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].elapsed > seen[0].elapsed);
        assert!(seen[2].executed > 0);
        assert!(seen[2].executed >= seen[1].executed);
    }

    #[tokio::test]
    async fn teardown_drops_the_database_unless_opted_out() {
        let connector = Arc::new(MockConnect::new());
        let mut task = Task::new(task_options(1, 1), key_workload(0), connector.clone());
        task.prepare(&CancellationToken::new()).await.unwrap();
        task.close().await.unwrap();
        assert!(
            connector
                .statements()
                .contains(&"DROP DATABASE `sqlstress`".to_owned())
        );

        let connector = Arc::new(MockConnect::new());
        let options = TaskOptions {
            no_drop_database: true,
            ..task_options(1, 1)
        };
        let mut task = Task::new(options, key_workload(0), connector.clone());
        task.prepare(&CancellationToken::new()).await.unwrap();
        task.close().await.unwrap();
        assert!(
            !connector
                .statements()
                .iter()
                .any(|s| s.starts_with("DROP DATABASE"))
        );
    }

    #[tokio::test]
    async fn existing_database_is_used_and_preserved() {
        let connector = Arc::new(MockConnect {
            schemata_count: 1,
            ..MockConnect::new()
        });
        let mut task = Task::new(task_options(1, 1), key_workload(0), connector.clone());
        task.prepare(&CancellationToken::new()).await.unwrap();

        let statements = connector.statements();
        assert!(!statements.contains(&"CREATE DATABASE `sqlstress`".to_owned()));

        task.close().await.unwrap();
        assert!(
            !connector
                .statements()
                .iter()
                .any(|s| s.starts_with("DROP DATABASE"))
        );
    }

    #[tokio::test]
    async fn populate_failure_aborts_prepare() {
        let connector = Arc::new(MockConnect {
            fail_on: Some("INSERT INTO t1".to_owned()),
            ..MockConnect::new()
        });
        let mut task = Task::new(task_options(2, 1), key_workload(3), connector);

        let error = task
            .prepare(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("insert error"));
    }
}
