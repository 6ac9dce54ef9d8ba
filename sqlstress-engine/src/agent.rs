//! One concurrent worker driving one connection through a statement loop.
//!
//! An agent is prepared once (connection, private shuffled id list, init
//! statements), then run under the throttle until its statement budget is
//! exhausted, the shared cancellation token fires, or a statement fails.
//! Completed samples are batched for one second at a time before being
//! handed to the recorder, which keeps channel traffic and lock contention
//! off the hot path.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{BoxedClient, ClientError, Connect};
use crate::recorder::{Sample, SampleSender};
use crate::task::TaskOptions;
use crate::throttle::Throttle;
use crate::workload::{StatementGenerator, WorkloadConfig};

/// Wall-clock window over which an agent accumulates one sample batch.
pub(crate) const FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Errors fatal to a single agent (and, by fail-fast policy, to the run).
#[derive(Debug, Error)]
pub enum AgentError {
    /// Opening or pinging the connection failed.
    #[error("failed to open connection (agent id={id}): {source}")]
    Connect {
        /// The failing agent.
        id: u32,
        /// The underlying client error.
        source: ClientError,
    },

    /// A statement failed; carries the offending statement for diagnostics.
    #[error("failed to execute statement (agent id={id}, statement={statement}): {source}")]
    Statement {
        /// The failing agent.
        id: u32,
        /// The offending statement.
        statement: String,
        /// The underlying client error.
        source: ClientError,
    },

    /// Closing the connection failed.
    #[error("failed to close connection (agent id={id}): {source}")]
    Close {
        /// The failing agent.
        id: u32,
        /// The underlying client error.
        source: ClientError,
    },

    /// `run` or `close` was called before a successful `prepare`.
    #[error("agent id={0} was not prepared")]
    NotPrepared(u32),
}

/// One worker in the agent pool.
#[derive(Debug)]
pub struct Agent {
    id: u32,
    options: Arc<TaskOptions>,
    workload: Arc<WorkloadConfig>,
    connector: Arc<dyn Connect>,
    seed: u64,
    client: Option<BoxedClient>,
    generator: Option<StatementGenerator>,
}

impl Agent {
    /// Creates an unconnected agent.
    ///
    /// `seed` drives both the private id shuffle and the statement
    /// generator, so a fixed task seed reproduces every agent's stream.
    pub fn new(
        id: u32,
        options: Arc<TaskOptions>,
        workload: Arc<WorkloadConfig>,
        connector: Arc<dyn Connect>,
        seed: u64,
    ) -> Self {
        Self {
            id,
            options,
            workload,
            connector,
            seed,
            client: None,
            generator: None,
        }
    }

    /// This agent's pool-unique identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Opens the connection and runs one-time initialization.
    ///
    /// The shared id list is copied and shuffled with this agent's own RNG
    /// so agents do not correlate on insertion order. Connection and init
    /// statement errors are both fatal to setup.
    pub async fn prepare(&mut self, id_list: &[u64]) -> Result<(), AgentError> {
        let mut client = self
            .connector
            .connect()
            .await
            .map_err(|source| AgentError::Connect {
                id: self.id,
                source,
            })?;

        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut ids = id_list.to_vec();
        ids.shuffle(&mut rng);

        let generator = StatementGenerator::new(Arc::clone(&self.workload), ids, self.seed);

        let mut init = Vec::new();
        if !self.options.database.is_empty() {
            init.push(format!("USE `{}`", self.options.database));
        }
        init.extend(generator.init_statements());

        for statement in init {
            client
                .execute(&statement)
                .await
                .map_err(|source| AgentError::Statement {
                    id: self.id,
                    statement: statement.clone(),
                    source,
                })?;
        }

        self.client = Some(client);
        self.generator = Some(generator);
        Ok(())
    }

    /// Runs the statement loop until budget exhaustion, cancellation, or a
    /// statement error.
    ///
    /// Emits a start marker before and an end marker after the loop; failing
    /// to emit either is itself an error. Any unflushed samples are handed
    /// to the recorder when the loop exits, on every path.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        samples: &SampleSender,
        token: &str,
    ) -> Result<(), AgentError> {
        let id = self.id;
        let client = self.client.as_mut().ok_or(AgentError::NotPrepared(id))?;
        let generator = self
            .generator
            .as_mut()
            .ok_or(AgentError::NotPrepared(id))?;

        let start_marker = format!("SELECT 'agent({id}) start: token={token}'");
        client
            .execute(&start_marker)
            .await
            .map_err(|source| AgentError::Statement {
                id,
                statement: start_marker.clone(),
                source,
            })?;

        let max_statements = self.options.number_queries_to_execute;
        let mut throttle = Throttle::new(self.options.rate);
        let mut executed: u32 = 0;
        let mut batch: Vec<Sample> = Vec::new();
        let mut flush_at = Instant::now() + FLUSH_PERIOD;
        let mut result = Ok(());

        loop {
            let iter_start = Instant::now();

            if max_statements > 0 && executed >= max_statements {
                break;
            }

            if cancel.is_cancelled() {
                break;
            }

            if iter_start >= flush_at {
                samples.add(std::mem::take(&mut batch)).await;
                flush_at = Instant::now() + FLUSH_PERIOD;
            }

            let statement = generator.next_statement();
            let timestamp = SystemTime::now();
            let started = Instant::now();

            if let Err(source) = client.execute(&statement).await {
                result = Err(AgentError::Statement {
                    id,
                    statement,
                    source,
                });
                break;
            }

            batch.push(Sample {
                timestamp,
                latency: started.elapsed(),
            });
            executed += 1;

            throttle.pace(iter_start).await;
        }

        // Deliver the final partial batch even on error and cancellation;
        // only samples lost to a crash are unaccounted for.
        samples.add(batch).await;
        result?;

        let end_marker = format!("SELECT 'agent({id}) end: token={token}'");
        client
            .execute(&end_marker)
            .await
            .map_err(|source| AgentError::Statement {
                id,
                statement: end_marker.clone(),
                source,
            })?;

        Ok(())
    }

    /// Releases the connection.
    pub async fn close(&mut self) -> Result<(), AgentError> {
        let mut client = self.client.take().ok_or(AgentError::NotPrepared(self.id))?;

        client
            .close()
            .await
            .map_err(|source| AgentError::Close {
                id: self.id,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockConnect;
    use crate::recorder::Recorder;
    use crate::workload::LoadType;

    fn options(queries: u32) -> Arc<TaskOptions> {
        Arc::new(TaskOptions {
            number_queries_to_execute: queries,
            rate: 0,
            ..Default::default()
        })
    }

    fn workload() -> Arc<WorkloadConfig> {
        Arc::new(WorkloadConfig {
            load_type: LoadType::Key,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn executes_budget_and_emits_markers() {
        let connector = Arc::new(MockConnect::new());
        let mut agent = Agent::new(3, options(5), workload(), connector.clone(), 1);
        agent.prepare(&[1, 2, 3]).await.unwrap();

        let recorder = Recorder::start(4);
        let sender = recorder.sender();
        let cancel = CancellationToken::new();

        agent.run(&cancel, &sender, "tok").await.unwrap();
        agent.close().await.unwrap();
        drop(sender);

        assert_eq!(recorder.close().await.count(), 5);

        let statements = connector.statements();
        assert_eq!(statements[0], "USE `sqlstress`");
        assert_eq!(statements[1], "SELECT 'agent(3) start: token=tok'");
        assert_eq!(
            statements.last().unwrap(),
            "SELECT 'agent(3) end: token=tok'"
        );
        // USE + start marker + 5 statements + end marker.
        assert_eq!(statements.len(), 8);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_but_still_emits_the_end_marker() {
        let connector = Arc::new(MockConnect::new());
        let mut agent = Agent::new(0, options(0), workload(), connector.clone(), 1);
        agent.prepare(&[]).await.unwrap();

        let recorder = Recorder::start(4);
        let sender = recorder.sender();
        let cancel = CancellationToken::new();
        cancel.cancel();

        agent.run(&cancel, &sender, "tok").await.unwrap();
        drop(sender);

        assert_eq!(recorder.close().await.count(), 0);

        let statements = connector.statements();
        assert!(statements.contains(&"SELECT 'agent(0) start: token=tok'".to_owned()));
        assert!(statements.contains(&"SELECT 'agent(0) end: token=tok'".to_owned()));
    }

    #[tokio::test]
    async fn statement_errors_carry_the_offending_statement() {
        let connector = Arc::new(MockConnect {
            fail_on: Some("WHERE id".to_owned()),
            ..MockConnect::new()
        });
        let mut agent = Agent::new(1, options(0), workload(), connector.clone(), 1);
        agent.prepare(&[9]).await.unwrap();

        let recorder = Recorder::start(4);
        let sender = recorder.sender();
        let cancel = CancellationToken::new();

        let err = agent.run(&cancel, &sender, "tok").await.unwrap_err();
        match err {
            AgentError::Statement { id, statement, .. } => {
                assert_eq!(id, 1);
                assert!(statement.contains("WHERE id = 9"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // No end marker on the error path.
        let statements = connector.statements();
        assert!(!statements.iter().any(|s| s.contains("end: token")));
    }

    #[tokio::test]
    async fn connection_failures_are_fatal_to_prepare() {
        let connector = Arc::new(MockConnect {
            fail_connect: true,
            ..MockConnect::new()
        });
        let mut agent = Agent::new(2, options(0), workload(), connector, 1);

        let err = agent.prepare(&[]).await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { id: 2, .. }));
    }

    #[tokio::test]
    async fn run_before_prepare_is_rejected() {
        let connector = Arc::new(MockConnect::new());
        let mut agent = Agent::new(4, options(0), workload(), connector, 1);

        let recorder = Recorder::start(1);
        let sender = recorder.sender();
        let cancel = CancellationToken::new();

        let err = agent.run(&cancel, &sender, "tok").await.unwrap_err();
        assert!(matches!(err, AgentError::NotPrepared(4)));
    }
}
