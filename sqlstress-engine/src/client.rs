//! The execution-client seam between the engine and the target store.
//!
//! The engine never talks to a database driver directly. Everything goes
//! through [`SqlClient`], one instance per open connection, created by a
//! [`Connect`] implementation. The only implementation shipped here is
//! [`PrintConnect`], which writes statements to stderr instead of executing
//! them; real drivers live outside this crate and plug in through the same
//! traits.

use std::fmt::Debug;

use thiserror::Error;

/// One result row, with every column rendered as a string.
///
/// The engine only ever reads back generated row identifiers and a single
/// COUNT during setup, so a stringly-typed row is all it needs.
pub type Row = Vec<String>;

/// A boxed, connection-owning client as produced by [`Connect::connect`].
pub type BoxedClient = Box<dyn SqlClient>;

/// Errors surfaced by an execution client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Opening or pinging the connection failed.
    #[error("connection error: {0}")]
    Connect(String),

    /// A statement was rejected or failed mid-execution.
    #[error("statement error: {0}")]
    Statement(String),

    /// Closing the connection failed.
    #[error("close error: {0}")]
    Close(String),
}

/// One open connection to the target store.
///
/// Methods take `&mut self`: a connection is owned by exactly one agent and
/// statements on it are strictly sequential.
#[async_trait::async_trait]
pub trait SqlClient: Debug + Send + 'static {
    /// Executes a statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &str) -> Result<u64, ClientError>;

    /// Executes a query, returning all result rows.
    async fn query(&mut self, statement: &str) -> Result<Vec<Row>, ClientError>;

    /// Executes a query expected to produce at most one row.
    async fn query_row(&mut self, statement: &str) -> Result<Option<Row>, ClientError>;

    /// Releases the connection.
    async fn close(&mut self) -> Result<(), ClientError>;
}

/// Opens connections to the target store.
///
/// `connect` must not return until the connection is usable (open + ping in
/// driver terms). The session is server-level; the engine selects the
/// benchmark database itself with an explicit `USE` statement.
#[async_trait::async_trait]
pub trait Connect: Debug + Send + Sync + 'static {
    /// Opens and verifies one new connection.
    async fn connect(&self) -> Result<BoxedClient, ClientError>;
}

/// A client that prints every statement to stderr instead of executing it.
///
/// Queries return no rows, so setup code has to synthesize identifiers when
/// running against this client.
#[derive(Debug, Default)]
pub struct PrintClient;

#[async_trait::async_trait]
impl SqlClient for PrintClient {
    async fn execute(&mut self, statement: &str) -> Result<u64, ClientError> {
        eprintln!("{statement}");
        Ok(0)
    }

    async fn query(&mut self, statement: &str) -> Result<Vec<Row>, ClientError> {
        eprintln!("{statement}");
        Ok(Vec::new())
    }

    async fn query_row(&mut self, statement: &str) -> Result<Option<Row>, ClientError> {
        eprintln!("{statement}");
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// [`Connect`] implementation yielding [`PrintClient`]s.
#[derive(Debug, Default)]
pub struct PrintConnect;

#[async_trait::async_trait]
impl Connect for PrintConnect {
    async fn connect(&self) -> Result<BoxedClient, ClientError> {
        Ok(Box::new(PrintClient))
    }
}
