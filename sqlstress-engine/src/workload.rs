//! Synthetic statement generation.
//!
//! A [`StatementGenerator`] is the per-agent cursor over an infinite stream
//! of statements: inserts, key lookups, updates, or a caller-supplied custom
//! statement, interleaved with COMMITs at a configurable cadence. Each
//! generator owns its own seeded RNG so runs are reproducible when a fixed
//! seed is supplied, and agents never share random state.

use std::fmt;
use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Name of the auto-generated benchmark table.
pub(crate) const TABLE_NAME: &str = "t1";

/// Length of generated string column values.
const CHAR_COL_LEN: usize = 128;

/// The shape of the generated load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    /// Alternating key lookups and inserts. Requires pre-populated rows.
    #[default]
    Mixed,
    /// Updates by primary key. Requires pre-populated rows.
    Update,
    /// Inserts only.
    Write,
    /// Key lookups only. Requires pre-populated rows.
    Key,
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadType::Mixed => "mixed",
            LoadType::Update => "update",
            LoadType::Write => "write",
            LoadType::Key => "key",
        };
        f.write_str(name)
    }
}

/// Immutable description of the generated workload.
///
/// Shared read-only by all agents and by the setup phase; never mutated
/// after construction.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// The shape of the generated load.
    pub load_type: LoadType,
    /// Number of `VARCHAR(36) UNIQUE KEY` columns in the generated table.
    pub number_secondary_indexes: u32,
    /// Issue a COMMIT after this many statements (0 = autocommit).
    pub commit_rate: u32,
    /// Number of INT columns in the generated table.
    pub number_int_cols: u32,
    /// Whether to index the INT columns.
    pub int_cols_index: bool,
    /// Number of VARCHAR(128) columns in the generated table.
    pub number_char_cols: u32,
    /// Whether to index the VARCHAR columns.
    pub char_cols_index: bool,
    /// Rows inserted per agent before the run starts.
    pub number_pre_populated_rows: u32,
    /// A fixed statement to execute instead of generated ones.
    pub query: Option<String>,
    /// Statements executed once per agent before the run.
    pub pre_queries: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            load_type: LoadType::Mixed,
            number_secondary_indexes: 0,
            commit_rate: 0,
            number_int_cols: 1,
            int_cols_index: false,
            number_char_cols: 1,
            char_cols_index: false,
            number_pre_populated_rows: 100,
            query: None,
            pre_queries: Vec::new(),
        }
    }
}

/// Stateful cursor producing the next statement to execute.
///
/// Tracks the commit counter, the insert/select alternation of the mixed
/// load, and a round-robin cursor over this agent's private copy of the
/// pre-populated row identifiers.
pub struct StatementGenerator {
    config: Arc<WorkloadConfig>,
    rng: SmallRng,
    id_list: Vec<u64>,
    id_idx: usize,
    coin: bool,
    commit_count: u32,
}

impl fmt::Debug for StatementGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementGenerator")
            .field("load_type", &self.config.load_type)
            .field("ids", &self.id_list.len())
            .finish_non_exhaustive()
    }
}

impl StatementGenerator {
    /// Creates a generator over the given identifier list, seeded explicitly.
    pub fn new(config: Arc<WorkloadConfig>, id_list: Vec<u64>, seed: u64) -> Self {
        Self {
            config,
            rng: SmallRng::seed_from_u64(seed),
            id_list,
            id_idx: 0,
            coin: false,
            commit_count: 0,
        }
    }

    /// Statements executed once per connection before the run starts.
    pub fn init_statements(&self) -> Vec<String> {
        let mut stmts = Vec::new();

        if self.config.commit_rate > 0 {
            stmts.push("SET autocommit = 0".to_owned());
        }

        stmts.extend(self.config.pre_queries.iter().cloned());
        stmts
    }

    /// Produces the next statement.
    pub fn next_statement(&mut self) -> String {
        if self.config.commit_rate > 0 {
            if self.commit_count == self.config.commit_rate {
                self.commit_count = 0;
                return "COMMIT".to_owned();
            }

            self.commit_count += 1;
        }

        if let Some(query) = &self.config.query {
            return query.clone();
        }

        match self.config.load_type {
            LoadType::Mixed => {
                let coin = self.coin;
                self.coin = !coin;

                if coin {
                    self.insert_statement()
                } else {
                    self.select_by_key_statement()
                }
            }
            LoadType::Update => self.update_statement(),
            LoadType::Write => self.insert_statement(),
            LoadType::Key => self.select_by_key_statement(),
        }
    }

    /// The CREATE TABLE statement matching this workload's column layout.
    pub fn create_table_statement(&self) -> String {
        let mut stmt = format!("CREATE TABLE {TABLE_NAME} (id SERIAL");

        for i in 1..=self.config.number_secondary_indexes {
            stmt.push_str(&format!(", id{i} VARCHAR(36) UNIQUE KEY"));
        }

        for i in 1..=self.config.number_int_cols {
            stmt.push_str(&format!(", intcol{i} INT(32)"));

            if self.config.int_cols_index {
                stmt.push_str(&format!(", INDEX(intcol{i})"));
            }
        }

        for i in 1..=self.config.number_char_cols {
            stmt.push_str(&format!(", charcol{i} VARCHAR(128)"));

            if self.config.char_cols_index {
                stmt.push_str(&format!(", INDEX(charcol{i})"));
            }
        }

        stmt.push(')');
        stmt
    }

    /// An INSERT with random values for every generated column.
    pub fn insert_statement(&mut self) -> String {
        let mut stmt = format!("INSERT INTO {TABLE_NAME} VALUES (NULL");

        for _ in 1..=self.config.number_secondary_indexes {
            stmt.push_str(", UUID()");
        }

        for _ in 1..=self.config.number_int_cols {
            stmt.push_str(&format!(",{}", self.random_int()));
        }

        for _ in 1..=self.config.number_char_cols {
            stmt.push_str(&format!(",'{}'", self.random_string()));
        }

        stmt.push(')');
        stmt
    }

    fn select_by_key_statement(&mut self) -> String {
        let mut stmt = String::from("SELECT ");

        for i in 1..=self.config.number_int_cols {
            if i >= 2 {
                stmt.push(',');
            }

            stmt.push_str(&format!("intcol{i}"));
        }

        for i in 1..=self.config.number_char_cols {
            if self.config.number_int_cols >= 1 || i >= 2 {
                stmt.push(',');
            }

            stmt.push_str(&format!("charcol{i}"));
        }

        stmt.push_str(&format!(" FROM {TABLE_NAME} WHERE id = {}", self.next_id()));
        stmt
    }

    fn update_statement(&mut self) -> String {
        let mut stmt = format!("UPDATE {TABLE_NAME} SET ");

        for i in 1..=self.config.number_int_cols {
            if i >= 2 {
                stmt.push(',');
            }

            stmt.push_str(&format!("intcol{i} = {}", self.random_int()));
        }

        for i in 1..=self.config.number_char_cols {
            if self.config.number_int_cols >= 1 || i >= 2 {
                stmt.push(',');
            }

            stmt.push_str(&format!("charcol{i} = '{}'", self.random_string()));
        }

        stmt.push_str(&format!(" WHERE id = {}", self.next_id()));
        stmt
    }

    /// Round-robin over this agent's private copy of the pre-populated ids.
    fn next_id(&mut self) -> u64 {
        if self.id_list.is_empty() {
            return 0;
        }

        if self.id_idx >= self.id_list.len() {
            self.id_idx = 0;
        }

        let id = self.id_list[self.id_idx];
        self.id_idx += 1;
        id
    }

    fn random_int(&mut self) -> i64 {
        self.rng.random_range(0..(1_i64 << 31))
    }

    fn random_string(&mut self) -> String {
        (&mut self.rng)
            .sample_iter(Alphanumeric)
            .take(CHAR_COL_LEN)
            .map(char::from)
            .collect()
    }
}
