use rusqlite::{params, Connection, OptionalExtension};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const LEDGER_FILE: &str = "partitions.db";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("Unknown partition status {0} in ledger")]
    UnknownStatus(i64),
    #[error("Failed to remove ledger {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Pending = 0,
    Submitted = 1,
    Done = 2,
    Failed = 3,
    Lost = 4,
}

impl TryFrom<i64> for PartitionStatus {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Submitted),
            2 => Ok(Self::Done),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Lost),
            unknown => Err(LedgerError::UnknownStatus(unknown)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub id: usize,
    pub status: PartitionStatus,
    pub individuals: Option<usize>,
    pub job: Option<String>,
    // newline separated individual ids the partition was cut with
    pub members: Option<String>,
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists run (
    id integer primary key check (id = 1),
    fingerprint text not null
);",
    "create table if not exists partitions (
    id integer primary key,
    status integer not null,
    individuals integer,
    job text,
    members text
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

/// Durable per-partition status of a distributed run
///
/// A run that ends with lost or failed partitions leaves the ledger behind, so the next
/// invocation with the same inputs only resubmits what did not finish.
#[derive(Debug)]
pub struct Ledger {
    connection: Connection,
    path: PathBuf,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let connection = Connection::open(path)?;

        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            if let Err(error) = connection.execute(table, []) {
                error!(error = ?error, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                return Err(error.into());
            }
        }

        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    /// bind the ledger to a run, clearing it when it belonged to a different one
    ///
    /// Returns whether an earlier attempt of the same run was found.
    pub fn begin(&mut self, fingerprint: &str) -> Result<bool, LedgerError> {
        let existing: Option<String> = self
            .connection
            .prepare_cached("select fingerprint from run where id = 1")?
            .query_row([], |row| row.get(0))
            .optional()?;

        if existing.as_deref() == Some(fingerprint) {
            info!(path = ?self.path, "Resuming from existing partition ledger");

            return Ok(true);
        }

        if existing.is_some() {
            warn!(path = ?self.path, "Partition ledger belongs to a different run, starting over");
        }

        let tx = self.connection.transaction()?;
        tx.execute("delete from partitions", [])?;
        tx.execute(
            "insert or replace into run (id, fingerprint) values (1, ?)",
            params![fingerprint],
        )?;
        tx.commit()?;

        Ok(false)
    }

    pub fn record(&self, record: &PartitionRecord) -> Result<(), LedgerError> {
        self.connection
            .prepare_cached(
                "insert or replace into partitions (id, status, individuals, job, members)
                 values (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                record.id as i64,
                record.status as i64,
                record.individuals.map(|count| count as i64),
                record.job,
                record.members
            ])?;

        debug!(id = record.id, status = ?record.status, "Recorded partition status");

        Ok(())
    }

    pub fn set_status(&self, id: usize, status: PartitionStatus) -> Result<(), LedgerError> {
        let changed = self
            .connection
            .prepare_cached("update partitions set status = ? where id = ?")?
            .execute(params![status as i64, id as i64])?;

        if changed == 0 {
            self.record(&PartitionRecord {
                id,
                status,
                individuals: None,
                job: None,
                members: None,
            })?;
        }

        Ok(())
    }

    /// (re)bind a partition to the individuals it now holds, resetting it to pending
    pub fn assign(&self, id: usize, members: &str) -> Result<(), LedgerError> {
        self.record(&PartitionRecord {
            id,
            status: PartitionStatus::Pending,
            individuals: None,
            job: None,
            members: Some(members.to_owned()),
        })
    }

    pub fn submitted(&self, id: usize, job: &str) -> Result<(), LedgerError> {
        let changed = self
            .connection
            .prepare_cached("update partitions set status = ?, job = ? where id = ?")?
            .execute(params![PartitionStatus::Submitted as i64, job, id as i64])?;

        if changed == 0 {
            self.record(&PartitionRecord {
                id,
                status: PartitionStatus::Submitted,
                individuals: None,
                job: Some(job.to_owned()),
                members: None,
            })?;
        }

        Ok(())
    }

    pub fn done(&self, id: usize, individuals: usize) -> Result<(), LedgerError> {
        let changed = self
            .connection
            .prepare_cached("update partitions set status = ?, individuals = ? where id = ?")?
            .execute(params![
                PartitionStatus::Done as i64,
                individuals as i64,
                id as i64
            ])?;

        if changed == 0 {
            self.record(&PartitionRecord {
                id,
                status: PartitionStatus::Done,
                individuals: Some(individuals),
                job: None,
                members: None,
            })?;
        }

        Ok(())
    }

    pub fn partitions(&self) -> Result<BTreeMap<usize, PartitionRecord>, LedgerError> {
        self.connection
            .prepare_cached(
                "select id, status, individuals, job, members from partitions order by id",
            )?
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .try_fold(BTreeMap::new(), |mut init, result| {
                let (id, status, individuals, job, members) = result?;
                let id = id as usize;

                init.insert(
                    id,
                    PartitionRecord {
                        id,
                        status: PartitionStatus::try_from(status)?,
                        individuals: individuals.map(|count| count as usize),
                        job,
                        members,
                    },
                );

                Ok::<_, LedgerError>(init)
            })
    }

    /// close and delete the ledger once the run needs no resuming
    pub fn remove(mut self) -> Result<(), LedgerError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(error.into());
            }
        }

        fs::remove_file(&self.path).map_err(|source| LedgerError::Remove {
            path: self.path.clone(),
            source,
        })?;
        info!(path = ?self.path, "Removed partition ledger");

        Ok(())
    }
}
