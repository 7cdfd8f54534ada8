//! Scoped connection lifecycle. Two variants: connection-managed, where
//! commit/rollback delegate to the connection and close returns it to its
//! source, and externally-managed, where the container decides and the
//! runtime's commit/rollback are no-ops.

use std::sync::Arc;
use std::time::Duration;

use squill_core::driver::{Connection, IsolationLevel};
use squill_core::errors::Result;

use crate::datasource::DataSource;

pub trait Transaction: Send {
    /// Lazily acquires the connection on first use.
    fn connection(&mut self) -> Result<&mut dyn Connection>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn timeout(&self) -> Option<Duration> {
        None
    }
}

pub trait TransactionFactory: Send + Sync {
    fn new_transaction(
        &self,
        data_source: &Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Box<dyn Transaction>;
}

/// Commit and rollback delegate to the connection; closing resets
/// auto-commit and hands the connection back.
pub struct LocalTransaction {
    data_source: Arc<dyn DataSource>,
    connection: Option<Box<dyn Connection>>,
    isolation: Option<IsolationLevel>,
    auto_commit: bool,
}

impl LocalTransaction {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Self {
        Self {
            data_source,
            connection: None,
            isolation,
            auto_commit,
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let mut connection = self.data_source.connection()?;
        if let Some(isolation) = self.isolation {
            connection.set_isolation(isolation)?;
        }
        connection.set_auto_commit(self.auto_commit)?;
        self.connection = Some(connection);
        Ok(())
    }
}

impl Transaction for LocalTransaction {
    fn connection(&mut self) -> Result<&mut dyn Connection> {
        self.open()?;
        Ok(self
            .connection
            .as_mut()
            .expect("connection opened above")
            .as_mut())
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_mut()
            && !connection.auto_commit()
        {
            tracing::debug!("committing connection");
            connection.commit()?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.as_mut()
            && !connection.auto_commit()
        {
            tracing::debug!("rolling back connection");
            connection.rollback()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            // restore auto-commit so a pooled connection goes back clean
            if !connection.auto_commit() {
                let _ = connection.set_auto_commit(true);
            }
            connection.close()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LocalTransactionFactory;

impl TransactionFactory for LocalTransactionFactory {
    fn new_transaction(
        &self,
        data_source: &Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Box<dyn Transaction> {
        Box::new(LocalTransaction::new(
            data_source.clone(),
            isolation,
            auto_commit,
        ))
    }
}

/// The container owns the transaction outcome; commit/rollback here are
/// deliberate no-ops.
pub struct ManagedTransaction {
    data_source: Arc<dyn DataSource>,
    connection: Option<Box<dyn Connection>>,
    isolation: Option<IsolationLevel>,
    close_connection: bool,
}

impl ManagedTransaction {
    pub fn new(
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        close_connection: bool,
    ) -> Self {
        Self {
            data_source,
            connection: None,
            isolation,
            close_connection,
        }
    }
}

impl Transaction for ManagedTransaction {
    fn connection(&mut self) -> Result<&mut dyn Connection> {
        if self.connection.is_none() {
            let mut connection = self.data_source.connection()?;
            if let Some(isolation) = self.isolation {
                connection.set_isolation(isolation)?;
            }
            self.connection = Some(connection);
        }
        Ok(self
            .connection
            .as_mut()
            .expect("connection opened above")
            .as_mut())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take()
            && self.close_connection
        {
            connection.close()?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ManagedTransactionFactory {
    pub close_connection: bool,
}

impl Default for ManagedTransactionFactory {
    fn default() -> Self {
        Self {
            close_connection: true,
        }
    }
}

impl TransactionFactory for ManagedTransactionFactory {
    fn new_transaction(
        &self,
        data_source: &Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        _auto_commit: bool,
    ) -> Box<dyn Transaction> {
        Box::new(ManagedTransaction::new(
            data_source.clone(),
            isolation,
            self.close_connection,
        ))
    }
}
