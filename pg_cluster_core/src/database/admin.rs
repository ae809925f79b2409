//! Replication admin role and database maintenance over SQL

use crate::error::{ClusterError, Result};
use crate::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use tokio_postgres::NoTls;

/// Read the shared admin password from its secret file
pub fn read_credential(path: &Path) -> Result<String> {
    let password = std::fs::read_to_string(path)?.trim().to_string();
    if password.is_empty() {
        return Err(ClusterError::configuration(format!(
            "admin credential file {} is empty",
            path.display()
        )));
    }
    Ok(password)
}

/// Quote a string literal for interpolation into a utility statement
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an identifier
pub fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// SQL session against the local server
#[async_trait::async_trait]
pub trait AdminSession {
    /// Create or update the replication role and its database
    async fn ensure_replication_admin(&self, password: &str) -> Result<()>;
}

/// `AdminSession` over tokio-postgres through the local socket
pub struct PostgresAdmin {
    socket_dir: PathBuf,
    port: u16,
    superuser: String,
    role: String,
    database: String,
    retry: RetryPolicy,
}

impl PostgresAdmin {
    pub fn new(
        socket_dir: PathBuf,
        port: u16,
        superuser: &str,
        role: &str,
        database: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            socket_dir,
            port,
            superuser: superuser.to_string(),
            role: role.to_string(),
            database: database.to_string(),
            retry,
        }
    }

    fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} dbname=postgres",
            self.socket_dir.display(),
            self.port,
            self.superuser
        )
    }

    async fn apply(&self, password: &str) -> Result<()> {
        if password.contains('\0') {
            return Err(ClusterError::configuration("admin credential contains a NUL byte"));
        }

        let (client, connection) = tokio_postgres::connect(&self.connection_string(), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("Admin connection error: {}", e);
            }
        });

        tracing::info!("Resetting {} database user password", self.role);
        let role_exists = client
            .query_opt("SELECT TRUE FROM pg_roles WHERE rolname = $1", &[&self.role])
            .await?
            .is_some();
        let verb = if role_exists { "ALTER" } else { "CREATE" };
        client
            .batch_execute(&role_statement(verb, &self.role, password))
            .await?;

        tracing::info!("Maintaining {} database", self.database);
        let database_exists = client
            .query_opt("SELECT TRUE FROM pg_database WHERE datname = $1", &[&self.database])
            .await?
            .is_some();
        client
            .batch_execute(&database_statement(database_exists, &self.database, &self.role))
            .await?;

        Ok(())
    }
}

fn role_statement(verb: &str, role: &str, password: &str) -> String {
    format!(
        "{} ROLE {} WITH LOGIN SUPERUSER REPLICATION PASSWORD {}",
        verb,
        quote_ident(role),
        quote_literal(password)
    )
}

fn database_statement(exists: bool, database: &str, owner: &str) -> String {
    if exists {
        format!("ALTER DATABASE {} OWNER TO {}", quote_ident(database), quote_ident(owner))
    } else {
        format!("CREATE DATABASE {} OWNER {}", quote_ident(database), quote_ident(owner))
    }
}

#[async_trait::async_trait]
impl AdminSession for PostgresAdmin {
    async fn ensure_replication_admin(&self, password: &str) -> Result<()> {
        // The server may still be starting up
        self.retry
            .run("ensure_replication_admin", || self.apply(password))
            .await
    }
}
