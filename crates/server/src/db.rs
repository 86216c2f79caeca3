use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use serde::Serialize;
use tokio_postgres::{NoTls, Row};

use quill_protocol::{Company, Permission, PostgresConfig, Team, User};

use crate::auth;

/// A quote row, before hydration into a resource.
#[derive(Debug, Clone)]
pub struct QuoteRecord {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
}

/// One line of a quote.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteItem {
    pub id: i64,
    pub description: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

/// Record-fetching interface over the relational store. The control plane
/// only ever talks to this trait; SQL lives behind it.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a user by username and verify the password. Misses burn the
    /// same bcrypt work as hits so response timing does not reveal whether
    /// the username exists.
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<Arc<User>>>;

    /// Fetch a user snapshot (with teams) by id, without credentials.
    async fn user_by_id(&self, id: i64) -> Result<Option<Arc<User>>>;

    async fn quote(&self, id: i64) -> Result<Option<QuoteRecord>>;

    async fn quote_items(&self, quote_id: i64) -> Result<Vec<QuoteItem>>;
}

/// Postgres-backed directory over a deadpool connection pool.
pub struct PostgresDirectory {
    pool: Pool,
}

impl PostgresDirectory {
    pub fn connect(config: &PostgresConfig) -> Result<Self> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("Failed to create Postgres pool")?;
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool
            .get()
            .await
            .context("Failed to acquire a database connection")
    }

    /// Load the teams a user belongs to, with companies and permissions.
    async fn teams_for_user(&self, user_id: i64) -> Result<Vec<Team>> {
        let client = self.client().await?;

        let team_rows = client
            .query(
                "SELECT t.id, t.name, t.hierarchy_index, c.id AS company_id, c.name AS company_name \
                 FROM team_assignments a \
                 JOIN teams t ON t.id = a.team_id \
                 JOIN companies c ON c.id = t.company_id \
                 WHERE a.user_id = $1",
                &[&user_id],
            )
            .await
            .context("Failed to fetch teams")?;

        let permission_rows = client
            .query(
                "SELECT p.team_id, p.permission_type, p.permission_scope \
                 FROM team_permissions p \
                 JOIN team_assignments a ON a.team_id = p.team_id \
                 WHERE a.user_id = $1",
                &[&user_id],
            )
            .await
            .context("Failed to fetch team permissions")?;

        let mut permissions: HashMap<i64, Vec<Permission>> = HashMap::new();
        for row in &permission_rows {
            let team_id: i64 = row.get("team_id");
            let kind: String = row.get("permission_type");
            let scope: String = row.get("permission_scope");
            let permission = Permission::new(
                kind.parse()
                    .with_context(|| format!("Bad permission type in team {team_id}"))?,
                scope
                    .parse()
                    .with_context(|| format!("Bad permission scope in team {team_id}"))?,
            );
            permissions.entry(team_id).or_default().push(permission);
        }

        Ok(team_rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                Team {
                    id,
                    name: row.get("name"),
                    hierarchy_index: row.get("hierarchy_index"),
                    company: Company {
                        id: row.get("company_id"),
                        name: row.get("company_name"),
                    },
                    permissions: permissions.remove(&id).unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn hydrate_user(&self, row: &Row) -> Result<Arc<User>> {
        let id: i64 = row.get("id");
        let teams = self.teams_for_user(id).await?;
        Ok(Arc::new(User {
            id,
            username: row.get("username"),
            display_name: row.get("display_name"),
            email: row.get("email"),
            autopilot: row.get("autopilot"),
            admin: row.get("admin"),
            teams,
        }))
    }
}

#[async_trait]
impl Directory for PostgresDirectory {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Option<Arc<User>>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, username, password, display_name, email, autopilot, admin \
                 FROM users WHERE username = $1",
                &[&username],
            )
            .await
            .context("Failed to fetch user")?;

        let Some(row) = row else {
            let password = password.to_owned();
            tokio::task::spawn_blocking(move || auth::equalize_timing(&password))
                .await
                .context("bcrypt task panicked")?;
            return Ok(None);
        };

        let hash: String = row.get("password");
        let candidate = password.to_owned();
        let valid = tokio::task::spawn_blocking(move || auth::verify_password(&candidate, &hash))
            .await
            .context("bcrypt task panicked")?;
        if !valid {
            return Ok(None);
        }

        self.hydrate_user(&row).await.map(Some)
    }

    async fn user_by_id(&self, id: i64) -> Result<Option<Arc<User>>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, username, display_name, email, autopilot, admin \
                 FROM users WHERE id = $1",
                &[&id],
            )
            .await
            .context("Failed to fetch user")?;

        match row {
            Some(row) => self.hydrate_user(&row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn quote(&self, id: i64) -> Result<Option<QuoteRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, owner_id, title FROM quotes WHERE id = $1",
                &[&id],
            )
            .await
            .context("Failed to fetch quote")?;

        Ok(row.map(|row| QuoteRecord {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            title: row.get("title"),
        }))
    }

    async fn quote_items(&self, quote_id: i64) -> Result<Vec<QuoteItem>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, description, quantity, unit_price_cents \
                 FROM quote_items WHERE quote_id = $1 ORDER BY id",
                &[&quote_id],
            )
            .await
            .context("Failed to fetch quote items")?;

        Ok(rows
            .iter()
            .map(|row| QuoteItem {
                id: row.get("id"),
                description: row.get("description"),
                quantity: row.get("quantity"),
                unit_price_cents: row.get("unit_price_cents"),
            })
            .collect())
    }
}
