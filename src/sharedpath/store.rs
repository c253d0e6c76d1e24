/*
 * Copyright (C) 2026 The Sharedpath Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::sharedpath::logger::log_debug;
use crate::sharedpath::util::error::{with_context, DynResult};

/// Filesystem work paired with a catalog write dominates latency, so the
/// pool stays small.
const MAX_CONNECTIONS: u32 = 5;

const COMPONENT: &str = "store";

/// Catalog row for one provisioned volume. `deleted_at` implements the
/// soft-delete window the dangling-cleanup job later purges.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VolumeRow {
    pub storage_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub vol_id: String,
    pub vol_name: String,
    pub pv_name: String,
    pub pvc_name: String,
    pub ns_name: String,
    pub capacity: i64,
    pub is_block: bool,
    pub vol_path: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeInfoRow {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ControllerPublicationRow {
    pub vol_id: String,
    pub node_id: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodePublicationRow {
    pub vol_id: String,
    pub node_id: String,
    pub mount_path: String,
    pub raw_mount: bool,
    pub read_only: bool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS volumes (
        storage_id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        deleted_at TIMESTAMPTZ,
        vol_id TEXT NOT NULL UNIQUE,
        vol_name TEXT NOT NULL,
        pv_name TEXT NOT NULL,
        pvc_name TEXT NOT NULL,
        ns_name TEXT NOT NULL,
        capacity BIGINT NOT NULL,
        is_block BOOLEAN NOT NULL,
        vol_path TEXT NOT NULL UNIQUE
    )",
    "CREATE INDEX IF NOT EXISTS idx_volumes_vol_name ON volumes (vol_name)",
    "CREATE INDEX IF NOT EXISTS idx_volumes_ns_name ON volumes (ns_name)",
    "CREATE INDEX IF NOT EXISTS idx_volumes_deleted_at ON volumes (deleted_at)",
    "CREATE TABLE IF NOT EXISTS node_infos (
        node_id TEXT PRIMARY KEY,
        last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS controller_publications (
        storage_id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        vol_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        read_only BOOLEAN NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_controller_publications_vol_node
        ON controller_publications (vol_id, node_id)",
    "CREATE TABLE IF NOT EXISTS node_publications (
        storage_id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        vol_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        mount_path TEXT NOT NULL,
        raw_mount BOOLEAN NOT NULL,
        read_only BOOLEAN NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_node_publications_vol_node
        ON node_publications (vol_id, node_id)",
];

const VOLUME_COLUMNS: &str = "storage_id, created_at, updated_at, deleted_at, \
     vol_id, vol_name, pv_name, pvc_name, ns_name, capacity, is_block, vol_path";

/// Shared catalog handle. Clones share one bounded pool.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub async fn connect(dsn: &str) -> DynResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(dsn)
            .await
            .map_err(|e| with_context(e, "Failed to connect to the volume catalog"))?;
        let catalog = Self { pool };
        catalog.migrate().await?;
        Ok(catalog)
    }

    async fn migrate(&self) -> DynResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| with_context(e, "Failed to apply catalog schema"))?;
        }
        log_debug(COMPONENT, "Catalog schema ensured", &[]);
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn begin(&self) -> DynResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| with_context(e, "Failed to start catalog transaction"))
    }

    pub async fn get_volume(&self, vol_id: &str) -> DynResult<Option<VolumeRow>> {
        let query = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes WHERE vol_id = $1 AND deleted_at IS NULL"
        );
        sqlx::query_as::<_, VolumeRow>(&query)
            .bind(vol_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| with_context(e, format!("Failed to load volume '{vol_id}'")))
    }

    pub async fn get_volume_id_by_name(&self, vol_name: &str) -> DynResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT vol_id FROM volumes WHERE vol_name = $1 AND deleted_at IS NULL",
        )
        .bind(vol_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| with_context(e, format!("Failed to resolve volume name '{vol_name}'")))
    }

    /// Live volumes ordered by insertion. `limit` of `None` lists everything.
    pub async fn list_volumes(
        &self,
        offset: i64,
        limit: Option<i64>,
    ) -> DynResult<Vec<VolumeRow>> {
        let query = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes WHERE deleted_at IS NULL \
             ORDER BY storage_id OFFSET $1 LIMIT $2"
        );
        sqlx::query_as::<_, VolumeRow>(&query)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| with_context(e, "Failed to list volumes"))
    }

    pub async fn count_volumes(&self) -> DynResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM volumes WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| with_context(e, "Failed to count volumes"))
    }

    pub async fn list_soft_deleted_volumes(&self) -> DynResult<Vec<VolumeRow>> {
        let query = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes WHERE deleted_at IS NOT NULL \
             ORDER BY storage_id"
        );
        sqlx::query_as::<_, VolumeRow>(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| with_context(e, "Failed to list soft-deleted volumes"))
    }

    pub async fn find_live_volume_by_path(&self, vol_path: &str) -> DynResult<Option<VolumeRow>> {
        let query = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes WHERE vol_path = $1 AND deleted_at IS NULL"
        );
        sqlx::query_as::<_, VolumeRow>(&query)
            .bind(vol_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| with_context(e, format!("Failed to look up volume path '{vol_path}'")))
    }

    /// Permanently removes a soft-deleted row once its artifact is gone.
    pub async fn purge_volume(&self, vol_id: &str) -> DynResult<()> {
        sqlx::query("DELETE FROM volumes WHERE vol_id = $1 AND deleted_at IS NOT NULL")
            .bind(vol_id)
            .execute(&self.pool)
            .await
            .map_err(|e| with_context(e, format!("Failed to purge volume '{vol_id}'")))?;
        Ok(())
    }

    pub async fn upsert_node_last_seen(
        &self,
        node_id: &str,
        last_seen: DateTime<Utc>,
    ) -> DynResult<()> {
        sqlx::query(
            "INSERT INTO node_infos (node_id, last_seen) VALUES ($1, $2)
             ON CONFLICT (node_id) DO UPDATE SET last_seen = EXCLUDED.last_seen",
        )
        .bind(node_id)
        .bind(last_seen)
        .execute(&self.pool)
        .await
        .map_err(|e| with_context(e, format!("Failed to record heartbeat for node '{node_id}'")))?;
        Ok(())
    }

    /// Returns the node row only while its heartbeat is within `max_age`.
    pub async fn get_node_if_fresh(
        &self,
        node_id: &str,
        max_age: Duration,
    ) -> DynResult<Option<NodeInfoRow>> {
        let min_last_seen = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| with_context(e, "Invalid node freshness window"))?;
        sqlx::query_as::<_, NodeInfoRow>(
            "SELECT node_id, last_seen FROM node_infos
             WHERE node_id = $1 AND last_seen >= $2",
        )
        .bind(node_id)
        .bind(min_last_seen)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| with_context(e, format!("Failed to check freshness of node '{node_id}'")))
    }

    pub async fn create_controller_publication(
        &self,
        vol_id: &str,
        node_id: &str,
        read_only: bool,
    ) -> DynResult<()> {
        sqlx::query(
            "INSERT INTO controller_publications (vol_id, node_id, read_only)
             VALUES ($1, $2, $3)",
        )
        .bind(vol_id)
        .bind(node_id)
        .bind(read_only)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to record controller publication of '{vol_id}' on '{node_id}'"),
            )
        })?;
        Ok(())
    }

    pub async fn get_controller_publication(
        &self,
        vol_id: &str,
        node_id: &str,
    ) -> DynResult<Option<ControllerPublicationRow>> {
        sqlx::query_as::<_, ControllerPublicationRow>(
            "SELECT vol_id, node_id, read_only FROM controller_publications
             WHERE vol_id = $1 AND node_id = $2",
        )
        .bind(vol_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to load controller publication of '{vol_id}' on '{node_id}'"),
            )
        })
    }

    pub async fn delete_controller_publication(
        &self,
        vol_id: &str,
        node_id: &str,
    ) -> DynResult<()> {
        sqlx::query("DELETE FROM controller_publications WHERE vol_id = $1 AND node_id = $2")
            .bind(vol_id)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                with_context(
                    e,
                    format!("Failed to delete controller publication of '{vol_id}' on '{node_id}'"),
                )
            })?;
        Ok(())
    }

    pub async fn published_node_ids(&self, vol_id: &str) -> DynResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT node_id FROM controller_publications WHERE vol_id = $1 ORDER BY storage_id",
        )
        .bind(vol_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| with_context(e, format!("Failed to list published nodes for '{vol_id}'")))
    }

    pub async fn create_node_publication(
        &self,
        vol_id: &str,
        node_id: &str,
        mount_path: &str,
        raw_mount: bool,
        read_only: bool,
    ) -> DynResult<()> {
        sqlx::query(
            "INSERT INTO node_publications (vol_id, node_id, mount_path, raw_mount, read_only)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(vol_id)
        .bind(node_id)
        .bind(mount_path)
        .bind(raw_mount)
        .bind(read_only)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to record node publication of '{vol_id}' at '{mount_path}'"),
            )
        })?;
        Ok(())
    }

    pub async fn get_node_publication(
        &self,
        vol_id: &str,
        node_id: &str,
        mount_path: &str,
    ) -> DynResult<Option<NodePublicationRow>> {
        sqlx::query_as::<_, NodePublicationRow>(
            "SELECT vol_id, node_id, mount_path, raw_mount, read_only FROM node_publications
             WHERE vol_id = $1 AND node_id = $2 AND mount_path = $3",
        )
        .bind(vol_id)
        .bind(node_id)
        .bind(mount_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to load node publication of '{vol_id}' at '{mount_path}'"),
            )
        })
    }

    pub async fn delete_node_publication(
        &self,
        vol_id: &str,
        node_id: &str,
        mount_path: &str,
    ) -> DynResult<()> {
        sqlx::query(
            "DELETE FROM node_publications
             WHERE vol_id = $1 AND node_id = $2 AND mount_path = $3",
        )
        .bind(vol_id)
        .bind(node_id)
        .bind(mount_path)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            with_context(
                e,
                format!("Failed to delete node publication of '{vol_id}' at '{mount_path}'"),
            )
        })?;
        Ok(())
    }
}

/// Transaction-scoped writes used by the volume engine so catalog rows and
/// filesystem effects commit or roll back together.
#[allow(clippy::too_many_arguments)]
pub async fn insert_volume_tx(
    tx: &mut Transaction<'static, Postgres>,
    vol_id: &str,
    vol_name: &str,
    pv_name: &str,
    pvc_name: &str,
    ns_name: &str,
    capacity: i64,
    is_block: bool,
    vol_path: &str,
) -> DynResult<VolumeRow> {
    let query = format!(
        "INSERT INTO volumes (vol_id, vol_name, pv_name, pvc_name, ns_name, \
         capacity, is_block, vol_path)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING {VOLUME_COLUMNS}"
    );
    sqlx::query_as::<_, VolumeRow>(&query)
        .bind(vol_id)
        .bind(vol_name)
        .bind(pv_name)
        .bind(pvc_name)
        .bind(ns_name)
        .bind(capacity)
        .bind(is_block)
        .bind(vol_path)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| with_context(e, format!("Failed to insert volume '{vol_id}'")))
}

pub async fn soft_delete_volume_tx(
    tx: &mut Transaction<'static, Postgres>,
    vol_id: &str,
) -> DynResult<()> {
    sqlx::query(
        "UPDATE volumes SET deleted_at = now(), updated_at = now()
         WHERE vol_id = $1 AND deleted_at IS NULL",
    )
    .bind(vol_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| with_context(e, format!("Failed to soft-delete volume '{vol_id}'")))?;
    Ok(())
}

pub async fn update_volume_capacity_tx(
    tx: &mut Transaction<'static, Postgres>,
    vol_id: &str,
    capacity: i64,
) -> DynResult<()> {
    sqlx::query(
        "UPDATE volumes SET capacity = $2, updated_at = now()
         WHERE vol_id = $1 AND deleted_at IS NULL",
    )
    .bind(vol_id)
    .bind(capacity)
    .execute(&mut **tx)
    .await
    .map_err(|e| with_context(e, format!("Failed to update capacity of volume '{vol_id}'")))?;
    Ok(())
}
