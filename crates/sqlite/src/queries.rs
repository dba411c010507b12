//! Statements shared by readers and writers
//!
//! Every function runs on a bare connection, so the same code serves a
//! pooled connection and an open transaction.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use uuid::Uuid;

use engine::model::{
    Capability, CapabilityId, DeleteRecursive, Edge, Pool, PoolId, Resource, ResourceId, Tag,
    Tenant, TenantId,
};
use engine::store::{CapabilityQuery, StoreError};

const RESOURCE_COLUMNS: &str =
    "id, tenant_id, pool_id, type_name, state, payload, content_hash, version, destroy_at";
const CAPABILITY_COLUMNS: &str =
    "id, tenant_id, resource_id, key_digest, nonce, ciphertext, start_at, stop_at, used_at";

pub(crate) fn db_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Default(err.into())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| StoreError::Default(anyhow::anyhow!("timestamp {} out of range", ms)))
    })
    .transpose()
}

fn bytes(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(db_error)
}

fn uuid_column(row: &SqliteRow, name: &str) -> Result<Uuid, StoreError> {
    let raw: String = column(row, name)?;
    Uuid::parse_str(&raw)
        .map_err(|e| StoreError::Default(anyhow::anyhow!("malformed id in {}: {}", name, e)))
}

fn pool_from_row(row: &SqliteRow) -> Result<Pool, StoreError> {
    Ok(Pool {
        id: uuid_column(row, "id")?.into(),
        quota: column::<Option<i64>>(row, "quota")?.map(|q| q.max(0) as u64),
        bytes_in_use: column::<i64>(row, "bytes_in_use")?.max(0) as u64,
        max_upload_size: column::<Option<i64>>(row, "max_upload_size")?.map(|m| m.max(0) as u64),
        last_used: from_millis(column(row, "last_used")?)?,
        active: column(row, "active")?,
    })
}

fn tenant_from_row(row: &SqliteRow) -> Result<Tenant, StoreError> {
    Ok(Tenant {
        id: uuid_column(row, "id")?.into(),
        name: column(row, "name")?,
        public: column(row, "public")?,
        pool: uuid_column(row, "pool_id")?.into(),
        version: uuid_column(row, "version")?.into(),
        destroy_at: from_millis(column(row, "destroy_at")?)?,
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<Edge, StoreError> {
    let policy: String = column(row, "delete_recursive")?;
    Ok(Edge {
        source: uuid_column(row, "source_id")?.into(),
        target: uuid_column(row, "target_id")?.into(),
        group: column(row, "group_name")?,
        extra: column(row, "extra")?,
        delete_recursive: DeleteRecursive::parse(&policy).ok_or_else(|| {
            StoreError::Default(anyhow::anyhow!("unknown delete policy {}", policy))
        })?,
    })
}

fn capability_from_row(row: &SqliteRow) -> Result<Capability, StoreError> {
    let resource: Option<String> = column(row, "resource_id")?;
    let resource = match resource {
        Some(raw) => Some(
            Uuid::parse_str(&raw)
                .map_err(|e| StoreError::Default(anyhow::anyhow!("malformed resource id: {}", e)))?
                .into(),
        ),
        None => None,
    };
    let start = from_millis(Some(column(row, "start_at")?))?
        .ok_or_else(|| StoreError::Default(anyhow::anyhow!("capability without start")))?;
    Ok(Capability {
        id: uuid_column(row, "id")?.into(),
        tenant: uuid_column(row, "tenant_id")?.into(),
        resource,
        key_digest: column(row, "key_digest")?,
        nonce: column(row, "nonce")?,
        ciphertext: column(row, "ciphertext")?,
        start,
        stop: from_millis(column(row, "stop_at")?)?,
        used: from_millis(column(row, "used_at")?)?,
    })
}

async fn tags_of(conn: &mut SqliteConnection, id: ResourceId) -> Result<BTreeSet<Tag>, StoreError> {
    let rows = sqlx::query("SELECT tag FROM resource_tags WHERE resource_id = $1")
        .bind(id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;
    rows.iter()
        .map(|row| {
            let raw: String = column(row, "tag")?;
            Tag::parse(&raw).map_err(|e| StoreError::Default(e.into()))
        })
        .collect()
}

async fn resource_from_row(
    conn: &mut SqliteConnection,
    row: &SqliteRow,
) -> Result<Resource, StoreError> {
    let id: ResourceId = uuid_column(row, "id")?.into();
    Ok(Resource {
        id,
        tenant: uuid_column(row, "tenant_id")?.into(),
        pool: uuid_column(row, "pool_id")?.into(),
        type_name: column(row, "type_name")?,
        state: column(row, "state")?,
        payload: column(row, "payload")?,
        content_hash: column(row, "content_hash")?,
        tags: tags_of(conn, id).await?,
        version: uuid_column(row, "version")?.into(),
        destroy_at: from_millis(column(row, "destroy_at")?)?,
    })
}

async fn resources_from_rows(
    conn: &mut SqliteConnection,
    rows: Vec<SqliteRow>,
) -> Result<Vec<Resource>, StoreError> {
    let mut resources = Vec::with_capacity(rows.len());
    for row in &rows {
        resources.push(resource_from_row(conn, row).await?);
    }
    Ok(resources)
}

pub(crate) async fn pool(conn: &mut SqliteConnection, id: PoolId) -> Result<Option<Pool>, StoreError> {
    sqlx::query(
        r#"
        SELECT id, quota, bytes_in_use, max_upload_size, last_used, active
        FROM pools
        WHERE id = $1
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .as_ref()
    .map(pool_from_row)
    .transpose()
}

pub(crate) async fn tenant(
    conn: &mut SqliteConnection,
    id: TenantId,
) -> Result<Option<Tenant>, StoreError> {
    sqlx::query(
        r#"
        SELECT id, name, public, pool_id, version, destroy_at
        FROM tenants
        WHERE id = $1
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .as_ref()
    .map(tenant_from_row)
    .transpose()
}

pub(crate) async fn tenant_by_name(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<Tenant>, StoreError> {
    sqlx::query(
        r#"
        SELECT id, name, public, pool_id, version, destroy_at
        FROM tenants
        WHERE name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .as_ref()
    .map(tenant_from_row)
    .transpose()
}

pub(crate) async fn resource(
    conn: &mut SqliteConnection,
    id: ResourceId,
) -> Result<Option<Resource>, StoreError> {
    let row = sqlx::query(&format!("SELECT {} FROM resources WHERE id = $1", RESOURCE_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    match row {
        Some(row) => Ok(Some(resource_from_row(conn, &row).await?)),
        None => Ok(None),
    }
}

pub(crate) async fn resource_by_hash(
    conn: &mut SqliteConnection,
    tenant: TenantId,
    hash: &str,
) -> Result<Option<Resource>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM resources WHERE tenant_id = $1 AND content_hash = $2",
        RESOURCE_COLUMNS
    ))
    .bind(tenant.to_string())
    .bind(hash)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;
    match row {
        Some(row) => Ok(Some(resource_from_row(conn, &row).await?)),
        None => Ok(None),
    }
}

pub(crate) async fn resources_of_tenant(
    conn: &mut SqliteConnection,
    tenant: TenantId,
) -> Result<Vec<Resource>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM resources WHERE tenant_id = $1 ORDER BY id",
        RESOURCE_COLUMNS
    ))
    .bind(tenant.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;
    resources_from_rows(conn, rows).await
}

pub(crate) async fn resources_due(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ResourceId>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id FROM resources
        WHERE destroy_at IS NOT NULL AND destroy_at <= $1
        ORDER BY destroy_at, id
        "#,
    )
    .bind(millis(cutoff))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;
    rows.iter()
        .map(|row| uuid_column(row, "id").map(Into::into))
        .collect()
}

pub(crate) async fn tenants_due(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<TenantId>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id FROM tenants
        WHERE destroy_at IS NOT NULL AND destroy_at <= $1
        ORDER BY destroy_at, id
        "#,
    )
    .bind(millis(cutoff))
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?;
    rows.iter()
        .map(|row| uuid_column(row, "id").map(Into::into))
        .collect()
}

pub(crate) async fn edges_from(
    conn: &mut SqliteConnection,
    source: ResourceId,
) -> Result<Vec<Edge>, StoreError> {
    sqlx::query(
        r#"
        SELECT source_id, target_id, group_name, extra, delete_recursive
        FROM edges
        WHERE source_id = $1
        ORDER BY target_id, group_name
        "#,
    )
    .bind(source.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    .iter()
    .map(edge_from_row)
    .collect()
}

pub(crate) async fn edges_to(
    conn: &mut SqliteConnection,
    target: ResourceId,
) -> Result<Vec<Edge>, StoreError> {
    sqlx::query(
        r#"
        SELECT source_id, target_id, group_name, extra, delete_recursive
        FROM edges
        WHERE target_id = $1
        ORDER BY source_id, group_name
        "#,
    )
    .bind(target.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    .iter()
    .map(edge_from_row)
    .collect()
}

pub(crate) async fn capability_links(
    conn: &mut SqliteConnection,
    resource: ResourceId,
) -> Result<BTreeSet<CapabilityId>, StoreError> {
    let rows = sqlx::query("SELECT id FROM capabilities WHERE resource_id = $1")
        .bind(resource.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;
    rows.iter()
        .map(|row| uuid_column(row, "id").map(Into::into))
        .collect()
}

pub(crate) async fn capability(
    conn: &mut SqliteConnection,
    id: CapabilityId,
) -> Result<Option<Capability>, StoreError> {
    sqlx::query(&format!(
        "SELECT {} FROM capabilities WHERE id = $1",
        CAPABILITY_COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .as_ref()
    .map(capability_from_row)
    .transpose()
}

/// Narrow by tenant and digest in SQL, the validity window and binding are
///  checked on the decoded rows
pub(crate) async fn capabilities(
    conn: &mut SqliteConnection,
    query: CapabilityQuery<'_>,
) -> Result<Vec<Capability>, StoreError> {
    if query.digests.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM capabilities WHERE used_at IS NULL AND tenant_id = ",
        CAPABILITY_COLUMNS
    ));
    builder.push_bind(query.tenant.to_string());
    builder.push(" AND key_digest IN (");
    let mut digests = builder.separated(", ");
    for digest in query.digests {
        digests.push_bind(digest.clone());
    }
    digests.push_unseparated(") ORDER BY id");

    let rows = builder
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error)?;
    let mut found = Vec::with_capacity(rows.len());
    for row in &rows {
        let capability = capability_from_row(row)?;
        if query.matches(&capability) {
            found.push(capability);
        }
    }
    Ok(found)
}

pub(crate) async fn capabilities_of_tenant(
    conn: &mut SqliteConnection,
    tenant: TenantId,
) -> Result<Vec<Capability>, StoreError> {
    sqlx::query(&format!(
        "SELECT {} FROM capabilities WHERE tenant_id = $1 ORDER BY id",
        CAPABILITY_COLUMNS
    ))
    .bind(tenant.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)?
    .iter()
    .map(capability_from_row)
    .collect()
}

pub(crate) async fn insert_pool(conn: &mut SqliteConnection, pool: &Pool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO pools (id, quota, bytes_in_use, max_upload_size, last_used, active)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(pool.id.to_string())
    .bind(bytes(pool.quota))
    .bind(bytes(Some(pool.bytes_in_use)))
    .bind(bytes(pool.max_upload_size))
    .bind(pool.last_used.map(millis))
    .bind(pool.active)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

/// The quota check and the update are one statement, so concurrent writers
///  on other connections cannot both pass the check
pub(crate) async fn adjust_pool_usage(
    conn: &mut SqliteConnection,
    id: PoolId,
    delta: i64,
    enforce_quota: bool,
    now: DateTime<Utc>,
) -> Result<Option<u64>, StoreError> {
    let row = sqlx::query(
        r#"
        UPDATE pools
        SET bytes_in_use = MAX(bytes_in_use + $1, 0), last_used = $2
        WHERE id = $3
          AND ($4 = 0 OR $1 <= 0 OR quota IS NULL OR bytes_in_use + $1 <= quota)
        RETURNING bytes_in_use
        "#,
    )
    .bind(delta)
    .bind(millis(now))
    .bind(id.to_string())
    .bind(enforce_quota)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?;

    match row {
        Some(row) => Ok(Some(column::<i64>(&row, "bytes_in_use")?.max(0) as u64)),
        None => match pool(conn, id).await? {
            Some(_) => Ok(None),
            None => Err(StoreError::NotFound(format!("pool {}", id))),
        },
    }
}

pub(crate) async fn put_tenant(conn: &mut SqliteConnection, tenant: &Tenant) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO tenants (id, name, public, pool_id, version, destroy_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            public = excluded.public,
            pool_id = excluded.pool_id,
            version = excluded.version,
            destroy_at = excluded.destroy_at
        "#,
    )
    .bind(tenant.id.to_string())
    .bind(tenant.name.as_deref())
    .bind(tenant.public)
    .bind(tenant.pool.to_string())
    .bind(tenant.version.to_string())
    .bind(tenant.destroy_at.map(millis))
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

pub(crate) async fn delete_tenant(conn: &mut SqliteConnection, id: TenantId) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM capabilities WHERE tenant_id = $1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    sqlx::query("DELETE FROM tenants WHERE id = $1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

pub(crate) async fn put_resource(
    conn: &mut SqliteConnection,
    resource: &Resource,
) -> Result<(), StoreError> {
    let id = resource.id.to_string();
    sqlx::query(
        r#"
        INSERT INTO resources
            (id, tenant_id, pool_id, type_name, state, payload, content_hash, version, destroy_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT(id) DO UPDATE SET
            tenant_id = excluded.tenant_id,
            pool_id = excluded.pool_id,
            type_name = excluded.type_name,
            state = excluded.state,
            payload = excluded.payload,
            content_hash = excluded.content_hash,
            version = excluded.version,
            destroy_at = excluded.destroy_at
        "#,
    )
    .bind(&id)
    .bind(resource.tenant.to_string())
    .bind(resource.pool.to_string())
    .bind(&resource.type_name)
    .bind(&resource.state)
    .bind(&resource.payload)
    .bind(&resource.content_hash)
    .bind(resource.version.to_string())
    .bind(resource.destroy_at.map(millis))
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    sqlx::query("DELETE FROM resource_tags WHERE resource_id = $1")
        .bind(&id)
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    for tag in &resource.tags {
        sqlx::query("INSERT INTO resource_tags (resource_id, tag) VALUES ($1, $2)")
            .bind(&id)
            .bind(tag.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    Ok(())
}

pub(crate) async fn delete_resource(
    conn: &mut SqliteConnection,
    id: ResourceId,
) -> Result<(), StoreError> {
    let id = id.to_string();
    for statement in [
        "DELETE FROM edges WHERE source_id = $1 OR target_id = $1",
        "DELETE FROM capabilities WHERE resource_id = $1",
        "DELETE FROM resource_tags WHERE resource_id = $1",
        "DELETE FROM resources WHERE id = $1",
    ] {
        sqlx::query(statement)
            .bind(&id)
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
    }
    Ok(())
}

pub(crate) async fn replace_edges(
    conn: &mut SqliteConnection,
    source: ResourceId,
    edges: &[Edge],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM edges WHERE source_id = $1")
        .bind(source.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    for edge in edges {
        sqlx::query(
            r#"
            INSERT INTO edges (source_id, target_id, group_name, extra, delete_recursive)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(edge.source.to_string())
        .bind(edge.target.to_string())
        .bind(&edge.group)
        .bind(&edge.extra)
        .bind(edge.delete_recursive.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    }
    Ok(())
}

pub(crate) async fn put_capability(
    conn: &mut SqliteConnection,
    capability: &Capability,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO capabilities ({})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT(id) DO UPDATE SET
            tenant_id = excluded.tenant_id,
            resource_id = excluded.resource_id,
            key_digest = excluded.key_digest,
            nonce = excluded.nonce,
            ciphertext = excluded.ciphertext,
            start_at = excluded.start_at,
            stop_at = excluded.stop_at,
            used_at = excluded.used_at
        "#,
        CAPABILITY_COLUMNS
    ))
    .bind(capability.id.to_string())
    .bind(capability.tenant.to_string())
    .bind(capability.resource.map(|id| id.to_string()))
    .bind(&capability.key_digest)
    .bind(&capability.nonce)
    .bind(&capability.ciphertext)
    .bind(millis(capability.start))
    .bind(capability.stop.map(millis))
    .bind(capability.used.map(millis))
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

pub(crate) async fn delete_capability(
    conn: &mut SqliteConnection,
    id: CapabilityId,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM capabilities WHERE id = $1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

pub(crate) async fn set_capability_digest(
    conn: &mut SqliteConnection,
    id: CapabilityId,
    digest: &str,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE capabilities SET key_digest = $1 WHERE id = $2")
        .bind(digest)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}

pub(crate) async fn set_capability_used(
    conn: &mut SqliteConnection,
    id: CapabilityId,
    used: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE capabilities SET used_at = $1 WHERE id = $2")
        .bind(used.map(millis))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(())
}
