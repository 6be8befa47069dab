use std::{net::Ipv4Addr, path::Path, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tokio::fs;
use uuid::Uuid;

use crate::{
    models::{
        BaseImage, DeploymentEvent, GoldenImage, Network, Range, RangeRouter, Snapshot, Vm,
    },
    CyroidError, CyroidResult,
};

use super::RangeStore;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the cyroid database.
pub static CYROID_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/store/migrations");

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`RangeStore`] backed by SQLite. Nested values are stored as JSON text.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SqliteStore {
    /// Opens (creating and migrating if needed) the database at `db_path`.
    pub async fn open(db_path: impl AsRef<Path>) -> CyroidResult<Self> {
        Ok(Self {
            pool: init_db(db_path, &CYROID_DB_MIGRATOR).await?,
        })
    }

    /// Wraps an already migrated pool.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Appends a deployment event.
    pub async fn save_event(&self, event: &DeploymentEvent) -> CyroidResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_events (
                range_id, event_type, message, vm_id, extra_data_json, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.range_id.to_string())
        .bind(event.event_type.as_str())
        .bind(&event.message)
        .bind(event.vm_id.map(|id| id.to_string()))
        .bind(event.extra_data.as_ref().map(|v| v.to_string()))
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists the events of a range, oldest first.
    pub async fn list_events(&self, range_id: Uuid) -> CyroidResult<Vec<DeploymentEvent>> {
        let rows = sqlx::query("SELECT * FROM deployment_events WHERE range_id = ? ORDER BY id")
            .bind(range_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let extra: Option<String> = row.get("extra_data_json");
                Ok(DeploymentEvent {
                    range_id: parse_uuid(row.get("range_id"))?,
                    event_type: row.get::<String, _>("event_type").parse()?,
                    message: row.get("message"),
                    vm_id: parse_opt_uuid(row.get("vm_id"))?,
                    extra_data: extra.map(|s| serde_json::from_str(&s)).transpose()?,
                    created_at: parse_time(row.get("created_at"))?,
                })
            })
            .collect()
    }

    async fn get_catalog<T: DeserializeOwned>(&self, table: &str, id: Uuid) -> CyroidResult<Option<T>> {
        let row = sqlx::query(&format!("SELECT record_json FROM {table} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| from_json(row.get("record_json"))).transpose()
    }

    async fn save_catalog<T: Serialize>(
        &self,
        table: &str,
        id: Uuid,
        name: &str,
        record: &T,
    ) -> CyroidResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, name, record_json) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, record_json = excluded.record_json
            "#
        ))
        .bind(id.to_string())
        .bind(name)
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a new SQLite database if it doesn't already exist at the specified path.
///
/// ## Arguments
///
/// * `db_path` - Path where the SQLite database file should be created
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn init_db(db_path: impl AsRef<Path>, migrator: &Migrator) -> CyroidResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    if !db_path.exists() {
        fs::File::create(&db_path).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    migrator.run(&pool).await?;

    Ok(pool)
}

fn parse_uuid(value: String) -> CyroidResult<Uuid> {
    Uuid::parse_str(&value).map_err(CyroidError::custom)
}

fn parse_opt_uuid(value: Option<String>) -> CyroidResult<Option<Uuid>> {
    value.map(parse_uuid).transpose()
}

fn parse_time(value: String) -> CyroidResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(CyroidError::custom)
}

fn parse_ip(value: String) -> CyroidResult<Ipv4Addr> {
    Ipv4Addr::from_str(&value).map_err(|_| CyroidError::InvalidParameter {
        name: "ip_address",
        value,
    })
}

fn from_json<T: DeserializeOwned>(value: String) -> CyroidResult<T> {
    Ok(serde_json::from_str(&value)?)
}

fn opt_from_json<T: DeserializeOwned>(value: Option<String>) -> CyroidResult<Option<T>> {
    value.map(from_json).transpose()
}

fn opt_to_json<T: Serialize>(value: Option<&T>) -> CyroidResult<Option<String>> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn range_from_row(row: &SqliteRow) -> CyroidResult<Range> {
    Ok(Range {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        status: row.get::<String, _>("status").parse()?,
        error_message: row.get("error_message"),
        sandbox: opt_from_json(row.get("sandbox_json"))?,
        vnc_proxy_mappings: from_json(row.get("vnc_proxy_mappings_json"))?,
        created_at: parse_time(row.get("created_at"))?,
        modified_at: parse_time(row.get("modified_at"))?,
    })
}

fn network_from_row(row: &SqliteRow) -> CyroidResult<Network> {
    Ok(Network {
        id: parse_uuid(row.get("id"))?,
        range_id: parse_uuid(row.get("range_id"))?,
        name: row.get("name"),
        subnet: row.get::<String, _>("subnet").parse()?,
        gateway: parse_ip(row.get("gateway"))?,
        is_isolated: row.get("is_isolated"),
        internet_enabled: row.get("internet_enabled"),
        dhcp_enabled: row.get("dhcp_enabled"),
        dns_servers: from_json(row.get("dns_servers_json"))?,
        dns_search: row.get("dns_search"),
        docker_network_id: row.get("docker_network_id"),
        vyos_interface: row.get("vyos_interface"),
    })
}

fn vm_from_row(row: &SqliteRow) -> CyroidResult<Vm> {
    Ok(Vm {
        id: parse_uuid(row.get("id"))?,
        range_id: parse_uuid(row.get("range_id"))?,
        network_id: parse_uuid(row.get("network_id"))?,
        hostname: row.get("hostname"),
        ip_address: parse_ip(row.get("ip_address"))?,
        resources: from_json(row.get("resources_json"))?,
        status: row.get::<String, _>("status").parse()?,
        error_message: row.get("error_message"),
        container_id: row.get("container_id"),
        base_image_id: parse_opt_uuid(row.get("base_image_id"))?,
        golden_image_id: parse_opt_uuid(row.get("golden_image_id"))?,
        snapshot_id: parse_opt_uuid(row.get("snapshot_id"))?,
        display_type: row.get::<String, _>("display_type").parse()?,
        boot_source: row
            .get::<Option<String>, _>("boot_source")
            .map(|s| s.parse())
            .transpose()?,
        linux_user: opt_from_json(row.get("linux_user_json"))?,
        windows_credentials: opt_from_json(row.get("windows_credentials_json"))?,
    })
}

fn router_from_row(row: &SqliteRow) -> CyroidResult<RangeRouter> {
    Ok(RangeRouter {
        range_id: parse_uuid(row.get("range_id"))?,
        management_ip: row
            .get::<Option<String>, _>("management_ip")
            .map(parse_ip)
            .transpose()?,
        container_id: row.get("container_id"),
        status: row.get::<String, _>("status").parse()?,
        error_message: row.get("error_message"),
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RangeStore for SqliteStore {
    async fn get_range(&self, id: Uuid) -> CyroidResult<Option<Range>> {
        sqlx::query("SELECT * FROM ranges WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(range_from_row)
            .transpose()
    }

    async fn list_ranges(&self) -> CyroidResult<Vec<Range>> {
        sqlx::query("SELECT * FROM ranges ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(range_from_row)
            .collect()
    }

    async fn save_range(&self, range: &Range) -> CyroidResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ranges (
                id, name, status, error_message, sandbox_json,
                vnc_proxy_mappings_json, created_at, modified_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                error_message = excluded.error_message,
                sandbox_json = excluded.sandbox_json,
                vnc_proxy_mappings_json = excluded.vnc_proxy_mappings_json,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(range.id.to_string())
        .bind(&range.name)
        .bind(range.status.as_str())
        .bind(&range.error_message)
        .bind(opt_to_json(range.sandbox.as_ref())?)
        .bind(serde_json::to_string(&range.vnc_proxy_mappings)?)
        .bind(range.created_at.to_rfc3339())
        .bind(range.modified_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_network(&self, id: Uuid) -> CyroidResult<Option<Network>> {
        sqlx::query("SELECT * FROM networks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(network_from_row)
            .transpose()
    }

    async fn list_networks(&self, range_id: Uuid) -> CyroidResult<Vec<Network>> {
        sqlx::query("SELECT * FROM networks WHERE range_id = ? ORDER BY seq")
            .bind(range_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(network_from_row)
            .collect()
    }

    async fn save_network(&self, network: &Network) -> CyroidResult<()> {
        sqlx::query(
            r#"
            INSERT INTO networks (
                id, range_id, name, subnet, gateway, is_isolated, internet_enabled,
                dhcp_enabled, dns_servers_json, dns_search, docker_network_id, vyos_interface
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                subnet = excluded.subnet,
                gateway = excluded.gateway,
                is_isolated = excluded.is_isolated,
                internet_enabled = excluded.internet_enabled,
                dhcp_enabled = excluded.dhcp_enabled,
                dns_servers_json = excluded.dns_servers_json,
                dns_search = excluded.dns_search,
                docker_network_id = excluded.docker_network_id,
                vyos_interface = excluded.vyos_interface
            "#,
        )
        .bind(network.id.to_string())
        .bind(network.range_id.to_string())
        .bind(&network.name)
        .bind(network.subnet.to_string())
        .bind(network.gateway.to_string())
        .bind(network.is_isolated)
        .bind(network.internet_enabled)
        .bind(network.dhcp_enabled)
        .bind(serde_json::to_string(&network.dns_servers)?)
        .bind(&network.dns_search)
        .bind(&network.docker_network_id)
        .bind(&network.vyos_interface)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_vm(&self, id: Uuid) -> CyroidResult<Option<Vm>> {
        sqlx::query("SELECT * FROM vms WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(vm_from_row)
            .transpose()
    }

    async fn list_vms(&self, range_id: Uuid) -> CyroidResult<Vec<Vm>> {
        sqlx::query("SELECT * FROM vms WHERE range_id = ? ORDER BY seq")
            .bind(range_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(vm_from_row)
            .collect()
    }

    async fn save_vm(&self, vm: &Vm) -> CyroidResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vms (
                id, range_id, network_id, hostname, ip_address, resources_json, status,
                error_message, container_id, base_image_id, golden_image_id, snapshot_id,
                display_type, boot_source, linux_user_json, windows_credentials_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                network_id = excluded.network_id,
                hostname = excluded.hostname,
                ip_address = excluded.ip_address,
                resources_json = excluded.resources_json,
                status = excluded.status,
                error_message = excluded.error_message,
                container_id = excluded.container_id,
                base_image_id = excluded.base_image_id,
                golden_image_id = excluded.golden_image_id,
                snapshot_id = excluded.snapshot_id,
                display_type = excluded.display_type,
                boot_source = excluded.boot_source,
                linux_user_json = excluded.linux_user_json,
                windows_credentials_json = excluded.windows_credentials_json
            "#,
        )
        .bind(vm.id.to_string())
        .bind(vm.range_id.to_string())
        .bind(vm.network_id.to_string())
        .bind(&vm.hostname)
        .bind(vm.ip_address.to_string())
        .bind(serde_json::to_string(&vm.resources)?)
        .bind(vm.status.as_str())
        .bind(&vm.error_message)
        .bind(&vm.container_id)
        .bind(vm.base_image_id.map(|id| id.to_string()))
        .bind(vm.golden_image_id.map(|id| id.to_string()))
        .bind(vm.snapshot_id.map(|id| id.to_string()))
        .bind(vm.display_type.as_str())
        .bind(vm.boot_source.map(|b| b.as_str()))
        .bind(opt_to_json(vm.linux_user.as_ref())?)
        .bind(opt_to_json(vm.windows_credentials.as_ref())?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_vm(&self, id: Uuid) -> CyroidResult<bool> {
        let result = sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_router(&self, range_id: Uuid) -> CyroidResult<Option<RangeRouter>> {
        sqlx::query("SELECT * FROM range_routers WHERE range_id = ?")
            .bind(range_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(router_from_row)
            .transpose()
    }

    async fn save_router(&self, router: &RangeRouter) -> CyroidResult<()> {
        sqlx::query(
            r#"
            INSERT INTO range_routers (range_id, management_ip, container_id, status, error_message)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(range_id) DO UPDATE SET
                management_ip = excluded.management_ip,
                container_id = excluded.container_id,
                status = excluded.status,
                error_message = excluded.error_message
            "#,
        )
        .bind(router.range_id.to_string())
        .bind(router.management_ip.map(|ip| ip.to_string()))
        .bind(&router.container_id)
        .bind(router.status.as_str())
        .bind(&router.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_base_image(&self, id: Uuid) -> CyroidResult<Option<BaseImage>> {
        self.get_catalog("base_images", id).await
    }

    async fn save_base_image(&self, image: &BaseImage) -> CyroidResult<()> {
        self.save_catalog("base_images", image.id, &image.name, image)
            .await
    }

    async fn get_golden_image(&self, id: Uuid) -> CyroidResult<Option<GoldenImage>> {
        self.get_catalog("golden_images", id).await
    }

    async fn save_golden_image(&self, image: &GoldenImage) -> CyroidResult<()> {
        self.save_catalog("golden_images", image.id, &image.name, image)
            .await
    }

    async fn get_snapshot(&self, id: Uuid) -> CyroidResult<Option<Snapshot>> {
        self.get_catalog("snapshots", id).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> CyroidResult<()> {
        self.save_catalog("snapshots", snapshot.id, &snapshot.name, snapshot)
            .await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, LinuxUser, RangeStatus, RouterStatus, VmStatus};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_db_creates_tables() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("cyroid.db");

        let pool = init_db(&db_path, &CYROID_DB_MIGRATOR).await?;
        let tables: Vec<String> = sqlx::query("SELECT name FROM sqlite_master WHERE type='table'")
            .fetch_all(&pool)
            .await?
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for table in ["ranges", "networks", "vms", "range_routers", "base_images", "deployment_events"] {
            assert!(tables.contains(&table.to_string()), "{table} table not found");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_range_graph_persists() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let store = SqliteStore::open(temp_dir.path().join("cyroid.db")).await?;

        let mut range = Range::new("blue team");
        range.status = RangeStatus::Running;
        store.save_range(&range).await?;

        let mut network = Network::new(range.id, "lan", "10.0.1.0/24".parse()?, "10.0.1.1".parse()?);
        network.dns_servers = vec![Ipv4Addr::new(1, 1, 1, 1)];
        network.vyos_interface = Some("eth1".into());
        store.save_network(&network).await?;

        let mut vm = Vm::new(range.id, network.id, "ws01", "10.0.1.10".parse()?);
        vm.status = VmStatus::Error;
        vm.error_message = Some("boom".into());
        vm.linux_user = Some(LinuxUser {
            username: "analyst".into(),
            password: "s3cret".into(),
            sudo: true,
        });
        store.save_vm(&vm).await?;

        let mut router = RangeRouter::new(range.id, "10.10.0.2".parse()?);
        router.status = RouterStatus::Running;
        store.save_router(&router).await?;

        let loaded = store.require_range(range.id).await?;
        assert_eq!(loaded.status, RangeStatus::Running);
        assert_eq!(loaded.name, "blue team");

        assert_eq!(store.list_networks(range.id).await?, vec![network]);
        assert_eq!(store.require_vm(vm.id).await?, vm);
        assert_eq!(store.get_router(range.id).await?, Some(router));

        assert!(store.delete_vm(vm.id).await?);
        assert!(!store.delete_vm(vm.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_events_roundtrip_in_order() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let store = SqliteStore::open(temp_dir.path().join("cyroid.db")).await?;
        let range_id = Uuid::new_v4();

        store
            .save_event(&DeploymentEvent::new(range_id, EventType::DeploymentStarted, "start"))
            .await?;
        store
            .save_event(
                &DeploymentEvent::new(range_id, EventType::VmError, "fail")
                    .with_vm(Uuid::new_v4())
                    .with_extra(serde_json::json!({"exit_code": 1})),
            )
            .await?;

        let events = store.list_events(range_id).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::DeploymentStarted);
        assert_eq!(events[1].extra_data, Some(serde_json::json!({"exit_code": 1})));
        Ok(())
    }
}
