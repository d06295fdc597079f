/**
 * DEVICE REGISTRY - Registre des machines supervisées
 *
 * RÔLE :
 * CRUD SQLite des appareils + invariant d'éligibilité : un appareil n'est
 * candidat à la collecte que si adresse ET les deux champs credentials SSH
 * sont renseignés. La suppression d'un appareil cascade explicitement sur
 * ses échantillons et son historique de collecte.
 */
use crate::models::Device;
use crate::store::StoreError;
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct DeviceRegistry {
    pool: SqlitePool,
}

/// Fields accepted when creating or updating a device.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub address: Option<String>,
    pub mac: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_port: Option<u16>,
    pub power_idle_w: Option<f64>,
    pub power_max_w: Option<f64>,
    pub power_alert_w: Option<f64>,
}

impl DeviceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, spec: DeviceSpec) -> Result<Device, StoreError> {
        let device = Device {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            address: spec.address,
            mac: spec.mac,
            ssh_user: spec.ssh_user,
            ssh_password: spec.ssh_password,
            ssh_port: spec.ssh_port.unwrap_or(22),
            power_idle_w: spec.power_idle_w.unwrap_or(5.0),
            power_max_w: spec.power_max_w.unwrap_or(150.0),
            power_alert_w: spec.power_alert_w,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO devices (
                id, name, address, mac, ssh_user, ssh_password, ssh_port,
                power_idle_w, power_max_w, power_alert_w, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.address)
        .bind(&device.mac)
        .bind(&device.ssh_user)
        .bind(&device.ssh_password)
        .bind(device.ssh_port as i64)
        .bind(device.power_idle_w)
        .bind(device.power_max_w)
        .bind(device.power_alert_w)
        .bind(device.created_at)
        .execute(&self.pool)
        .await?;

        info!("registered device {} ({})", device.id, device.name);
        Ok(device)
    }

    pub async fn update(&self, id: &str, spec: DeviceSpec) -> Result<Option<Device>, StoreError> {
        let Some(current) = self.get(id).await? else {
            return Ok(None);
        };

        let updated = Device {
            id: current.id,
            name: spec.name,
            address: spec.address,
            mac: spec.mac,
            ssh_user: spec.ssh_user,
            ssh_password: spec.ssh_password,
            ssh_port: spec.ssh_port.unwrap_or(current.ssh_port),
            power_idle_w: spec.power_idle_w.unwrap_or(current.power_idle_w),
            power_max_w: spec.power_max_w.unwrap_or(current.power_max_w),
            power_alert_w: spec.power_alert_w,
            created_at: current.created_at,
        };

        sqlx::query(
            r#"
            UPDATE devices SET
                name = ?, address = ?, mac = ?, ssh_user = ?, ssh_password = ?,
                ssh_port = ?, power_idle_w = ?, power_max_w = ?, power_alert_w = ?
            WHERE id = ?
            "#,
        )
        .bind(&updated.name)
        .bind(&updated.address)
        .bind(&updated.mac)
        .bind(&updated.ssh_user)
        .bind(&updated.ssh_password)
        .bind(updated.ssh_port as i64)
        .bind(updated.power_idle_w)
        .bind(updated.power_max_w)
        .bind(updated.power_alert_w)
        .bind(&updated.id)
        .execute(&self.pool)
        .await?;

        Ok(Some(updated))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Device>, StoreError> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_device))
    }

    pub async fn list(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_device).collect())
    }

    /// Devices carrying an address and both SSH credential fields.
    /// Empty strings count as absent.
    pub async fn list_eligible(&self) -> Result<Vec<Device>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM devices
            WHERE address IS NOT NULL AND address != ''
              AND ssh_user IS NOT NULL AND ssh_user != ''
              AND ssh_password IS NOT NULL AND ssh_password != ''
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_device).collect())
    }

    /// Removes a device and everything recorded about it (samples and
    /// collection history) in one transaction.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM metrics_samples WHERE device_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collection_history WHERE device_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!("removed device {id} and its recorded data");
        }
        Ok(removed)
    }
}

fn row_to_device(row: sqlx::sqlite::SqliteRow) -> Device {
    Device {
        id: row.get("id"),
        name: row.get("name"),
        address: row.get("address"),
        mac: row.get("mac"),
        ssh_user: row.get("ssh_user"),
        ssh_password: row.get("ssh_password"),
        ssh_port: row.get::<i64, _>("ssh_port") as u16,
        power_idle_w: row.get("power_idle_w"),
        power_max_w: row.get("power_max_w"),
        power_alert_w: row.get("power_alert_w"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricsSample;
    use crate::store::SampleStore;

    async fn setup() -> (SampleStore, DeviceRegistry) {
        let store = SampleStore::new_in_memory().await.unwrap();
        let registry = DeviceRegistry::new(store.pool().clone());
        (store, registry)
    }

    fn spec(name: &str, user: Option<&str>, pass: Option<&str>) -> DeviceSpec {
        DeviceSpec {
            name: name.to_string(),
            address: Some("192.168.1.50".into()),
            ssh_user: user.map(Into::into),
            ssh_password: pass.map(Into::into),
            ..DeviceSpec::default()
        }
    }

    #[tokio::test]
    async fn create_get_list() {
        let (_store, registry) = setup().await;
        let created = registry.create(spec("nas", Some("admin"), Some("pw"))).await.unwrap();
        assert_eq!(created.ssh_port, 22);

        let fetched = registry.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "nas");
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn eligibility_excludes_missing_or_empty_credentials() {
        let (_store, registry) = setup().await;
        registry.create(spec("full", Some("admin"), Some("pw"))).await.unwrap();
        registry.create(spec("no-pass", Some("admin"), None)).await.unwrap();
        registry.create(spec("empty-user", Some(""), Some("pw"))).await.unwrap();
        let mut no_addr = spec("no-addr", Some("admin"), Some("pw"));
        no_addr.address = None;
        registry.create(no_addr).await.unwrap();

        let eligible = registry.list_eligible().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "full");
    }

    #[tokio::test]
    async fn remove_cascades_samples_and_history() {
        let (store, registry) = setup().await;
        let device = registry.create(spec("nas", Some("admin"), Some("pw"))).await.unwrap();

        store.insert(&MetricsSample::empty(&device.id, 100)).await.unwrap();
        sqlx::query(
            "INSERT INTO collection_history
             (device_id, success, error, duration_ms, trigger_source, timestamp)
             VALUES (?, 1, NULL, 10, 'scheduler', 100)",
        )
        .bind(&device.id)
        .execute(store.pool())
        .await
        .unwrap();

        assert!(registry.remove(&device.id).await.unwrap());
        assert!(registry.get(&device.id).await.unwrap().is_none());
        assert!(store.range_raw(&device.id, 0, 1000).await.unwrap().is_empty());

        // Removing twice is a no-op.
        assert!(!registry.remove(&device.id).await.unwrap());
    }

    #[tokio::test]
    async fn update_merges_tunables() {
        let (_store, registry) = setup().await;
        let device = registry.create(spec("nas", Some("admin"), Some("pw"))).await.unwrap();

        let mut new_spec = spec("nas-renamed", Some("root"), Some("pw2"));
        new_spec.ssh_port = Some(2222);
        let updated = registry.update(&device.id, new_spec).await.unwrap().unwrap();
        assert_eq!(updated.name, "nas-renamed");
        assert_eq!(updated.ssh_port, 2222);
        assert_eq!(updated.power_idle_w, 5.0);

        assert!(registry.update("ghost", spec("x", None, None)).await.unwrap().is_none());
    }
}
