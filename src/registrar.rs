//! Instance registration.
//!
//! Turns per-instance settings into a registered [`SqliteConnectionFactory`]
//! and, when enabled, a registered [`SqliteHealthCheck`]. The instance whose
//! key is [`DEFAULT_INSTANCE_KEY`] is also registered as the unkeyed default.
//!
//! The registries are traits so a host can plug in its own container;
//! [`ConnectionRegistry`] and [`HealthMonitor`](crate::health::HealthMonitor)
//! are the in-crate implementations.

use crate::db::factory::SqliteConnectionFactory;
use crate::error::{DbError, DbResult};
use crate::health::SqliteHealthCheck;
use crate::models::{SqliteHealthCheckOptions, SqliteInstanceSettings, SqliteSettings};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Reserved key of the instance also exposed without a key.
pub const DEFAULT_INSTANCE_KEY: &str = "default";

/// Provider name used in health check registrations.
pub const PROVIDER_NAME: &str = "Sqlite";

/// True when `key` names the default instance (case-insensitive).
pub fn is_default_key(key: &str) -> bool {
    key.eq_ignore_ascii_case(DEFAULT_INSTANCE_KEY)
}

/// Receives factories produced at registration.
///
/// The lookups let the registrar reject duplicates before it adds anything.
pub trait FactoryRegistry {
    fn contains_key(&self, key: &str) -> bool;

    fn has_default(&self) -> bool;

    fn add_keyed(&mut self, key: &str, factory: Arc<SqliteConnectionFactory>) -> DbResult<()>;

    fn add_default(&mut self, factory: Arc<SqliteConnectionFactory>) -> DbResult<()>;
}

/// Receives health checks produced at registration.
pub trait HealthCheckRegistry {
    fn contains_check(&self, key: &str) -> bool;

    fn add_health_check(&mut self, key: &str, check: SqliteHealthCheck) -> DbResult<()>;
}

/// In-process factory registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    factories: HashMap<String, Arc<SqliteConnectionFactory>>,
    default: Option<Arc<SqliteConnectionFactory>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a factory by its exact key.
    pub fn resolve(&self, key: &str) -> DbResult<Arc<SqliteConnectionFactory>> {
        self.factories
            .get(key)
            .cloned()
            .ok_or_else(|| DbError::instance_not_found(key))
    }

    /// Resolve the unkeyed default factory.
    pub fn resolve_default(&self) -> DbResult<Arc<SqliteConnectionFactory>> {
        self.default
            .clone()
            .ok_or_else(|| DbError::instance_not_found(DEFAULT_INSTANCE_KEY))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl FactoryRegistry for ConnectionRegistry {
    fn contains_key(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    fn has_default(&self) -> bool {
        self.default.is_some()
    }

    fn add_keyed(&mut self, key: &str, factory: Arc<SqliteConnectionFactory>) -> DbResult<()> {
        if self.factories.contains_key(key) {
            return Err(DbError::duplicate_instance(key));
        }
        self.factories.insert(key.to_string(), factory);
        Ok(())
    }

    fn add_default(&mut self, factory: Arc<SqliteConnectionFactory>) -> DbResult<()> {
        if self.default.is_some() {
            return Err(DbError::duplicate_instance(DEFAULT_INSTANCE_KEY));
        }
        self.default = Some(factory);
        Ok(())
    }
}

/// Fail with `DuplicateInstance` when `key` is already taken as a keyed factory,
/// as the default, or as a health check.
fn ensure_vacant<R, H>(key: &str, registry: &R, health: Option<&H>) -> DbResult<()>
where
    R: FactoryRegistry + ?Sized,
    H: HealthCheckRegistry + ?Sized,
{
    let taken = registry.contains_key(key)
        || (is_default_key(key) && registry.has_default())
        || health.is_some_and(|health| health.contains_check(key));
    if taken {
        return Err(DbError::duplicate_instance(key));
    }
    Ok(())
}

/// Registers SQLite instances.
pub struct SqliteRegistrar;

impl SqliteRegistrar {
    /// Build a factory from `settings` and register it under `key`, and also as
    /// the default when `key` is the default key.
    ///
    /// Nothing is registered when `key` or the default slot is already taken.
    pub fn register_instance<R: FactoryRegistry + ?Sized>(
        key: &str,
        settings: &SqliteInstanceSettings,
        registry: &mut R,
    ) -> DbResult<Arc<SqliteConnectionFactory>> {
        ensure_vacant::<R, dyn HealthCheckRegistry>(key, &*registry, None)?;
        let factory = Arc::new(SqliteConnectionFactory::new(settings.connection_options())?);
        registry.add_keyed(key, Arc::clone(&factory))?;
        if is_default_key(key) {
            registry.add_default(Arc::clone(&factory))?;
        }
        debug!(
            instance = key,
            name = %settings.name,
            timeout_secs = settings.command_timeout_secs,
            "Registered SQLite connection factory"
        );
        Ok(factory)
    }

    /// Build the health check for an instance. Uses default health options when
    /// none are configured.
    pub fn create_health_check(settings: &SqliteInstanceSettings) -> DbResult<SqliteHealthCheck> {
        SqliteHealthCheck::new(
            settings.connection_options(),
            settings.health_options_or_default(),
        )
    }

    /// Register an instance and, unless disabled, its health check.
    ///
    /// A blank name falls back to `key`. Settings and duplicate keys are
    /// validated before anything is registered, so a rejected instance leaves
    /// both registries untouched.
    pub fn add_sqlite<R, H>(
        key: &str,
        settings: SqliteInstanceSettings,
        registry: &mut R,
        health: &mut H,
    ) -> DbResult<Arc<SqliteConnectionFactory>>
    where
        R: FactoryRegistry + ?Sized,
        H: HealthCheckRegistry + ?Sized,
    {
        Self::add_sqlite_with_health(key, settings, |_| {}, registry, health)
    }

    /// Like [`add_sqlite`](Self::add_sqlite), then let `configure_health`
    /// adjust the health options once defaults are filled in.
    pub fn add_sqlite_with_health<R, H, F>(
        key: &str,
        mut settings: SqliteInstanceSettings,
        configure_health: F,
        registry: &mut R,
        health: &mut H,
    ) -> DbResult<Arc<SqliteConnectionFactory>>
    where
        R: FactoryRegistry + ?Sized,
        H: HealthCheckRegistry + ?Sized,
        F: FnOnce(&mut SqliteHealthCheckOptions),
    {
        if settings.name.trim().is_empty() {
            settings.name = key.to_string();
        }
        let mut health_options = settings.health_options_or_default();
        configure_health(&mut health_options);
        settings.health_options = Some(health_options.clone());

        let check = if health_options.enabled {
            Some(Self::create_health_check(&settings)?)
        } else {
            None
        };
        ensure_vacant(key, &*registry, check.is_some().then_some(&*health))?;
        let factory = Self::register_instance(key, &settings, registry)?;
        if let Some(check) = check {
            health.add_health_check(key, check)?;
        }

        info!(
            instance = key,
            provider = PROVIDER_NAME,
            health_check = health_options.enabled,
            "SQLite instance registered"
        );
        Ok(factory)
    }

    /// Register an instance configured by a closure over default settings.
    pub fn add_sqlite_with<R, H, F>(
        key: &str,
        configure: F,
        registry: &mut R,
        health: &mut H,
    ) -> DbResult<Arc<SqliteConnectionFactory>>
    where
        R: FactoryRegistry + ?Sized,
        H: HealthCheckRegistry + ?Sized,
        F: FnOnce(&mut SqliteInstanceSettings),
    {
        let mut settings = SqliteInstanceSettings::default();
        configure(&mut settings);
        Self::add_sqlite(key, settings, registry, health)
    }

    /// Register an instance from just a connection string.
    pub fn add_sqlite_connection_string<R, H>(
        key: &str,
        connection_string: &str,
        registry: &mut R,
        health: &mut H,
    ) -> DbResult<Arc<SqliteConnectionFactory>>
    where
        R: FactoryRegistry + ?Sized,
        H: HealthCheckRegistry + ?Sized,
    {
        Self::add_sqlite(
            key,
            SqliteInstanceSettings::new(key, connection_string),
            registry,
            health,
        )
    }

    /// Register every configured instance. Stops at the first failure.
    pub fn register_all<R, H>(settings: &SqliteSettings, registry: &mut R, health: &mut H) -> DbResult<()>
    where
        R: FactoryRegistry + ?Sized,
        H: HealthCheckRegistry + ?Sized,
    {
        for (key, instance) in &settings.instances {
            Self::add_sqlite(key, instance.clone(), registry, health)?;
        }
        info!(instances = settings.instances.len(), "SQLite instances registered");
        Ok(())
    }
}
