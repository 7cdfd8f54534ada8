use std::sync::Arc;

use ahash::AHashMap;
use squill_core::driver::{Connection, Driver};
use squill_core::errors::{ConfigError, Result};

use crate::config::DriverRegistry;
use crate::pool::{PoolConfig, PooledDataSource};

/// Hands out connections. Pooled and unpooled variants share this seam so
/// transactions never care which one they run over.
pub trait DataSource: Send + Sync {
    fn connection(&self) -> Result<Box<dyn Connection>>;

    /// Tears down anything kept alive between calls. A no-op for
    /// unpooled sources.
    fn force_close_all(&self) {}
}

/// Opens a fresh real connection for every request.
pub struct UnpooledDataSource {
    driver: Arc<dyn Driver>,
    url: String,
    properties: AHashMap<String, String>,
}

impl UnpooledDataSource {
    pub fn new(
        driver: Arc<dyn Driver>,
        url: impl Into<String>,
        properties: AHashMap<String, String>,
    ) -> Self {
        Self {
            driver,
            url: url.into(),
            properties,
        }
    }
}

impl DataSource for UnpooledDataSource {
    fn connection(&self) -> Result<Box<dyn Connection>> {
        Ok(self.driver.connect(&self.url, &self.properties)?)
    }
}

/// Builds a data source from a `<dataSource type=…>` declaration. The
/// `driver` property names a registered driver; `url`, `username` and
/// `password` feed the connect call, everything else passes through.
pub fn build_data_source(
    kind: &str,
    properties: &AHashMap<String, String>,
    drivers: &DriverRegistry,
) -> Result<Arc<dyn DataSource>, ConfigError> {
    let driver_name = properties
        .get("driver")
        .ok_or(ConfigError::MissingAttribute {
            element: "dataSource".to_string(),
            attribute: "driver",
        })?;
    let driver = drivers.get(driver_name)?;
    let url = properties
        .get("url")
        .cloned()
        .ok_or(ConfigError::MissingAttribute {
            element: "dataSource".to_string(),
            attribute: "url",
        })?;
    let connect_properties: AHashMap<String, String> = properties
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "driver" | "url") && !k.starts_with("pool"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match kind.to_uppercase().as_str() {
        "UNPOOLED" => Ok(Arc::new(UnpooledDataSource::new(
            driver,
            url,
            connect_properties,
        ))),
        "POOLED" => {
            let pool_config = PoolConfig::from_properties(properties)?;
            Ok(Arc::new(PooledDataSource::new(
                driver,
                url,
                connect_properties,
                pool_config,
            )))
        }
        other => Err(ConfigError::InvalidValue {
            what: "dataSource type".to_string(),
            value: other.to_string(),
        }),
    }
}
