use crate::spi::{Driver, DriverInfo};
use std::collections::HashMap;
use std::sync::Arc;

/// 驱动注册表：driver id → 实现。
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以驱动自身 `info().id` 注册。
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Option<Arc<dyn Driver>> {
        let id = driver.info().id;
        self.register_as(id, driver)
    }

    pub fn register_as(
        &mut self,
        id: impl Into<String>,
        driver: Arc<dyn Driver>,
    ) -> Option<Arc<dyn Driver>> {
        self.drivers.insert(id.into(), driver)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn infos(&self) -> Vec<DriverInfo> {
        let mut infos: Vec<DriverInfo> = self.drivers.values().map(|driver| driver.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
