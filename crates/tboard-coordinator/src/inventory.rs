//! Static device farm description used to seed the in-memory store.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tboard_core::types::{Cabinet, Device, JobSpec};
use tboard_store::MemRunStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub cabinets: Vec<Cabinet>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("read inventory {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse inventory {}", path.display()))
    }

    pub fn seed(&self, store: &MemRunStore) -> Result<()> {
        for cabinet in &self.cabinets {
            store.upsert_cabinet(cabinet.clone())?;
        }
        for device in &self.devices {
            if !self.cabinets.iter().any(|c| c.id == device.cabinet) {
                tracing::warn!(
                    device_id = %device.id,
                    cabinet_id = %device.cabinet,
                    "device references a cabinet missing from the inventory"
                );
            }
            store.upsert_device(device.clone())?;
        }
        for job in &self.jobs {
            store.upsert_job(job.clone())?;
        }
        tracing::info!(
            cabinets = self.cabinets.len(),
            devices = self.devices.len(),
            jobs = self.jobs.len(),
            "inventory seeded"
        );
        Ok(())
    }
}
