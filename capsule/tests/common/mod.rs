//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use capsule::vmm::{ResizeRequest, VmmConfig};
use capsule::{CapsuleError, CapsuleOptions, CapsuleResult, CapsuleRuntime, VmmController};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Hypervisor stand-in that keeps per-VM state in memory and writes
/// snapshot blobs to disk.
#[derive(Default)]
pub struct MemoryController {
    sessions: Mutex<HashMap<String, String>>,
    captures: Mutex<u64>,
}

impl MemoryController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state_of(&self, vm: &str) -> Option<String> {
        self.sessions.lock().get(vm).cloned()
    }

    fn set(&self, vm: &str, state: &str) -> CapsuleResult<()> {
        match self.sessions.lock().get_mut(vm) {
            Some(s) => {
                *s = state.to_string();
                Ok(())
            }
            None => Err(CapsuleError::InvalidState(format!("no session for {}", vm))),
        }
    }
}

#[async_trait]
impl VmmController for MemoryController {
    async fn start(&self, config: &VmmConfig) -> CapsuleResult<()> {
        self.sessions
            .lock()
            .insert(config.vm_name.clone(), "Started".into());
        Ok(())
    }

    async fn create(&self, config: &VmmConfig) -> CapsuleResult<()> {
        self.set(&config.vm_name, "Created")
    }

    async fn boot(&self, vm: &str) -> CapsuleResult<()> {
        self.set(vm, "Running")
    }

    async fn shutdown(&self, vm: &str) -> CapsuleResult<()> {
        self.set(vm, "Shutdown")
    }

    async fn pause(&self, vm: &str) -> CapsuleResult<()> {
        self.set(vm, "Paused")
    }

    async fn resume(&self, vm: &str) -> CapsuleResult<()> {
        self.set(vm, "Running")
    }

    async fn resize(&self, vm: &str, _request: ResizeRequest) -> CapsuleResult<()> {
        self.set(vm, "Running")
    }

    async fn snapshot(&self, vm: &str, destination: &Path) -> CapsuleResult<()> {
        self.state_of(vm)
            .ok_or_else(|| CapsuleError::InvalidState(format!("no session for {}", vm)))?;
        let seq = {
            let mut captures = self.captures.lock();
            *captures += 1;
            *captures
        };
        std::fs::write(destination, format!("{}:{}", vm, seq))?;
        Ok(())
    }

    async fn restore(&self, vm: &str, source: &Path) -> CapsuleResult<()> {
        if !source.is_file() {
            return Err(CapsuleError::Protocol(format!(
                "vm.restore: {} missing",
                source.display()
            )));
        }
        match self.state_of(vm).as_deref() {
            Some("Started") => self.set(vm, "Paused"),
            other => Err(CapsuleError::Protocol(format!(
                "vm.restore: hypervisor is {:?}, expected a fresh process",
                other
            ))),
        }
    }

    async fn info(&self, vm: &str) -> CapsuleResult<Value> {
        let state = self
            .state_of(vm)
            .ok_or_else(|| CapsuleError::InvalidState(format!("no session for {}", vm)))?;
        Ok(json!({ "state": state }))
    }

    async fn counters(&self, _vm: &str) -> CapsuleResult<Value> {
        Ok(json!({}))
    }

    async fn stop(&self, vm: &str) -> CapsuleResult<()> {
        self.sessions.lock().remove(vm);
        Ok(())
    }
}

pub struct TestRuntime {
    pub home: TempDir,
    pub controller: Arc<MemoryController>,
    pub runtime: CapsuleRuntime,
}

pub fn runtime() -> TestRuntime {
    runtime_with(|_| {})
}

pub fn runtime_with(configure: impl FnOnce(&mut CapsuleOptions)) -> TestRuntime {
    let home = TempDir::new().unwrap();
    let mut options = CapsuleOptions::with_home(home.path());
    configure(&mut options);
    let controller = MemoryController::new();
    let runtime = CapsuleRuntime::with_controller(options, controller.clone()).unwrap();
    TestRuntime {
        home,
        controller,
        runtime,
    }
}

/// Rewrite a snapshot's `created_at` to `days` in the past.
pub fn age_snapshot(rt: &CapsuleRuntime, vm: &str, name: &str, days: i64) {
    let path = rt
        .layout()
        .snapshots_dir()
        .join(vm)
        .join(name)
        .join("metadata.json");
    let mut meta: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let created = chrono::Utc::now() - chrono::Duration::days(days);
    meta["created_at"] = json!(created);
    std::fs::write(&path, serde_json::to_vec_pretty(&meta).unwrap()).unwrap();
}
