//! In-memory `VmmController` for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use capsule_shared::{CapsuleError, CapsuleResult};
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::VmmController;
use crate::vmm::{ResizeRequest, VmmConfig};

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeVm {
    pub created: bool,
    pub booted: bool,
    pub paused: bool,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub restored_from: Option<String>,
}

#[derive(Default)]
struct FakeState {
    sessions: HashMap<String, FakeVm>,
    failures: HashSet<String>,
    calls: Vec<String>,
    snapshots_taken: u64,
    delay: Option<Duration>,
    in_flight: HashMap<String, u32>,
    overlapped: bool,
}

#[derive(Default)]
pub(crate) struct FakeController {
    state: Mutex<FakeState>,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent call to `op` fail with a protocol error.
    pub fn fail_on(&self, op: &str) {
        self.state.lock().failures.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make every call take `delay`, so concurrent callers get a chance to
    /// interleave.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Whether two calls for the same VM were ever in flight at once.
    pub fn overlapped(&self) -> bool {
        self.state.lock().overlapped
    }

    async fn pace(&self, vm: &str) {
        let delay = {
            let mut state = self.state.lock();
            let concurrent = {
                let n = state.in_flight.entry(vm.to_string()).or_default();
                *n += 1;
                *n > 1
            };
            state.overlapped |= concurrent;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(n) = self.state.lock().in_flight.get_mut(vm) {
            *n -= 1;
        }
    }

    /// Calls recorded as `"<op>:<vm>"`, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn has_session(&self, vm: &str) -> bool {
        self.state.lock().sessions.contains_key(vm)
    }

    pub fn vm(&self, vm: &str) -> Option<FakeVm> {
        self.state.lock().sessions.get(vm).cloned()
    }

    fn record(&self, op: &str, vm: &str) -> CapsuleResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("{}:{}", op, vm));
        if state.failures.contains(op) {
            return Err(CapsuleError::Protocol(format!(
                "{} rejected with HTTP 500: injected failure",
                op
            )));
        }
        Ok(())
    }

    fn with_session<T>(
        &self,
        op: &str,
        vm: &str,
        f: impl FnOnce(&mut FakeVm) -> T,
    ) -> CapsuleResult<T> {
        self.record(op, vm)?;
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(vm).ok_or_else(|| {
            CapsuleError::InvalidState(format!("no hypervisor session for VM {}", vm))
        })?;
        Ok(f(session))
    }
}

#[async_trait::async_trait]
impl VmmController for FakeController {
    async fn start(&self, config: &VmmConfig) -> CapsuleResult<()> {
        self.pace(&config.vm_name).await;
        self.record("start", &config.vm_name)?;
        self.state
            .lock()
            .sessions
            .entry(config.vm_name.clone())
            .or_insert_with(|| FakeVm {
                vcpus: config.vcpus,
                memory_mib: config.memory_mib,
                ..Default::default()
            });
        Ok(())
    }

    async fn create(&self, config: &VmmConfig) -> CapsuleResult<()> {
        self.pace(&config.vm_name).await;
        self.with_session("create", &config.vm_name, |vm| vm.created = true)
    }

    async fn boot(&self, vm: &str) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.with_session("boot", vm, |vm| vm.booted = true)
    }

    async fn shutdown(&self, vm: &str) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.with_session("shutdown", vm, |vm| vm.booted = false)
    }

    async fn pause(&self, vm: &str) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.with_session("pause", vm, |vm| vm.paused = true)
    }

    async fn resume(&self, vm: &str) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.with_session("resume", vm, |vm| vm.paused = false)
    }

    async fn resize(&self, vm: &str, request: ResizeRequest) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.with_session("resize", vm, |vm| {
            if let Some(vcpus) = request.desired_vcpus {
                vm.vcpus = vcpus;
            }
            if let Some(mib) = request.memory_mib() {
                vm.memory_mib = mib;
            }
        })
    }

    async fn snapshot(&self, vm: &str, destination: &Path) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.with_session("snapshot", vm, |_| ())?;
        let seq = {
            let mut state = self.state.lock();
            state.snapshots_taken += 1;
            state.snapshots_taken
        };
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(destination, format!("memory image of {} #{}", vm, seq))?;
        Ok(())
    }

    async fn restore(&self, vm: &str, source: &Path) -> CapsuleResult<()> {
        self.pace(vm).await;
        if !source.is_file() {
            self.record("restore", vm)?;
            return Err(CapsuleError::Protocol(format!(
                "vm.restore rejected with HTTP 500: {} not found",
                source.display()
            )));
        }
        let source = source.display().to_string();
        self.with_session("restore", vm, |vm| {
            // Only a fresh hypervisor accepts a restore.
            if vm.created {
                return Err(CapsuleError::Protocol(
                    "vm.restore rejected with HTTP 500: VM already created".to_string(),
                ));
            }
            vm.created = true;
            vm.booted = true;
            vm.paused = true;
            vm.restored_from = Some(source);
            Ok(())
        })?
    }

    async fn info(&self, vm: &str) -> CapsuleResult<Value> {
        self.pace(vm).await;
        self.with_session("info", vm, |vm| {
            let state = match (vm.booted, vm.paused) {
                (true, true) => "Paused",
                (true, false) => "Running",
                _ => "Created",
            };
            json!({
                "state": state,
                "config": {
                    "cpus": {"boot_vcpus": vm.vcpus},
                    "memory": {"size": vm.memory_mib * 1024 * 1024}
                }
            })
        })
    }

    async fn counters(&self, vm: &str) -> CapsuleResult<Value> {
        self.pace(vm).await;
        self.with_session("counters", vm, |_| {
            json!({"_disk0": {"read_bytes": 4096, "write_bytes": 0}})
        })
    }

    async fn stop(&self, vm: &str) -> CapsuleResult<()> {
        self.pace(vm).await;
        self.record("stop", vm)?;
        self.state.lock().sessions.remove(vm);
        Ok(())
    }
}
