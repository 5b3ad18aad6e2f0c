//! Compute context lifecycle: device discovery and selection, the single
//! in-order command queue, and ownership of compiled kernel programs.

use crate::config::{ContextConfig, DeviceSelector};
use crate::error::EngineError;
use crate::kernel_engine::{KernelSource, Program};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// A capability a device advertises. Selection asks "can you do f64?",
/// not "which device are you?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// IEEE 754 f64 arithmetic in kernels.
    F64Compute,
    F32Compute,
    /// Work items of one dispatch run concurrently.
    ParallelDispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Host threads, one compute unit per hardware thread.
    HostParallel,
    /// One compute unit; work items run in order on the calling thread.
    HostSerial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub platform: String,
    pub platform_index: usize,
    pub device_index: usize,
    pub kind: DeviceKind,
    pub compute_units: usize,
    pub capabilities: Vec<Capability>,
}

impl DeviceInfo {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}:{}] on {} ({} compute units)",
            self.name, self.platform_index, self.device_index, self.platform, self.compute_units
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    pub devices: Vec<DeviceInfo>,
}

/// Lists the platforms and devices available to this process.
pub fn discover_platforms() -> Vec<Platform> {
    let threads = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    let platform = "host".to_string();

    vec![Platform {
        name: platform.clone(),
        vendor: "clde".to_string(),
        devices: vec![
            DeviceInfo {
                name: "host-parallel".to_string(),
                platform: platform.clone(),
                platform_index: 0,
                device_index: 0,
                kind: DeviceKind::HostParallel,
                compute_units: threads,
                capabilities: vec![
                    Capability::F64Compute,
                    Capability::F32Compute,
                    Capability::ParallelDispatch,
                ],
            },
            DeviceInfo {
                name: "host-serial".to_string(),
                platform,
                platform_index: 0,
                device_index: 1,
                kind: DeviceKind::HostSerial,
                compute_units: 1,
                capabilities: vec![Capability::F64Compute, Capability::F32Compute],
            },
        ],
    }]
}

fn select_device(
    platforms: &[Platform],
    selector: &DeviceSelector,
) -> Result<DeviceInfo, EngineError> {
    let found = match selector {
        DeviceSelector::Index { platform, device } => platforms
            .get(*platform)
            .and_then(|p| p.devices.get(*device)),
        DeviceSelector::Capability { require } => platforms
            .iter()
            .flat_map(|p| p.devices.iter())
            .find(|d| require.iter().all(|cap| d.has(*cap))),
    };
    found.cloned().ok_or_else(|| EngineError::DeviceUnavailable {
        selector: format!("{selector:?}"),
    })
}

/// The one in-order execution queue of a context. Commands run in the order
/// they are submitted; work items inside a command may run concurrently.
pub struct CommandQueue {
    pool: Option<ThreadPool>,
    submitted: Cell<u64>,
}

impl CommandQueue {
    fn new(device: &DeviceInfo) -> Result<Self, EngineError> {
        let pool = match device.kind {
            DeviceKind::HostSerial => None,
            DeviceKind::HostParallel => Some(
                ThreadPoolBuilder::new()
                    .num_threads(device.compute_units)
                    .thread_name(|i| format!("clde-worker-{i}"))
                    .build()
                    .map_err(|e| EngineError::Device(e.to_string()))?,
            ),
        };
        Ok(Self {
            pool,
            submitted: Cell::new(0),
        })
    }

    fn record(&self, label: &str) {
        let id = self.submitted.get();
        self.submitted.set(id + 1);
        trace!(command = id, label, "enqueue");
    }

    /// Runs a single command on the queue.
    pub fn submit<R, F>(&self, label: &str, command: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.record(label);
        match &self.pool {
            Some(pool) => pool.install(command),
            None => command(),
        }
    }

    /// Runs `op` once per `width`-sized row of `output`, handing it the row
    /// index. `init` builds per-worker scratch.
    pub fn run_rows<T, S, I, F>(&self, label: &str, output: &mut [T], width: usize, init: I, op: F)
    where
        T: Send,
        I: Fn() -> S + Sync + Send,
        F: Fn(&mut S, usize, &mut [T]) + Sync + Send,
    {
        self.record(label);
        match &self.pool {
            Some(pool) => pool.install(|| {
                output
                    .par_chunks_mut(width)
                    .enumerate()
                    .for_each_init(&init, |scratch, (item, row)| op(scratch, item, row))
            }),
            None => {
                let mut scratch = init();
                for (item, row) in output.chunks_mut(width).enumerate() {
                    op(&mut scratch, item, row);
                }
            }
        }
    }

    /// Blocks until every submitted command has completed.
    pub fn finish(&self) {
        // Commands complete before `submit`/`run_rows` return.
        trace!(submitted = self.submitted.get(), "queue drained");
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.get()
    }
}

/// Owns the selected device, its queue and every program built for it.
/// Vectors, algebra and operators borrow the context and cannot outlive it.
pub struct DeviceContext {
    device: DeviceInfo,
    queue: CommandQueue,
    programs: RefCell<HashMap<String, Rc<Program>>>,
}

impl DeviceContext {
    pub fn new(config: &ContextConfig) -> Result<Self, EngineError> {
        let platforms = discover_platforms();
        let mut device = select_device(&platforms, &config.selector)?;
        if let Some(limit) = config.threads {
            if device.kind == DeviceKind::HostParallel {
                device.compute_units = limit.clamp(1, device.compute_units);
            }
        }
        let queue = CommandQueue::new(&device)?;
        info!(device = %device, "compute context ready");
        Ok(Self {
            device,
            queue,
            programs: RefCell::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Compiles a named program. A name already built from the same source
    /// returns the cached program; a different source replaces it.
    pub fn build_program(&self, source: &KernelSource) -> Result<Rc<Program>, EngineError> {
        if let Some(existing) = self.programs.borrow().get(&source.name) {
            if existing.source() == source {
                return Ok(Rc::clone(existing));
            }
        }

        let program = match Program::build(source) {
            Ok(program) => Rc::new(program),
            Err(err) => {
                warn!(program = %source.name, error = %err, "kernel build failed");
                return Err(err);
            }
        };
        debug!(
            program = %source.name,
            lanes = program.lanes(),
            vars = program.var_count(),
            params = program.param_count(),
            "kernel program built"
        );
        self.programs
            .borrow_mut()
            .insert(source.name.clone(), Rc::clone(&program));
        Ok(program)
    }

    pub fn program(&self, name: &str) -> Option<Rc<Program>> {
        self.programs.borrow().get(name).cloned()
    }

    pub fn program_count(&self) -> usize {
        self.programs.borrow().len()
    }
}
