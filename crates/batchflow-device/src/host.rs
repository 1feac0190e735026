//! Host-memory accelerator backend.
//!
//! Stands in for a real device runtime: "device" memory lives in host
//! vectors keyed by opaque ids, and an invocation sleeps for the model's
//! simulated latency before writing deterministic outputs. The model file
//! is a JSON descriptor naming each function's tensor shapes:
//!
//! ```json
//! {
//!   "functions": {
//!     "fusion_0": {
//!       "inputs":  [{ "n": 1, "c": 3, "h": 500, "w": 500 }],
//!       "outputs": [{ "n": 1, "c": 4, "h": 21824, "w": 1 },
//!                   { "n": 1, "c": 2, "h": 21824, "w": 1 }],
//!       "latency_us": 2000
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use batchflow_core::{
    Accelerator, AcceleratorBackend, CoreAssignment, DeviceMemory, FlowError, LoadRequest,
    Result, TensorShape,
};

/// Parsed model descriptor file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub functions: BTreeMap<String, FunctionDescriptor>,
}

/// One loadable function of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub inputs: Vec<TensorShape>,
    pub outputs: Vec<TensorShape>,
    /// Simulated device time per invocation.
    #[serde(default)]
    pub latency_us: u64,
}

impl ModelDescriptor {
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FlowError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| {
            FlowError::ModelLoad(format!("invalid model descriptor {}: {e}", path.display()))
        })
    }

    pub fn function(&self, name: &str) -> Result<&FunctionDescriptor> {
        self.functions.get(name).ok_or_else(|| {
            FlowError::ModelLoad(format!(
                "function '{name}' not found (available: {:?})",
                self.functions.keys().collect::<Vec<_>>()
            ))
        })
    }
}

/// Device memory shared by every context a backend loads.
#[derive(Default)]
struct DeviceArena {
    allocations: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
}

impl DeviceArena {
    fn allocate(&self, bytes: usize) -> DeviceMemory {
        // Ids start at a page-like offset so they read as addresses in logs.
        let id = 0x1000 + self.next_id.fetch_add(1, Ordering::Relaxed) * 0x10;
        self.allocations.lock().insert(id, vec![0; bytes]);
        DeviceMemory::new(id, bytes)
    }
}

/// Backend that loads [`HostAccelerator`] contexts from descriptor files.
#[derive(Clone, Default)]
pub struct HostBackend {
    arena: Arc<DeviceArena>,
    invocations: Arc<AtomicU64>,
    fail_invoke_at: Option<u64>,
    latency_override: Option<Duration>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` invocation (1-based, counted across every context
    /// of this backend) fail with a device error.
    pub fn with_invoke_failure(mut self, nth: u64) -> Self {
        self.fail_invoke_at = Some(nth);
        self
    }

    /// Replace the descriptor's simulated latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_override = Some(latency);
        self
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.arena.allocations.lock().len()
    }

    /// Invocations issued so far across every context.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Acquire)
    }
}

impl AcceleratorBackend for HostBackend {
    fn load(&self, request: &LoadRequest) -> Result<Arc<dyn Accelerator>> {
        if request.data_parallelism == 0 {
            return Err(FlowError::ModelLoad("data parallelism must be at least 1".into()));
        }
        let descriptor = ModelDescriptor::from_path(&request.model_path)?;
        let function = descriptor.function(&request.function_name)?;
        if function.inputs.is_empty() || function.outputs.is_empty() {
            return Err(FlowError::ModelLoad(format!(
                "function '{}' must declare at least one input and one output",
                request.function_name
            )));
        }
        if let Some(shape) = function
            .inputs
            .iter()
            .chain(&function.outputs)
            .find(|s| s.is_empty())
        {
            return Err(FlowError::ModelLoad(format!(
                "function '{}' declares an empty tensor {shape:?}",
                request.function_name
            )));
        }

        let latency = self
            .latency_override
            .unwrap_or(Duration::from_micros(function.latency_us));

        tracing::info!(
            model = %request.model_path.display(),
            function = %request.function_name,
            device = request.device_id,
            dp = request.data_parallelism,
            inputs = ?function.inputs,
            outputs = ?function.outputs,
            latency_us = latency.as_micros() as u64,
            "loaded host model"
        );

        Ok(Arc::new(HostAccelerator {
            name: format!("host:{}", request.function_name),
            device_id: request.device_id,
            data_parallelism: request.data_parallelism,
            inputs: function.inputs.clone(),
            outputs: function.outputs.clone(),
            latency,
            cores: Mutex::new(CoreAssignment::default()),
            arena: Arc::clone(&self.arena),
            invocations: Arc::clone(&self.invocations),
            fail_invoke_at: self.fail_invoke_at,
        }))
    }
}

/// One execution context of a host-simulated model.
pub struct HostAccelerator {
    name: String,
    device_id: u32,
    data_parallelism: usize,
    inputs: Vec<TensorShape>,
    outputs: Vec<TensorShape>,
    latency: Duration,
    cores: Mutex<CoreAssignment>,
    arena: Arc<DeviceArena>,
    invocations: Arc<AtomicU64>,
    fail_invoke_at: Option<u64>,
}

impl Accelerator for HostAccelerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn data_parallelism(&self) -> usize {
        self.data_parallelism
    }

    fn input_shapes(&self) -> &[TensorShape] {
        &self.inputs
    }

    fn output_shapes(&self) -> &[TensorShape] {
        &self.outputs
    }

    fn apply_cores(&self, assignment: CoreAssignment) -> Result<()> {
        if assignment.core_count == 0 || assignment.affinity.count_ones() != assignment.core_count {
            return Err(FlowError::Device(format!(
                "invalid core assignment: {} cores, affinity 0x{:x}",
                assignment.core_count, assignment.affinity
            )));
        }
        *self.cores.lock() = assignment;
        Ok(())
    }

    fn allocate(&self, bytes: usize) -> Result<DeviceMemory> {
        if bytes == 0 {
            return Err(FlowError::Device("zero-byte allocation".into()));
        }
        Ok(self.arena.allocate(bytes))
    }

    fn free(&self, memory: DeviceMemory) -> Result<()> {
        self.arena
            .allocations
            .lock()
            .remove(&memory.id())
            .map(|_| ())
            .ok_or_else(|| FlowError::Device(format!("free of unknown memory 0x{:x}", memory.id())))
    }

    fn copy_host_to_device(&self, dst: &DeviceMemory, src: &[u8]) -> Result<()> {
        let mut allocations = self.arena.allocations.lock();
        let mem = allocations
            .get_mut(&dst.id())
            .ok_or_else(|| FlowError::Device(format!("copy to unknown memory 0x{:x}", dst.id())))?;
        if src.len() > mem.len() {
            return Err(FlowError::Device(format!(
                "host-to-device copy of {} bytes overflows {}-byte buffer 0x{:x}",
                src.len(),
                mem.len(),
                dst.id()
            )));
        }
        mem[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(&self, src: &DeviceMemory) -> Result<Vec<u8>> {
        self.arena
            .allocations
            .lock()
            .get(&src.id())
            .cloned()
            .ok_or_else(|| FlowError::Device(format!("copy from unknown memory 0x{:x}", src.id())))
    }

    fn invoke(&self, inputs: &[DeviceMemory], outputs: &[DeviceMemory]) -> Result<u64> {
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            return Err(FlowError::Device(format!(
                "invoke expects {} inputs and {} outputs, got {} and {}",
                self.inputs.len(),
                self.outputs.len(),
                inputs.len(),
                outputs.len()
            )));
        }

        let nth = self.invocations.fetch_add(1, Ordering::AcqRel) + 1;
        if self.fail_invoke_at == Some(nth) {
            return Err(FlowError::Device(format!(
                "{}: injected failure on invocation {nth}",
                self.name
            )));
        }

        let cores = *self.cores.lock();
        tracing::trace!(
            context = %self.name,
            invocation = nth,
            core_count = cores.core_count,
            affinity = %format!("0x{:x}", cores.affinity),
            "invoke"
        );
        let start = Instant::now();
        let level = {
            let allocations = self.arena.allocations.lock();
            let input = allocations.get(&inputs[0].id()).ok_or_else(|| {
                FlowError::Device(format!("invoke on unknown memory 0x{:x}", inputs[0].id()))
            })?;
            mean_level(input)
        };

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        {
            let mut allocations = self.arena.allocations.lock();
            for out in outputs {
                let mem = allocations.get_mut(&out.id()).ok_or_else(|| {
                    FlowError::Device(format!("invoke on unknown memory 0x{:x}", out.id()))
                })?;
                for chunk in mem.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&level.to_le_bytes());
                }
            }
        }

        let elapsed = start.elapsed().as_micros() as u64;
        tracing::trace!(context = %self.name, invocation = nth, elapsed_us = elapsed, "invoked");
        Ok(elapsed)
    }
}

/// Mean byte value of a buffer scaled to [0, 1].
fn mean_level(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: u64 = data.iter().map(|&b| b as u64).sum();
    (sum as f64 / data.len() as f64 / 255.0) as f32
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_descriptor(latency_us: u64) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"functions":{{"fusion_0":{{
                "inputs":[{{"n":1,"c":3,"h":4,"w":4}}],
                "outputs":[{{"n":1,"c":2,"h":8,"w":1}}],
                "latency_us":{latency_us}}}}}}}"#
        )
        .unwrap();
        file
    }

    fn request(path: &Path) -> LoadRequest {
        LoadRequest {
            model_path: path.to_path_buf(),
            function_name: "fusion_0".into(),
            device_id: 0,
            data_parallelism: 1,
        }
    }

    #[test]
    fn test_load_reads_shapes() {
        let file = write_descriptor(0);
        let accel = HostBackend::new().load(&request(file.path())).unwrap();
        assert_eq!(accel.input_shapes(), &[TensorShape::new(1, 3, 4, 4)]);
        assert_eq!(accel.output_counts(), vec![16]);
    }

    #[test]
    fn test_missing_function_is_model_load_error() {
        let file = write_descriptor(0);
        let mut req = request(file.path());
        req.function_name = "subnet_1".into();
        let err = HostBackend::new().load(&req).err().unwrap();
        assert!(matches!(err, FlowError::ModelLoad(_)));
    }

    #[test]
    fn test_invoke_fills_outputs_from_input_level() {
        let file = write_descriptor(0);
        let backend = HostBackend::new();
        let accel = backend.load(&request(file.path())).unwrap();
        let input = accel.allocate(48).unwrap();
        let output = accel.allocate(64).unwrap();
        accel.copy_host_to_device(&input, &[255u8; 48]).unwrap();
        accel
            .invoke(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        let host = accel.copy_device_to_host(&output).unwrap();
        assert_eq!(&host[..4], &1.0f32.to_le_bytes());
        accel.free(input).unwrap();
        accel.free(output).unwrap();
        assert_eq!(backend.live_allocations(), 0);
    }

    #[test]
    fn test_injected_failure() {
        let file = write_descriptor(0);
        let backend = HostBackend::new().with_invoke_failure(2);
        let accel = backend.load(&request(file.path())).unwrap();
        let input = accel.allocate(48).unwrap();
        let output = accel.allocate(64).unwrap();
        let ins = std::slice::from_ref(&input);
        let outs = std::slice::from_ref(&output);
        assert!(accel.invoke(ins, outs).is_ok());
        assert!(matches!(accel.invoke(ins, outs), Err(FlowError::Device(_))));
        assert!(accel.invoke(ins, outs).is_ok());
    }

    #[test]
    fn test_overflowing_copy_rejected() {
        let file = write_descriptor(0);
        let accel = HostBackend::new().load(&request(file.path())).unwrap();
        let mem = accel.allocate(8).unwrap();
        assert!(matches!(
            accel.copy_host_to_device(&mem, &[0u8; 9]),
            Err(FlowError::Device(_))
        ));
    }
}
