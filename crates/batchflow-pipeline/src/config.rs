use std::path::{Path, PathBuf};

use batchflow_core::{ChannelOrder, FlowError, Result};
use serde::{Deserialize, Serialize};

/// Worker count for each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageParallelism {
    /// Dedicated image-decode workers. 0 means preprocess workers decode
    /// inline from the path queue.
    pub loaders: usize,
    pub preprocess: usize,
    pub infer: usize,
    pub postprocess: usize,
}

impl Default for StageParallelism {
    fn default() -> Self {
        Self {
            loaders: 0,
            preprocess: 2,
            infer: 1,
            postprocess: 1,
        }
    }
}

/// Capacity of each inter-stage queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCapacities {
    /// `None` leaves the path queue unbounded so resubmitting an epoch
    /// never blocks behind in-flight work.
    pub paths: Option<usize>,
    pub raw_images: usize,
    pub batches: usize,
    pub results: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            paths: None,
            raw_images: 64,
            batches: 320,
            results: 320,
        }
    }
}

/// Runtime configuration for an [`InferenceFlow`](crate::InferenceFlow).
///
/// Fixed once stages start. Loadable from JSON; every field has a
/// default so partial files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model file handed to the accelerator backend.
    pub model_path: PathBuf,
    /// Function to load out of the model file.
    pub function_name: String,
    pub device_id: u32,
    /// Independent streams processed by one invocation.
    pub data_parallelism: usize,
    /// Feed a synthetic image instead of decoding input files.
    pub fake_input: bool,
    /// Number of passes over the submitted path list.
    pub epochs: u32,
    /// Channel order the model expects for packed pixels.
    pub channel_order: ChannelOrder,
    pub parallelism: StageParallelism,
    pub queues: QueueCapacities,
    /// Buffer sets per pool. Bounds the number of batches in flight.
    pub pool_slots: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/faceboxes-500x500.json"),
            function_name: "fusion_0".to_string(),
            device_id: 0,
            data_parallelism: 1,
            fake_input: false,
            epochs: 1,
            channel_order: ChannelOrder::default(),
            parallelism: StageParallelism::default(),
            queues: QueueCapacities::default(),
            pool_slots: 33,
        }
    }
}

impl PipelineConfig {
    /// Preset that keeps a four-stream device busy: wide preprocess, one
    /// infer context per stream group, synthetic input.
    pub fn saturate() -> Self {
        Self {
            data_parallelism: 4,
            fake_input: true,
            epochs: 3,
            parallelism: StageParallelism {
                loaders: 0,
                preprocess: 8,
                infer: 4,
                postprocess: 2,
            },
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| FlowError::Config(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(FlowError::Config(msg.to_string()));
        if self.function_name.is_empty() {
            return fail("function name must not be empty");
        }
        if self.data_parallelism == 0 {
            return fail("data parallelism must be at least 1");
        }
        if self.epochs == 0 {
            return fail("epoch count must be at least 1");
        }
        if self.pool_slots == 0 {
            return fail("pool needs at least one slot");
        }
        let p = &self.parallelism;
        if p.preprocess == 0 || p.infer == 0 || p.postprocess == 0 {
            return fail("preprocess, infer and postprocess each need at least one worker");
        }
        let q = &self.queues;
        if q.paths == Some(0) || q.raw_images == 0 || q.batches == 0 || q.results == 0 {
            return fail("queue capacities must be non-zero");
        }
        Ok(())
    }
}
