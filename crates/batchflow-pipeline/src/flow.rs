use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use batchflow_core::{AcceleratorBackend, FlowError, ImageLoader, Result};
use batchflow_preprocess::{FakeImageLoader, FileImageLoader};

use crate::config::PipelineConfig;
use crate::state::{FlowState, QueueSizes};
use crate::stats::RunReport;
use crate::workers::{
    run_infer, run_loader, run_postprocess, run_preprocess, run_source, spawn_worker,
};

#[derive(Debug, Default)]
struct Started {
    loaders: usize,
    preprocess: usize,
    infer: usize,
    postprocess: usize,
}

/// Orchestrates the load → preprocess → infer → postprocess stages.
///
/// Stages can be added in any order; preprocess and postprocess workers
/// wait until the first infer worker has registered the model. A flow
/// runs one submitted path list for the configured number of epochs and
/// then shuts itself down.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use batchflow_device::HostBackend;
/// # use batchflow_pipeline::{InferenceFlow, PipelineConfig};
/// let flow = InferenceFlow::new(PipelineConfig::default(), Arc::new(HostBackend::new()))?;
/// let report = flow.run(vec!["images/0001.jpg".into()])?;
/// println!("{:.1} images/s", report.epochs[0].throughput.e2e_qps);
/// # Ok::<(), batchflow_core::FlowError>(())
/// ```
pub struct InferenceFlow {
    state: Arc<FlowState>,
    backend: Arc<dyn AcceleratorBackend>,
    loader: Arc<dyn ImageLoader>,
    handles: Vec<JoinHandle<()>>,
    started: Started,
}

impl InferenceFlow {
    /// Validate `config` and start the source worker. Input images are
    /// decoded from disk, or synthesized when `fake_input` is set.
    pub fn new(config: PipelineConfig, backend: Arc<dyn AcceleratorBackend>) -> Result<Self> {
        config.validate()?;
        let loader: Arc<dyn ImageLoader> = if config.fake_input {
            Arc::new(FakeImageLoader::default())
        } else {
            Arc::new(FileImageLoader)
        };
        tracing::info!(
            model = %config.model_path.display(),
            function = %config.function_name,
            device = config.device_id,
            dp = config.data_parallelism,
            epochs = config.epochs,
            fake_input = config.fake_input,
            "configured inference flow"
        );

        let state = Arc::new(FlowState::new(config));
        let source = spawn_worker("source".into(), Arc::clone(&state), run_source)?;
        Ok(Self {
            state,
            backend,
            loader,
            handles: vec![source],
            started: Started::default(),
        })
    }

    /// Replace the image loader. Must be called before any stage starts.
    pub fn with_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.state.config
    }

    pub fn state(&self) -> &Arc<FlowState> {
        &self.state
    }

    /// Add dedicated decode workers. Only valid when the configuration
    /// routes preprocessing through the raw-image queue.
    pub fn add_loaders(&mut self, count: usize) -> Result<()> {
        if self.state.config.parallelism.loaders == 0 {
            return Err(FlowError::Config(
                "loader workers require parallelism.loaders > 0".into(),
            ));
        }
        for _ in 0..count {
            let loader = Arc::clone(&self.loader);
            let name = format!("load-{}", self.started.loaders);
            self.spawn(name, move |s| run_loader(s, loader.as_ref()))?;
            self.started.loaders += 1;
        }
        Ok(())
    }

    pub fn add_preprocess(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            let loader = Arc::clone(&self.loader);
            let name = format!("preprocess-{}", self.started.preprocess);
            self.spawn(name, move |s| run_preprocess(s, loader.as_ref()))?;
            self.started.preprocess += 1;
        }
        Ok(())
    }

    pub fn add_infer(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            let backend = Arc::clone(&self.backend);
            let name = format!("infer-{}", self.started.infer);
            self.spawn(name, move |s| run_infer(s, backend.as_ref()))?;
            self.started.infer += 1;
        }
        Ok(())
    }

    pub fn add_postprocess(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            let name = format!("postprocess-{}", self.started.postprocess);
            self.spawn(name, run_postprocess)?;
            self.started.postprocess += 1;
        }
        Ok(())
    }

    /// Start every stage with the configured parallelism.
    pub fn start(&mut self) -> Result<()> {
        let p = self.state.config.parallelism;
        if p.loaders > 0 {
            self.add_loaders(p.loaders)?;
        }
        self.add_infer(p.infer)?;
        self.add_preprocess(p.preprocess)?;
        self.add_postprocess(p.postprocess)?;
        Ok(())
    }

    /// Queue `paths` for the first epoch.
    pub fn submit<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.state.submit(paths.into_iter().map(Into::into).collect())
    }

    /// Start all stages, submit `paths` and wait for the final epoch.
    pub fn run(mut self, paths: Vec<PathBuf>) -> Result<RunReport> {
        self.start()?;
        if let Err(e) = self.submit(paths) {
            self.state.cancel(e);
        }
        self.join()
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        self.state.queues.sizes()
    }

    /// Stop the flow early. `join` then reports the cancellation.
    pub fn cancel(&self) {
        self.state
            .cancel(FlowError::Pipeline("cancelled by caller".into()));
    }

    /// Wait for every worker to exit, free device buffers and return the
    /// run report, or the error that stopped the run.
    ///
    /// Blocks until the final epoch completes, a fatal error occurs or
    /// [`cancel`](Self::cancel) is called.
    pub fn join(mut self) -> Result<RunReport> {
        self.join_workers();
        self.teardown()
    }

    /// Let the workers run on without waiting for them.
    pub fn detach(mut self) {
        let detached = std::mem::take(&mut self.handles).len();
        tracing::debug!(workers = detached, "detached flow workers");
    }

    fn spawn<F>(&mut self, name: String, body: F) -> Result<()>
    where
        F: FnOnce(&FlowState) -> Result<()> + Send + 'static,
    {
        let handle = spawn_worker(name, Arc::clone(&self.state), body)?;
        self.handles.push(handle);
        Ok(())
    }

    fn join_workers(&mut self) {
        for handle in std::mem::take(&mut self.handles) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "worker panicked");
            }
        }
    }

    fn teardown(&self) -> Result<RunReport> {
        self.state.queues.reset_all();
        let registration = self.state.registration();

        let mut teardown_err = None;
        let (mut input_pool, mut output_pool) = (None, None);
        if let Some(reg) = &registration {
            input_pool = Some(reg.input_pool.stats().into());
            output_pool = Some(reg.output_pool.stats().into());
            for pool in [&reg.input_pool, &reg.output_pool] {
                if let Err(e) = pool.destroy() {
                    tracing::error!(pool_id = pool.id(), error = %e, "pool teardown failed");
                    teardown_err.get_or_insert(e);
                }
            }
        }

        if let Some(err) = self.state.take_error() {
            return Err(err);
        }
        if let Some(err) = teardown_err {
            return Err(err);
        }
        Ok(RunReport {
            epochs: self.state.reports(),
            solo_latency_us: self.state.solo_latency(),
            input_pool,
            output_pool,
        })
    }
}

impl Drop for InferenceFlow {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.state.shutdown();
        self.join_workers();
        if let Err(e) = self.teardown() {
            tracing::debug!(error = %e, "flow dropped before completion");
        }
    }
}
