use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use batchflow_device::HostBackend;
use batchflow_pipeline::InferenceFlow;

mod cli;

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    tracing::info!("batchflow v{}", env!("CARGO_PKG_VERSION"));

    let mut config = cli.base_config()?;
    if let Some(device) = cli.device {
        config.device_id = device;
    }

    match cli.command {
        Command::Run {
            input,
            model,
            function,
            dp,
            epochs,
            fake_input,
            fake_count,
            loaders,
            preprocess,
            infer,
            postprocess,
            pool_slots,
            channel_order,
            format,
        } => {
            if let Some(model) = model {
                config.model_path = model;
            }
            if let Some(function) = function {
                config.function_name = function;
            }
            if let Some(dp) = dp {
                config.data_parallelism = dp;
            }
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            config.fake_input |= fake_input;
            if let Some(n) = loaders {
                config.parallelism.loaders = n;
            }
            if let Some(n) = preprocess {
                config.parallelism.preprocess = n;
            }
            if let Some(n) = infer {
                config.parallelism.infer = n;
            }
            if let Some(n) = postprocess {
                config.parallelism.postprocess = n;
            }
            if let Some(n) = pool_slots {
                config.pool_slots = n;
            }
            if let Some(order) = channel_order {
                config.channel_order = order.into();
            }

            let paths = match (&input, config.fake_input) {
                (Some(input), _) => cli::collect_inputs(input)?,
                (None, true) => cli::fake_inputs(fake_count),
                (None, false) => anyhow::bail!("an input path is required without --fake-input"),
            };
            tracing::info!(images = paths.len(), "collected inputs");

            let flow = InferenceFlow::new(config, Arc::new(HostBackend::new()))?;
            let report = flow.run(paths)?;
            cli::print_report(&report, format)?;
        }
        Command::Describe {
            model,
            function,
            dp,
        } => {
            if let Some(model) = model {
                config.model_path = model;
            }
            if let Some(function) = function {
                config.function_name = function;
            }
            if let Some(dp) = dp {
                config.data_parallelism = dp;
            }
            cli::describe(&config)?;
        }
    }

    Ok(())
}
