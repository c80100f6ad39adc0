//! taskbridge binary: speaks the bridge protocol on stdin/stdout, logs to stderr.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use taskbridge::{BridgeConfig, BridgeService, init_tracing, install_panic_hook, termination_signal};

fn main() -> ExitCode {
    init_tracing();

    match run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("Initialization failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> anyhow::Result<u8> {
    let config = BridgeConfig::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "Loaded configuration");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let engine = Arc::new(config.engine.build());
    let service = BridgeService::new(config, engine);
    install_panic_hook(service.shutdown_handle());

    let outcome = runtime.block_on(async {
        let signal = termination_signal().context("failed to install signal handlers")?;
        anyhow::Ok(
            service
                .run(tokio::io::stdin(), tokio::io::stdout(), signal)
                .await,
        )
    })?;

    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(outcome.exit_code)
}
