use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

use driftfs_daemon::config::{Config, Options};
use driftfs_daemon::daemon::Daemon;
use driftfs_daemon::fs::bridge::FsHandle;
use driftfs_daemon::net;

fn init_tracing(filter: &str) -> anyhow::Result<()> {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::try_new(filter).context("parsing log filter")?)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_tracing(&options.log)?;

    let config = Config::from_options(&options)?;
    std::fs::create_dir_all(&config.working_dir).with_context(|| {
        format!(
            "creating working directory {}",
            config.working_dir.display()
        )
    })?;

    // Single-threaded by design: the whole daemon is one event loop.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let (net_tx, rx_net) = mpsc::unbounded_channel();
        let transport = net::spawn(
            config.id.clone(),
            config.listen_port,
            config.peers.clone(),
            net_tx,
        )
        .await
        .context("starting peer networking")?;

        // The kernel filesystem binding attaches here: it takes the bridge
        // handle at mount time and calls it from its own threads.
        let (fs_handle, rx_fsop) = FsHandle::new();
        match &config.mount {
            Some(mount) => {
                tracing::info!(mount = %mount.display(), "mount point configured; waiting for the kernel binding");
            }
            None => tracing::info!("no mount point configured; serving peers only"),
        }
        let _fs_handle = fs_handle;

        Daemon::new(config, transport, rx_net, rx_fsop)?.run().await
    })
}
