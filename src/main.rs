use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use proxy_box::cluster;
use proxy_box::config::loader::DEFAULT_CONFIG_FILE;
use proxy_box::config::{ConfigSources, HttpConfigSource, Resolver};
use proxy_box::observability;
use proxy_box::supervisor::HttpDownloader;
use proxy_box::{Instance, InstanceOptions};

#[derive(Debug, Parser)]
#[command(name = "proxy-box", version, about = "Supervises a proxy core and its tunnel client")]
struct Cli {
    /// Local override file, read when CONFIG is not set.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Do not serve the status listener.
    #[arg(long)]
    no_listen: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let logging = observability::init();

    tracing::info!("proxy-box v{} starting", env!("CARGO_PKG_VERSION"));

    let resolver = Resolver::new(
        ConfigSources::from_env(cli.config),
        Arc::new(HttpConfigSource::new()),
    );
    let config = resolver.resolve().await;
    logging.apply_debug(config.debug);

    let options = InstanceOptions {
        listen: !cli.no_listen,
        keepalive_url: cluster::keepalive_url_from_env(),
    };
    let instance = Instance::new(resolver, config, Arc::new(HttpDownloader::new()), options);

    instance.run().await.code()
}
