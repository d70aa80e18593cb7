use crate::controller::ControllerConfig;
use crate::errors::Error;

use kube::Client as KubeClient;
use kube::Config as KubeConfig;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use log;
use std::path::PathBuf;
use std::time::Duration;

/*
 * Command line options shared by the controller binaries.
 */
#[derive(clap::Args, Clone, Debug)]
pub struct Options {

    /// (optional) absolute path to the kubeconfig file, defaults to ~/.kube/config
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Seconds between full resyncs of the cache, 0 disables them
    #[arg(long, default_value_t = 60)]
    pub resync_period: u64,

    /// Seconds to wait for the initial listing before giving up
    #[arg(long, default_value_t = 120)]
    pub cache_sync_timeout: u64,

    /// Drop a failing object after this many retries (retry forever when unset)
    #[arg(long)]
    pub max_retries: Option<u32>,
}

fn home_kubeconfig() -> Option<PathBuf> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    let path = PathBuf::from(home).join(".kube").join("config");

    if path.is_file() {
	Some(path)
    } else {
	None
    }
}

impl Options {

    pub fn controller_config(&self) -> ControllerConfig {
	ControllerConfig{
	    workers: self.workers,
	    cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout),
	    max_retries: self.max_retries,
	    ..ControllerConfig::default()
	}
    }

    pub fn resync_period(&self) -> Option<Duration> {
	match self.resync_period {
	    0 => None,
	    secs => Some(Duration::from_secs(secs)),
	}
    }

    /*
     * Path of the kubeconfig to use: the one given on the command line,
     * else ~/.kube/config when it exists.
     */
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
	self.kubeconfig.clone().or_else(home_kubeconfig)
    }

    /*
     * Build a client out of the selected kubeconfig, falling back to the
     * usual in-cluster / environment inference when there is none.
     */
    pub async fn client(&self) -> Result<KubeClient, Error> {
	let path = match self.kubeconfig_path() {
	    Some(path) => path,
	    None => {
		log::info!("No kubeconfig found, inferring client configuration");
		return Ok(KubeClient::try_default().await?);
	    }
	};

	log::info!("Using kubeconfig {}", path.display());
	let kubeconfig = Kubeconfig::read_from(&path)?;
	let config = KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;

	Ok(KubeClient::try_from(config)?)
    }
}
