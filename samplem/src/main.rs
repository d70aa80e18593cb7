mod sample;
use sample::SampleReconciler;

use clap::Parser;
use kube::Api as KubeApi;
use kube::runtime::watcher as kube_watcher;
use kwatch::Controller;
use kwatch::Error;
use kwatch::KubeSource;
use kwatch_api as api;
use log;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Watch Sample custom resources and reconcile them.
#[derive(Parser, Debug)]
#[command(name = "watch-crd", version)]
struct Cli {
    #[command(flatten)]
    options: kwatch::cli::Options,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let cli = Cli::parse();
    let kube_client = match cli.options.client().await {
	Ok(client) => client,
	Err(err) => {
	    log::error!("unable to start manager: {}", err);
	    return Err(err);
	}
    };

    let samples: KubeApi<api::Sample> = KubeApi::all(kube_client.clone());
    let source = Arc::new(KubeSource::new(samples, kube_watcher::Config::default(), cli.options.resync_period()));
    let reconciler = Arc::new(SampleReconciler::new(kube_client));
    let controller: Controller<api::Sample, _, _> = Controller::new("sample", source.clone(), reconciler, cli.options.controller_config());

    let cancel = CancellationToken::new();
    let watch = {
	let source = source.clone();
	let cancel = cancel.child_token();
	tokio::spawn(async move { source.run(cancel).await })
    };

    // handle CTRL^C as gracefully as we can.
    tokio::spawn({
	let cancel = cancel.clone();
	async move {
	    match tokio::signal::ctrl_c().await {
		Ok(()) => {
		    log::info!("Interrupted, draining the queue");
		    cancel.cancel();
		},
		Err(err) => log::error!("Unable to listen for the interrupt signal: {}", err),
	    }
	}
    });

    let result = controller.run(cancel.clone()).await;
    if let Err(err) = &result {
	log::error!("problem running manager: {}", err);
    }

    cancel.cancel();
    match watch.await {
	Ok(Err(err)) => log::error!("watcher failed: {}", err),
	Err(err) => log::error!("watcher task failed: {}", err),
	Ok(Ok(())) => {},
    }

    result
}
