mod deployment;
use deployment::DeploymentReconciler;

use clap::Parser;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api as KubeApi;
use kube::runtime::watcher as kube_watcher;
use kwatch::Controller;
use kwatch::Error;
use kwatch::KubeSource;
use log;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Watch Deployments in every namespace and report their state.
#[derive(Parser, Debug)]
#[command(name = "watch-deployment", version)]
struct Cli {
    #[command(flatten)]
    options: kwatch::cli::Options,
}

/*
 * Program design:
 *
 *  1. Build a client out of the kubeconfig
 *  2. Watch all Deployments into a local cache
 *  3. Wait for the cache to sync and start the workers
 *  4. On CTRL^C, let the workers drain the queue and leave
 */
#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let cli = Cli::parse();
    let kube_client = match cli.options.client().await {
	Ok(client) => client,
	Err(err) => {
	    log::error!("failed to build kubernetes client: {}", err);
	    return Err(err);
	}
    };

    let deployments: KubeApi<Deployment> = KubeApi::all(kube_client);
    let source = Arc::new(KubeSource::new(deployments, kube_watcher::Config::default(), cli.options.resync_period()));
    let reconciler = Arc::new(DeploymentReconciler::new(source.clone()));
    let controller: Controller<Deployment, _, _> = Controller::new("demo-deployment", source.clone(), reconciler, cli.options.controller_config());

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
		    log::info!("Interrupted, shutting down");
		    cancel.cancel();
		},
		Err(err) => log::error!("Unable to listen for the interrupt signal: {}", err),
	    }
	}
    });

    let result = controller.run(cancel.clone()).await;
    if let Err(err) = &result {
	log::error!("run controller failed, error: {}", err);
    }

    cancel.cancel();
    match watch.await {
	Ok(Err(err)) => log::error!("watcher failed: {}", err),
	Err(err) => log::error!("watcher task failed: {}", err),
	Ok(Ok(())) => {},
    }

    result
}
