use dhctl::cache::{FileCache, StateCache};
use dhctl::config::{DestroyConfig, DESTROY_COMMAND};
use dhctl::converge::{ConvergeLockConfig, KubeConvergeLocker};
use dhctl::destroy::{
    DefaultInfraDestroyerFactory, DestroyOptions, KubeProviders, SharedCollaborators,
    StaticLoops, StdinConfirmation,
};
use dhctl::infra::TerraformEngine;
use dhctl::kubernetes::{KubeClientProvider, LazyKubeProvider};
use dhctl::logging::init_logging;
use dhctl::nodeuser::KubeNodeUserClient;
use dhctl::phases::PhasedExecutionContext;
use dhctl::resources::KubeResourcesDestroyer;
use dhctl::shutdown::Shutdown;
use dhctl::ssh::{NativeSshProvider, SshProvider};
use dhctl::state::{init_state_loader, StateLoaderParams};
use dhctl::tmplock::TmpDirLock;
use dhctl::{ClusterDestroyer, DestroyError, DestroyOutcome};
use std::sync::Arc;
use tracing::{error, info};

/// Exit status for a failed destroy run
const EXIT_PIPELINE_FAILURE: i32 = 1;
/// Exit status for an invocation that never started
const EXIT_INVALID_INVOCATION: i32 = 2;

/// Why the process stops with a non-zero status
#[derive(Debug)]
pub enum Failure {
    /// Bad environment or a command outside the allow-list
    Invalid(DestroyError),
    Pipeline(DestroyError),
}

impl Failure {
    pub fn exit_code(&self) -> i32 {
        match self {
            Failure::Invalid(_) => EXIT_INVALID_INVOCATION,
            Failure::Pipeline(_) => EXIT_PIPELINE_FAILURE,
        }
    }

    /// Single stderr line: kind and message
    pub fn message(&self) -> String {
        let err = match self {
            Failure::Invalid(e) | Failure::Pipeline(e) => e,
        };
        format!("Error [{}]: {err}", err.kind())
    }
}

fn load_config() -> Result<DestroyConfig, Failure> {
    let config = DestroyConfig::from_env().map_err(Failure::Invalid)?;
    config.check_allowed(DESTROY_COMMAND).map_err(Failure::Invalid)?;
    Ok(config)
}

async fn run(config: &DestroyConfig, shutdown: &Shutdown) -> Result<DestroyOutcome, DestroyError> {
    let cancel = shutdown.token();
    let tmp_lock = TmpDirLock::acquire(&config.tmp_dir, &format!("dhctl {DESTROY_COMMAND}"))?;

    let ssh: Option<Arc<dyn SshProvider>> = config
        .ssh
        .clone()
        .map(|session| Arc::new(NativeSshProvider::new(session, cancel.clone())) as Arc<dyn SshProvider>);
    if let Some(ssh) = &ssh {
        let ssh = ssh.clone();
        shutdown.on_shutdown("stop ssh", move || ssh.stop());
    }

    let identity = config.cache_identity();
    let cache: Arc<dyn StateCache> = Arc::new(FileCache::open(&config.tmp_dir, &identity)?);
    info!(identity = %identity, "State cache opened");

    let kube: Arc<dyn KubeClientProvider> =
        Arc::new(LazyKubeProvider::new(config.kubeconfig.clone(), ssh.clone()));
    let init = init_state_loader(
        StateLoaderParams {
            commander_mode: config.commander_mode,
            commander_params: config.commander_params()?,
            cache: cache.clone(),
            skip_resources: config.skip_resources,
            force_from_cache: config.force_from_cache || config.abort,
        },
        kube.clone(),
        ssh.clone(),
    )
    .await?;
    info!(from_cache = init.from_cache, "State loader ready");
    let providers = KubeProviders::new(kube.clone(), &init);

    let shared = SharedCollaborators {
        cache,
        loader: init.loader,
        kube: providers.infra.clone(),
        ssh: ssh.clone(),
        phases: Arc::new(PhasedExecutionContext::for_destroy()),
        cancel: cancel.clone(),
    };
    let factory = Arc::new(DefaultInfraDestroyerFactory {
        engine: Arc::new(TerraformEngine::new(
            &config.infra_binary,
            &config.infra_modules_dir,
            config.tmp_dir.join("infra"),
            cancel.clone(),
        )),
        node_users: Arc::new(KubeNodeUserClient::new(providers.infra.clone(), cancel.clone())),
        tmp_dir: config.tmp_dir.clone(),
        static_loops: StaticLoops::default(),
    });
    let resources = Arc::new(KubeResourcesDestroyer::new(providers.resources.clone(), cancel.clone()));
    let locker = Arc::new(KubeConvergeLocker::new(ConvergeLockConfig::for_destroy(), cancel.clone()));
    let options = DestroyOptions {
        commander_mode: config.commander_mode,
        skip_resources: config.skip_resources,
    };
    let confirmation = Arc::new(StdinConfirmation);

    let destroyer = if config.abort {
        ClusterDestroyer::abort(shared, resources, locker, factory, confirmation, options)
    } else {
        ClusterDestroyer::new(shared, resources, locker, factory, confirmation, options)
    };

    let result = destroyer.destroy_cluster(config.auto_approve).await;

    kube.cleanup(true).await;
    if let Some(ssh) = &ssh {
        ssh.stop();
    }
    tmp_lock.release();
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => {
            eprintln!("{}", failure.message());
            std::process::exit(failure.exit_code());
        }
    };

    init_logging(&config.logging())?;
    info!(tmp_dir = %config.tmp_dir.display(), abort = config.abort, "Starting cluster destroy");

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let result = run(&config, &shutdown).await;
    shutdown.run_callbacks();

    match result {
        Ok(DestroyOutcome::Completed) => {
            info!("Cluster destroy finished");
            Ok(())
        }
        Ok(DestroyOutcome::Stopped) => {
            info!("Cluster destroy stopped, run again to continue");
            Ok(())
        }
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "Cluster destroy failed");
            let failure = Failure::Pipeline(e);
            eprintln!("{}", failure.message());
            std::process::exit(failure.exit_code());
        }
    }
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
