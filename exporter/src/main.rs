use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};

use dcgm_client::{DcgmClient, EntityKind};
use dcgm_exporter::collectors::{build_collectors, Systems};
use dcgm_exporter::config::{Args, Config, CountersSource};
use dcgm_exporter::counters::{parse_counters, ProfilingPolicy};
use dcgm_exporter::devices::SystemInfo;
use dcgm_exporter::kubernetes::apiserver::ApiClient;
use dcgm_exporter::kubernetes::dra::ApiResourceSliceManager;
use dcgm_exporter::kubernetes::labels::ApiServerLabeler;
use dcgm_exporter::kubernetes::PodMapper;
use dcgm_exporter::pipeline::Pipeline;
use dcgm_exporter::server::{router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("[main] {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let args = Args::parse();
    let config = Config::from_args(&args).context("invalid configuration")?;
    let client = connect_engine(&args)?;

    let csv = load_counters_csv(&config).await?;
    let policy = ProfilingPolicy::from_client(&*client, config.collect_profiling);
    let counters = parse_counters(&csv, &policy)?;
    info!(
        "[main] catalogue: {} native counter(s), {} exporter counter(s)",
        counters.native.len(),
        counters.exporter.len()
    );

    let systems = Systems {
        gpu: SystemInfo::initialize(&*client, EntityKind::Gpu, config.gpu_devices.clone())?,
        switch: SystemInfo::initialize(&*client, EntityKind::Switch, config.switch_devices.clone())?,
        cpu: SystemInfo::initialize(&*client, EntityKind::Cpu, config.cpu_devices.clone())?,
    };
    let devices = systems.gpu.gpus().to_vec();
    let collectors = build_collectors(
        Arc::clone(&client),
        &counters,
        &systems,
        &config,
        &config.hostname,
    )?;
    let pod_mapper = if config.kubernetes {
        Some(build_pod_mapper(&config))
    } else {
        None
    };

    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);
    let state = Arc::new(AppState {
        pipeline: Mutex::new(Pipeline::new(client, collectors, pod_mapper, devices)),
        fatal: fatal_tx,
    });

    let listener = tokio::net::TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("binding {}", config.address))?;
    info!("[main] serving metrics on http://{}/metrics", config.address);

    let mut fatal_msg = None;
    tokio::select! {
        result = axum::serve(listener, router(Arc::clone(&state))).into_future() => {
            result.context("metrics server failed")?;
        }
        _ = shutdown_signal() => {
            info!("[main] shutdown signal received");
        }
        msg = fatal_rx.recv() => {
            fatal_msg = msg;
        }
    }

    state.pipeline.lock().await.cleanup();
    match fatal_msg {
        Some(msg) => {
            error!("[main] exiting after fatal engine error: {msg}");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!("[main] failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn load_counters_csv(config: &Config) -> Result<String> {
    match &config.counters_source {
        CountersSource::File(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display())),
        CountersSource::ConfigMap { namespace, name } => {
            let api = ApiClient::from_cluster_env()
                .context("a ConfigMap catalogue needs in-cluster API access")?;
            let configmap = api.get_configmap(namespace, name).await?;
            configmap
                .data
                .get("metrics")
                .cloned()
                .with_context(|| format!("configmap {namespace}:{name} has no 'metrics' key"))
        }
    }
}

fn build_pod_mapper(config: &Config) -> PodMapper {
    let mut mapper = PodMapper::from_config(config);
    if config.kubernetes_pod_labels {
        match ApiClient::from_cluster_env() {
            Some(api) => mapper = mapper.with_labeler(Arc::new(ApiServerLabeler::new(api))),
            None => warn!("[main] pod labels requested but no in-cluster API access"),
        }
    }
    if config.dra {
        match ApiClient::from_cluster_env() {
            Some(api) => {
                let slices = ApiResourceSliceManager::new(api, config.dra_driver.clone());
                Arc::clone(&slices).start();
                mapper = mapper.with_slice_manager(slices);
            }
            None => warn!("[main] DRA requested but no in-cluster API access"),
        }
    }
    mapper
}

#[cfg(feature = "fake-engine")]
fn connect_engine(args: &Args) -> Result<Arc<dyn DcgmClient>> {
    use dcgm_client::mock::MockDcgm;
    use dcgm_client::values::FieldValue;

    let mock = MockDcgm::new();
    for i in 0..args.fake_gpus {
        mock.add_gpu(
            i,
            &format!("GPU-{i:08x}-0000-0000-0000-000000000000"),
            &format!("0000:{:02x}:00.0", i + 1),
            "NVIDIA H100 80GB HBM3",
        );
        mock.set_latest(EntityKind::Gpu, i, FieldValue::int64(150, 0, 30 + i as i64));
        mock.set_latest(EntityKind::Gpu, i, FieldValue::double(155, 0, 61.5));
        mock.set_latest(EntityKind::Gpu, i, FieldValue::int64(203, 0, 0));
        mock.set_latest(EntityKind::Gpu, i, FieldValue::string(1, 0, "550.54.15"));
    }
    info!("[main] running against a synthetic {}-GPU node", args.fake_gpus);
    Ok(Arc::new(mock))
}

#[cfg(not(feature = "fake-engine"))]
fn connect_engine(_args: &Args) -> Result<Arc<dyn DcgmClient>> {
    anyhow::bail!(
        "this build carries no host-engine backend; link an engine-backed \
         dcgm-client implementation, or build with --features fake-engine \
         for a synthetic node"
    )
}
