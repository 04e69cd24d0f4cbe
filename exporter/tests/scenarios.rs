//! End-to-end scrapes against a scripted engine.

use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use dcgm_client::mock::MockDcgm;
use dcgm_client::values::FieldValue;
use dcgm_client::{DcgmClient, Entity, EntityKind};
use dcgm_exporter::collectors::{build_collectors, Systems};
use dcgm_exporter::config::{Args, Config};
use dcgm_exporter::counters::{parse_counters, ProfilingPolicy};
use dcgm_exporter::devices::SystemInfo;
use dcgm_exporter::kubernetes::podresources::{
    ContainerDevices, ContainerResources, ListPodResourcesResponse, PodResources,
};
use dcgm_exporter::kubernetes::PodMapper;
use dcgm_exporter::metrics::{Metric, MetricsByCounter};
use dcgm_exporter::pipeline::Pipeline;
use dcgm_exporter::render::render;

fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as i64
}

fn config_from(argv: &[&str]) -> Config {
    let mut full = vec!["dcgm-exporter", "-f", "counters.csv"];
    full.extend_from_slice(argv);
    Config::from_args(&Args::parse_from(full)).unwrap()
}

fn pipeline_for(mock: &Arc<MockDcgm>, csv: &str, config: &Config) -> Pipeline {
    let policy = ProfilingPolicy {
        enabled: false,
        supported: HashSet::new(),
    };
    let counters = parse_counters(csv, &policy).unwrap();
    let systems = Systems {
        gpu: SystemInfo::initialize(&**mock, EntityKind::Gpu, config.gpu_devices.clone()).unwrap(),
        switch: SystemInfo::initialize(&**mock, EntityKind::Switch, config.switch_devices.clone())
            .unwrap(),
        cpu: SystemInfo::initialize(&**mock, EntityKind::Cpu, config.cpu_devices.clone()).unwrap(),
    };
    let client: Arc<dyn DcgmClient> = Arc::clone(mock) as Arc<dyn DcgmClient>;
    let devices = systems.gpu.gpus().to_vec();
    let collectors =
        build_collectors(Arc::clone(&client), &counters, &systems, config, "node-a").unwrap();
    Pipeline::new(client, collectors, None, devices)
}

fn all_metrics(out: &MetricsByCounter) -> Vec<Metric> {
    out.iter().flat_map(|(_, m)| m.clone()).collect()
}

#[tokio::test]
async fn s1_single_gpu_clock_events_two_reasons() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");

    let config = config_from(&["--clock-events-window", "60000"]);
    let csv = "DCGM_EXP_CLOCK_EVENTS_COUNT, gauge, \"\"\n\
               DCGM_FI_DRIVER_VERSION, label, drv\n";
    let mut pipeline = pipeline_for(&mock, csv, &config);

    let gpu0 = Entity::new(EntityKind::Gpu, 0);
    let now = now_us();
    let sw_and_hw_thermal = 0x20 | 0x40;
    mock.push_sample(gpu0, FieldValue::int64(112, now - 100, sw_and_hw_thermal));
    mock.push_sample(gpu0, FieldValue::int64(112, now - 50, sw_and_hw_thermal));
    mock.push_sample(gpu0, FieldValue::int64(112, now, 0x1));

    let out = pipeline.scrape().await.unwrap();
    let metrics = all_metrics(&out);
    assert_eq!(metrics.len(), 3);
    let count_for = |reason: &str| {
        metrics
            .iter()
            .find(|m| m.labels.get("clock_event").map(String::as_str) == Some(reason))
            .map(|m| m.value.clone())
            .unwrap()
    };
    assert_eq!(count_for("sw_thermal"), "2");
    assert_eq!(count_for("hw_thermal"), "2");
    assert_eq!(count_for("gpu_idle"), "1");
    for m in &metrics {
        assert_eq!(m.labels.get("window_size_in_ms").unwrap(), "60000");
    }
}

#[tokio::test]
async fn s2_two_gpus_xid_multi_error() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
    mock.add_gpu(1, "GPU-bbbb", "0000:41:00.0", "NVIDIA H100");

    let config = config_from(&["--xid-count-window", "60000"]);
    let mut pipeline = pipeline_for(&mock, "DCGM_EXP_XID_ERRORS_COUNT, gauge, xids\n", &config);

    let now = now_us();
    for xid in [42, 42, 46] {
        mock.push_sample(Entity::new(EntityKind::Gpu, 0), FieldValue::int64(230, now, xid));
    }
    for xid in [42, 46, 46, 46] {
        mock.push_sample(Entity::new(EntityKind::Gpu, 1), FieldValue::int64(230, now, xid));
    }

    let out = pipeline.scrape().await.unwrap();
    let shape: Vec<(String, String, String)> = all_metrics(&out)
        .iter()
        .map(|m| {
            (
                m.gpu_id.clone(),
                m.labels.get("xid").cloned().unwrap_or_default(),
                m.value.clone(),
            )
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            ("0".into(), "42".into(), "2".into()),
            ("0".into(), "46".into(), "1".into()),
            ("1".into(), "42".into(), "1".into()),
            ("1".into(), "46".into(), "3".into()),
        ]
    );
}

#[tokio::test]
async fn s3_cpu_only_counter_on_a_two_cpu_node() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_cpu(0, &[]);
    mock.add_cpu(1, &[]);
    mock.set_latest(EntityKind::Cpu, 0, FieldValue::double(1132, 1, 12.5));
    mock.set_latest(EntityKind::Cpu, 1, FieldValue::double(1132, 1, 50.0));

    let config = config_from(&[]);
    let mut pipeline = pipeline_for(&mock, "DCGM_FI_DEV_CPU_UTIL_TOTAL, gauge, cpu util\n", &config);

    let out = pipeline.scrape().await.unwrap();
    let metrics = all_metrics(&out);
    assert_eq!(metrics.len(), 2);
    for (i, m) in metrics.iter().enumerate() {
        assert_eq!(m.gpu_id, i.to_string());
        assert_eq!(m.gpu_device, i.to_string());
        assert!(m.gpu_uuid.is_empty());
    }
    assert_eq!(metrics[0].value, "12.500000");
    assert_eq!(metrics[1].value, "50.000000");
}

#[tokio::test]
async fn s4_mig_pod_mapping() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-abc", "0000:01:00.0", "NVIDIA A100");
    mock.add_gpu_instance(0, 10, 1, "1g.5gb");
    mock.set_latest(
        EntityKind::GpuInstance,
        10,
        FieldValue::int64(150, 1, 40),
    );

    let config = config_from(&["-k"]);
    let mut pipeline = pipeline_for(&mock, "DCGM_FI_DEV_GPU_TEMP, gauge, temp\n", &config);
    let out0 = pipeline.scrape().await.unwrap();
    let mut out = out0.clone();

    let response = ListPodResourcesResponse {
        pod_resources: vec![PodResources {
            name: "p1".into(),
            namespace: "ns".into(),
            containers: vec![ContainerResources {
                name: "c".into(),
                devices: vec![ContainerDevices {
                    resource_name: "nvidia.com/mig-1g.5gb".into(),
                    device_ids: vec!["MIG-GPU-abc/1/0".into()],
                }],
                dynamic_resources: vec![],
            }],
        }],
    };
    let mapper = PodMapper::from_config(&config);
    let devices = mock.enumerate_gpus().unwrap();
    mapper.annotate(&response, &mut out, &devices).await;

    let metrics = all_metrics(&out);
    assert_eq!(metrics.len(), 1);
    let m = &metrics[0];
    assert_eq!(m.gpu_instance_id, "1");
    assert_eq!(m.gpu_uuid, "GPU-abc");
    assert_eq!(m.attributes.get("pod").unwrap(), "p1");
    assert_eq!(m.attributes.get("namespace").unwrap(), "ns");
    assert_eq!(m.attributes.get("container").unwrap(), "c");

    // Deep-copy law: the unannotated scrape output was not mutated.
    assert!(all_metrics(&out0)[0].attributes.is_empty());
}

#[tokio::test]
async fn s5_gke_vgpu_fan_out() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA T4");
    mock.set_latest(EntityKind::Gpu, 0, FieldValue::int64(150, 1, 55));

    let config = config_from(&[
        "-k",
        "--kubernetes-virtual-gpus",
        "--kubernetes-gpu-id-type",
        "device-name",
    ]);
    let mut pipeline = pipeline_for(&mock, "DCGM_FI_DEV_GPU_TEMP, gauge, temp\n", &config);
    let mut out = pipeline.scrape().await.unwrap();

    let container = |name: &str| ContainerResources {
        name: name.into(),
        devices: vec![ContainerDevices {
            resource_name: "nvidia.com/gpu".into(),
            device_ids: vec!["nvidia0/vgpu7".into()],
        }],
        dynamic_resources: vec![],
    };
    let response = ListPodResourcesResponse {
        pod_resources: vec![PodResources {
            name: "p".into(),
            namespace: "ns".into(),
            containers: vec![container("c1"), container("c2")],
        }],
    };
    let mapper = PodMapper::from_config(&config);
    mapper.annotate(&response, &mut out, &[]).await;

    let metrics = all_metrics(&out);
    assert_eq!(metrics.len(), 2);
    for m in &metrics {
        assert_eq!(m.value, "55");
        assert_eq!(m.attributes.get("vgpu").unwrap(), "7");
        assert_eq!(m.attributes.get("pod").unwrap(), "p");
    }
    assert_eq!(metrics[0].attributes.get("container").unwrap(), "c1");
    assert_eq!(metrics[1].attributes.get("container").unwrap(), "c2");
}

#[tokio::test]
async fn s6_p2p_two_gpu_matrix() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
    mock.add_gpu(1, "GPU-bbbb", "0000:41:00.0", "NVIDIA H100");
    mock.set_p2p(vec![vec![0, 1], vec![1, 0]]);

    let config = config_from(&[]);
    let mut pipeline = pipeline_for(&mock, "DCGM_EXP_P2P_STATUS, gauge, p2p\n", &config);

    let out = pipeline.scrape().await.unwrap();
    let metrics = all_metrics(&out);
    assert_eq!(metrics.len(), 2);
    for m in &metrics {
        assert_eq!(m.value, "1");
        assert!(m.labels.contains_key("peer_gpu"));
        assert!(m.labels.contains_key("link_status"));
    }
}

#[tokio::test]
async fn one_metric_per_counter_per_entity_and_renderable_output() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
    mock.add_gpu(1, "GPU-bbbb", "0000:41:00.0", "NVIDIA H100");
    for i in 0..2 {
        mock.set_latest(EntityKind::Gpu, i, FieldValue::int64(150, 1, 80 + i as i64));
        mock.set_latest(EntityKind::Gpu, i, FieldValue::double(155, 1, 250.0));
        mock.set_latest(EntityKind::Gpu, i, FieldValue::string(1, 1, "550.54.15"));
    }

    let config = config_from(&[]);
    let csv = "DCGM_FI_DEV_GPU_TEMP, gauge, GPU temperature (C).\n\
               DCGM_FI_DEV_POWER_USAGE, gauge, Power draw (W).\n\
               DCGM_FI_DRIVER_VERSION, label, Driver version.\n";
    let mut pipeline = pipeline_for(&mock, csv, &config);
    let out = pipeline.scrape().await.unwrap();

    // Exactly one metric per (counter, entity); the label counter emits none.
    assert_eq!(out.counter_count(), 2);
    for (_, list) in out.iter() {
        assert_eq!(list.len(), 2);
    }

    let text = render(&out);
    assert!(text.contains("# TYPE DCGM_FI_DEV_GPU_TEMP gauge"));
    // Label counters surface as labels, never as their own family.
    assert!(!text.contains("# TYPE DCGM_FI_DRIVER_VERSION"));
    assert!(text.contains("DCGM_FI_DRIVER_VERSION=\"550.54.15\""));
    assert!(text.contains("Hostname=\"node-a\""));
}

#[tokio::test]
async fn catalogue_file_drives_a_scrape() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# node counters").unwrap();
    writeln!(file, "DCGM_FI_DEV_GPU_TEMP, gauge, GPU temperature (C).").unwrap();
    file.flush().unwrap();

    let csv = std::fs::read_to_string(file.path()).unwrap();
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
    mock.set_latest(EntityKind::Gpu, 0, FieldValue::int64(150, 1, 85));

    let config = config_from(&[]);
    let mut pipeline = pipeline_for(&mock, &csv, &config);
    let out = pipeline.scrape().await.unwrap();
    assert_eq!(out.metric_count(), 1);
}

#[tokio::test]
async fn shutdown_cleanup_leaves_no_engine_state() {
    let mock = Arc::new(MockDcgm::new());
    mock.add_gpu(0, "GPU-aaaa", "0000:01:00.0", "NVIDIA H100");
    let config = config_from(&[]);
    let csv = "DCGM_FI_DEV_GPU_TEMP, gauge, temp\n\
               DCGM_EXP_CLOCK_EVENTS_COUNT, gauge, clocks\n\
               DCGM_EXP_XID_ERRORS_COUNT, gauge, xids\n\
               DCGM_EXP_GPU_HEALTH_STATUS, gauge, health\n\
               DCGM_EXP_P2P_STATUS, gauge, p2p\n";
    let mut pipeline = pipeline_for(&mock, csv, &config);
    assert!(mock.live_groups() >= 4);

    pipeline.scrape().await.unwrap();
    pipeline.cleanup();
    assert_eq!(mock.live_groups(), 0);
    assert_eq!(mock.live_field_groups(), 0);
}
