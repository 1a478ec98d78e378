//! In-process clusters and the demo workload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::info;

use am_fabric::{LocalFabric, Transport};
use am_gateway::{AccessManager, GatewayConfig};
use am_topology::{Dlt, Dmt, TopologyService};
use am_types::{BlobKey, NodeId, TableVersion, VolumeId, WriteMode};

use crate::cli::{ClusterArgs, DemoArgs};

const DEMO_VOLUME: VolumeId = VolumeId(1);

/// `count` columns of `replicas` consecutive nodes, each starting one node
/// further round the ring than the last.
pub fn ring_columns(nodes: &[NodeId], count: usize, replicas: usize, shift: usize) -> Vec<Vec<NodeId>> {
    let replicas = replicas.clamp(1, nodes.len().max(1));
    (0..count)
        .map(|column| {
            (0..replicas)
                .map(|r| nodes[(column + shift + r) % nodes.len()])
                .collect()
        })
        .collect()
}

pub fn node_ids(args: &ClusterArgs) -> Vec<NodeId> {
    (1..=args.nodes).map(NodeId).collect()
}

/// DLT and DMT for `args`, rotated by `shift` positions.
pub fn tables(args: &ClusterArgs, version: TableVersion, shift: usize) -> anyhow::Result<(Dlt, Dmt)> {
    ensure!(args.nodes > 0, "a cluster needs at least one node");
    let nodes = node_ids(args);
    let dlt = Dlt::new(
        version,
        args.dlt_bits,
        ring_columns(&nodes, 1usize << args.dlt_bits.min(24), args.replicas, shift),
    )?;
    let dmt = Dmt::new(version, ring_columns(&nodes, nodes.len(), args.replicas, shift))?;
    Ok((dlt, dmt))
}

pub struct Cluster {
    pub fabric: Arc<LocalFabric>,
    pub am: Arc<AccessManager>,
}

pub fn start_cluster(config: GatewayConfig, args: &ClusterArgs) -> anyhow::Result<Cluster> {
    let (dlt, dmt) = tables(args, TableVersion(1), 0)?;
    let fabric = Arc::new(LocalFabric::with_nodes(config.fabric.clone(), node_ids(args))?);
    let topology = Arc::new(TopologyService::new(dlt, dmt));
    let am = AccessManager::new(config, Arc::clone(&fabric) as Arc<dyn Transport>, topology)?;
    Ok(Cluster {
        fabric,
        am: Arc::new(am),
    })
}

#[derive(Debug, Serialize)]
pub struct BlobReport {
    pub name: String,
    pub size: u64,
    pub objects: usize,
    pub verified: bool,
}

#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub nodes: u64,
    pub object_size: u32,
    pub writes: usize,
    pub bytes_written: u64,
    pub transactions: usize,
    pub dlt_version: u64,
    pub dmt_version: u64,
    pub retired: Vec<String>,
    pub elapsed_ms: u128,
    pub blobs: Vec<BlobReport>,
}

impl DemoReport {
    pub fn all_verified(&self) -> bool {
        self.blobs.iter().all(|b| b.verified)
    }
}

/// What one writer did, and the contents its blob should now have.
struct WriterResult {
    name: String,
    model: Vec<u8>,
    writes: usize,
    bytes: u64,
}

fn apply(model: &mut Vec<u8>, offset: usize, data: &[u8], mode: WriteMode) {
    let end = offset + data.len();
    if model.len() < end {
        model.resize(end, 0);
    }
    model[offset..end].copy_from_slice(data);
    if mode == WriteMode::Truncate {
        model.truncate(end);
    }
}

async fn run_writer(am: Arc<AccessManager>, writer: usize, args: DemoArgs) -> anyhow::Result<WriterResult> {
    let name = format!("demo-{writer:02}");
    let key = BlobKey::new(DEMO_VOLUME, name.clone());
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(writer as u64));
    let span = args.max_write.max(1) * 4;
    let mut model = Vec::new();
    let mut bytes = 0u64;

    for round in 0..args.writes {
        let len = rng.gen_range(1..=args.max_write.max(1));
        let offset = rng.gen_range(0..span);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        // Every eighth write truncates, the rest overwrite.
        let mode = if round % 8 == 7 { WriteMode::Truncate } else { WriteMode::Overwrite };
        am.put_blob(&key, None, offset as u64, Bytes::from(data.clone()), mode)
            .await
            .with_context(|| format!("write {round} to {key}"))?;
        apply(&mut model, offset, &data, mode);
        bytes += len as u64;
    }

    // Finish with a transactional header rewrite.
    let tx = am.start_blob_tx(&key).await?;
    let header = format!("writer {writer} done").into_bytes();
    am.put_blob(&key, Some(tx), 0, Bytes::from(header.clone()), WriteMode::Overwrite)
        .await?;
    let size = am.commit_blob_tx(tx).await?;
    apply(&mut model, 0, &header, WriteMode::Overwrite);
    ensure!(
        size == model.len() as u64,
        "{key}: committed size {size}, expected {}",
        model.len()
    );

    Ok(WriterResult {
        name,
        model,
        writes: args.writes + 1,
        bytes: bytes + header.len() as u64,
    })
}

/// Run concurrent writers against a fresh cluster and read every blob back.
pub async fn run_demo(mut config: GatewayConfig, args: DemoArgs) -> anyhow::Result<DemoReport> {
    if let Some(object_size) = args.object_size {
        config.object_size = object_size;
    }
    config.validate()?;
    let object_size = config.object_size;
    let cluster = start_cluster(config, &args.cluster)?;
    let am = Arc::clone(&cluster.am);
    am.attach_volume(am.volume_descriptor(DEMO_VOLUME, "demo")).await?;

    let started = Instant::now();
    let mut writers = JoinSet::new();
    for writer in 0..args.writers {
        writers.spawn(run_writer(Arc::clone(&am), writer, args.clone()));
    }

    let mut retired = Vec::new();
    if args.rebalance || args.fail_node.is_some() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if let Some(node) = args.fail_node {
        info!(node, "taking node down");
        cluster.fabric.set_down(NodeId(node), true);
    }
    if args.rebalance {
        let (dlt, dmt) = tables(&args.cluster, TableVersion(2), 1)?;
        let dlt_retired = am.install_dlt(dlt)?;
        let dmt_retired = am.install_dmt(dmt)?;
        for (table, receiver) in [("DLT", dlt_retired), ("DMT", dmt_retired)] {
            let version = tokio::time::timeout(Duration::from_secs(30), receiver)
                .await
                .with_context(|| format!("{table} v1 never drained"))??;
            retired.push(format!("{table} {version}"));
        }
    }

    let mut results = Vec::new();
    while let Some(joined) = writers.join_next().await {
        results.push(joined??);
    }
    results.sort_by(|a, b| a.name.cmp(&b.name));

    let mut blobs = Vec::new();
    for result in &results {
        let key = BlobKey::new(DEMO_VOLUME, result.name.clone());
        let stored = am.get_blob(&key, None, 0, u64::MAX).await?;
        let stat = am.stat_blob(&key).await?;
        blobs.push(BlobReport {
            name: result.name.clone(),
            size: stat.size,
            objects: stat.objects,
            verified: stored[..] == result.model[..],
        });
    }

    let topology = am.topology();
    Ok(DemoReport {
        nodes: args.cluster.nodes,
        object_size,
        writes: results.iter().map(|r| r.writes).sum(),
        bytes_written: results.iter().map(|r| r.bytes).sum(),
        transactions: results.len(),
        dlt_version: topology.dlt_version().0,
        dmt_version: topology.dmt_version().0,
        retired,
        elapsed_ms: started.elapsed().as_millis(),
        blobs,
    })
}

/// Fail unless every blob read back as written.
pub fn check_report(report: &DemoReport) -> anyhow::Result<()> {
    if !report.all_verified() {
        let bad: Vec<_> = report
            .blobs
            .iter()
            .filter(|b| !b.verified)
            .map(|b| b.name.as_str())
            .collect();
        bail!("read-back mismatch on {}", bad.join(", "));
    }
    Ok(())
}
