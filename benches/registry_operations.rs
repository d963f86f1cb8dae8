use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hostmesh::anti_entropy;
use hostmesh::network::UpdateMsg;
use hostmesh::registry::Inventory;
use hostmesh::types::StoredHost;
use hostmesh::{
    ConnectPoint, DeviceId, Host, HostDescriptor, HostId, HostStore, HostStoreConfig, MacAddress,
    MemoryNetwork, NodeId, ProviderId, SequentialClock, Timestamp, VlanId,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn mac(i: u32) -> MacAddress {
    let [_, a, b, c] = i.to_be_bytes();
    MacAddress::new([0x02, 0, 0, a, b, c])
}

fn descriptor(i: u32, port: u64) -> HostDescriptor {
    HostDescriptor::new(
        mac(i),
        VlanId::None,
        ConnectPoint::new(DeviceId::new(format!("of:{:016x}", i % 32)), port),
    )
    .with_ip(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)))
}

/// A store with no peers, so broadcasts cost nothing.
fn lone_store() -> HostStore {
    let network = MemoryNetwork::new();
    let (transport, _inbox) = network.join(NodeId::new());
    HostStore::with_transport(
        HostStoreConfig::default(),
        Arc::new(SequentialClock::new()),
        Arc::new(transport),
    )
    .unwrap()
}

async fn populated_store(size: u32) -> HostStore {
    let store = lone_store();
    let provider = ProviderId::new("bench");
    for i in 0..size {
        let descr = descriptor(i, 1);
        store
            .create_or_update_host(&provider, &descr.host_id(), descr)
            .await
            .unwrap();
    }
    store
}

/// Benchmark: Local creates of distinct hosts
fn bench_create_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_sequential");

    for size in [100u32, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap())
                .iter(|| async move { black_box(populated_store(size).await) });
        });
    }
    group.finish();
}

/// Benchmark: Moving one host back and forth
fn bench_move_host(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = rt.block_on(populated_store(1000));
    let provider = ProviderId::new("bench");
    let host_id = HostId::new(mac(7), VlanId::None);
    let mut port = 1;

    c.bench_function("move_host", |b| {
        b.iter(|| {
            port = if port == 1 { 2 } else { 1 };
            rt.block_on(store.create_or_update_host(&provider, &host_id, descriptor(7, port)))
                .unwrap()
        })
    });
}

/// Benchmark: Applying peer updates
fn bench_apply_remote_update(c: &mut Criterion) {
    let store = lone_store();
    let provider = ProviderId::new("bench");
    let mut tick = 0u64;

    c.bench_function("apply_remote_update", |b| {
        b.iter(|| {
            tick += 1;
            let descr = descriptor((tick % 1000) as u32, tick % 4 + 1).replacing_ips();
            black_box(store.apply_remote_update(UpdateMsg {
                provider_id: provider.clone(),
                host_id: descr.host_id(),
                descriptor: descr,
                timestamp: Timestamp::new(tick, 0, 2),
            }))
        })
    });
}

/// Benchmark: Location and attribute queries
fn bench_queries(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = rt.block_on(populated_store(10000));
    let location = ConnectPoint::new(DeviceId::new(format!("of:{:016x}", 3)), 1);
    let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + 4242));

    let mut group = c.benchmark_group("query");
    group.bench_function("connected_hosts", |b| {
        b.iter(|| black_box(store.get_connected_hosts(&location)))
    });
    group.bench_function("hosts_by_ip", |b| {
        b.iter(|| black_box(store.get_hosts_by_ip(ip)))
    });
    group.bench_function("get_host", |b| {
        let host_id = HostId::new(mac(4242), VlanId::None);
        b.iter(|| black_box(store.get_host(&host_id)))
    });
    group.finish();
}

fn inventory(size: u32) -> Inventory {
    let provider = ProviderId::new("bench");
    let mut inventory = Inventory::new();
    for i in 0..size {
        let descr = descriptor(i, 1);
        let host = Host::from_descriptor(provider.clone(), descr.host_id(), &descr);
        inventory.commit(StoredHost::new(host, Timestamp::new(i as u64 + 1, 0, 1)));
    }
    inventory
}

/// Benchmark: Digest construction and reconciliation planning
fn bench_anti_entropy(c: &mut Criterion) {
    let mut group = c.benchmark_group("anti_entropy");

    for size in [100u32, 1000, 10000] {
        let local = inventory(size);
        let peer_digest = anti_entropy::build_digest(NodeId::new(), &inventory(size / 2));

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("digest", size), &local, |b, local| {
            b.iter(|| black_box(anti_entropy::build_digest(NodeId::new(), local)))
        });
        group.bench_with_input(BenchmarkId::new("plan", size), &local, |b, local| {
            b.iter(|| black_box(anti_entropy::plan(local, &peer_digest)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_create_sequential,
    bench_move_host,
    bench_apply_remote_update,
    bench_anti_entropy,
    bench_queries,
);
criterion_main!(benches);
