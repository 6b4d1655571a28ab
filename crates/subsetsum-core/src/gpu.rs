//! GPU workers built on wgpu.
//!
//! Both methods stream packet batches from the ring into a device buffer and
//! run a compute kernel per batch, double-buffered: while one batch executes,
//! the previous batch's found-list is read back, verified host-side and its
//! buffers are refilled. 64-bit sums are emulated as `vec2<u32>` lanes in
//! WGSL (stable WGSL has no 64-bit integers); `--use64BitCL` requests a
//! native-i64 naive kernel when the adapter exposes `SHADER_INT64`.
//!
//! When the node-hash tables exceed the device's binding limits the hash is
//! partitioned into `2^g` groups by the top `g` key bits: packets are
//! batched into a host replay buffer and the kernel runs once per group with
//! the group's hash and list sub-ranges re-uploaded in between.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::config::{Method, SolverConfig};
use crate::controller::{Controller, Engine, HashEngine};
use crate::direct::DirectPop;
use crate::error::{Error, Result};
use crate::node_hash::NodeHash;
use crate::preprocess::HashLayout;
use crate::producer::NodeSubset;
use crate::worker::{check_and_send_hash, check_and_send_naive};

const WORKGROUP_SIZE: u32 = 256;
/// Batches buffered per big-hash round before the groups replay them.
const BIG_HASH_ROUNDS: usize = 128;

/// One selectable accelerator.
pub struct GpuDevice {
    adapter: wgpu::Adapter,
    /// Human-readable adapter name.
    pub name: String,
}

/// Enumerates adapters matching the CLI accelerator flags: GPU-type devices
/// for `--useGPU`/`--useOnlyGPU`, the first CPU-type device for
/// `--useOnlyCPUCL`, nothing otherwise.
#[must_use]
pub fn select_devices(use_gpu: bool, only_gpu: bool, only_cpu_device: bool) -> Vec<GpuDevice> {
    if !use_gpu && !only_gpu && !only_cpu_device {
        return Vec::new();
    }
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let mut devices = Vec::new();
    let mut used_cpu = false;
    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        let info = adapter.get_info();
        let take = if only_cpu_device {
            // ignore CPU-type devices after the first
            let is_first_cpu = info.device_type == wgpu::DeviceType::Cpu && !used_cpu;
            used_cpu |= is_first_cpu;
            is_first_cpu
        } else {
            matches!(
                info.device_type,
                wgpu::DeviceType::DiscreteGpu
                    | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu
            )
        };
        if take {
            devices.push(GpuDevice {
                adapter,
                name: format!("{} ({:?})", info.name, info.backend),
            });
        }
    }
    if devices.is_empty() {
        tracing::warn!("no matching accelerator devices found");
    }
    devices
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct HashParams {
    count: u32,
    hash_bits: u32,
    group_start: u32,
    group_size: u32,
    list_base: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct NaiveParams {
    count: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
struct HashFound {
    work_index: u32,
    bits: [u32; 8],
}

#[repr(C)]
#[derive(Clone, Copy, Default, Pod, Zeroable)]
struct NaiveFound {
    work_index: u32,
    bits: u32,
}

/// Shared WGSL helpers: 64-bit add and the folding hash over split lanes.
const WGSL_INT64_HELPERS: &str = "
fn add64(a: vec2<u32>, b: vec2<u32>) -> vec2<u32> {
    let lo = a.x + b.x;
    var hi = a.y + b.y;
    if (lo < a.x) {
        hi = hi + 1u;
    }
    return vec2<u32>(lo, hi);
}

fn fold_key(sum: vec2<u32>, h: u32) -> u32 {
    let hmask = (1u << h) - 1u;
    let t1 = (sum.x >> h) | (sum.y << (32u - h));
    let t2 = t1 >> h;
    let t3 = t2 >> h;
    let t4 = t3 >> h;
    return (sum.x ^ t1 ^ t2 ^ t3 ^ t4) & hmask;
}
";

/// Hash-method kernel. `{PROBE}` is replaced by the bucket scan (sum-list or
/// subset-reconstruction flavour); `{LOAD_CHANGES}` optionally stages the
/// prefix deltas in workgroup memory (the grouped variant).
const WGSL_HASH_TEMPLATE: &str = "
struct Params {
    count: u32,
    hash_bits: u32,
    group_start: u32,
    group_size: u32,
    list_base: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

struct Found {
    work_index: u32,
    bits: array<u32, 8>,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> sum_changes: array<vec2<u32>, 256>;
@group(0) @binding(2) var<storage, read> hash_entries: array<vec2<u32>>;
@group(0) @binding(3) var<storage, read> hash_lists: array<{LIST_TYPE}>;
@group(0) @binding(4) var<storage, read> subsums: array<vec2<u32>>;
@group(0) @binding(5) var<storage, read> work: array<vec2<u32>>;
@group(0) @binding(6) var<storage, read_write> found_count: atomic<u32>;
@group(0) @binding(7) var<storage, read_write> founds: array<Found>;

{HELPERS}
{SHARED_DECL}

@compute @workgroup_size(256)
fn hash_search(@builtin(global_invocation_id) id: vec3<u32>,
               @builtin(local_invocation_index) local_index: u32) {
    {LOAD_CHANGES}
    let idx = id.x;
    if (idx >= params.count) {
        return;
    }
    let base = work[idx];
    var bits = array<u32, 8>(0u, 0u, 0u, 0u, 0u, 0u, 0u, 0u);
    var any_hit = false;
    for (var c = 0u; c < 256u; c = c + 1u) {
        let sum = add64(base, {CHANGES}[c]);
        let key = fold_key(sum, params.hash_bits);
        let local_key = key - params.group_start;
        if (local_key >= params.group_size) {
            continue;
        }
        let entry = hash_entries[local_key];
        let size = entry.y;
        if (size == 0u) {
            continue;
        }
        let start = entry.x - params.list_base;
        var found = false;
        for (var j = 0u; j < size; j = j + 1u) {
            {PROBE}
        }
        if (found) {
            bits[c >> 5u] = bits[c >> 5u] | (1u << (c & 31u));
            any_hit = true;
        }
    }
    if (any_hit) {
        let slot = atomicAdd(&found_count, 1u);
        founds[slot].work_index = idx;
        founds[slot].bits = bits;
    }
}
";

const WGSL_PROBE_SUMS: &str = "
            let stored = hash_lists[start + j];
            if (stored.x == sum.x && stored.y == sum.y) {
                found = true;
                break;
            }
";

/// Subset-mode probe: rebuild the stored 64-bit residual from the 8-bit
/// chunk tables. `{CHUNK_ADDS}` is generated for the 1..=4 chunks in use.
const WGSL_PROBE_SUBSETS: &str = "
            let hsubset = hash_lists[start + j];
            var stored = subsums[hsubset & 0xffu];
            {CHUNK_ADDS}
            if (stored.x == sum.x && stored.y == sum.y) {
                found = true;
                break;
            }
";

/// Naive-method kernel, 64-bit emulated: 32 prefixes x 512-step Gray walk.
/// Table layout: entries 0..32 are prefix deltas, 32..41 the walk deltas.
const WGSL_NAIVE: &str = "
struct Params {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

struct Found {
    work_index: u32,
    bits: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> sum_changes: array<vec2<u32>, 41>;
@group(0) @binding(2) var<storage, read> work: array<vec2<u32>>;
@group(0) @binding(3) var<storage, read_write> found_count: atomic<u32>;
@group(0) @binding(4) var<storage, read_write> founds: array<Found>;

fn add64(a: vec2<u32>, b: vec2<u32>) -> vec2<u32> {
    let lo = a.x + b.x;
    var hi = a.y + b.y;
    if (lo < a.x) {
        hi = hi + 1u;
    }
    return vec2<u32>(lo, hi);
}

@compute @workgroup_size(256)
fn naive_search(@builtin(global_invocation_id) id: vec3<u32>) {
    let idx = id.x;
    if (idx >= params.count) {
        return;
    }
    let input = work[idx];
    var bits = 0u;
    for (var c = 0u; c < 32u; c = c + 1u) {
        var sum = add64(input, sum_changes[c]);
        var hit = (sum.x | sum.y) == 0u;
        for (var s = 1u; s < 512u; s = s + 1u) {
            sum = add64(sum, sum_changes[32u + firstTrailingBit(s)]);
            hit = hit || ((sum.x | sum.y) == 0u);
        }
        if (hit) {
            bits = bits | (1u << c);
        }
    }
    if (bits != 0u) {
        let slot = atomicAdd(&found_count, 1u);
        founds[slot].work_index = idx;
        founds[slot].bits = bits;
    }
}
";

/// Naive kernel on native 64-bit integers (`SHADER_INT64`).
const WGSL_NAIVE_I64: &str = "
struct Params {
    count: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

struct Found {
    work_index: u32,
    bits: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> sum_changes: array<i64, 41>;
@group(0) @binding(2) var<storage, read> work: array<i64>;
@group(0) @binding(3) var<storage, read_write> found_count: atomic<u32>;
@group(0) @binding(4) var<storage, read_write> founds: array<Found>;

@compute @workgroup_size(256)
fn naive_search(@builtin(global_invocation_id) id: vec3<u32>) {
    let idx = id.x;
    if (idx >= params.count) {
        return;
    }
    let input = work[idx];
    var bits = 0u;
    for (var c = 0u; c < 32u; c = c + 1u) {
        var sum = input + sum_changes[c];
        var hit = sum == 0li;
        for (var s = 1u; s < 512u; s = s + 1u) {
            sum = sum + sum_changes[32u + firstTrailingBit(s)];
            hit = hit || (sum == 0li);
        }
        if (hit) {
            bits = bits | (1u << c);
        }
    }
    if (bits != 0u) {
        let slot = atomicAdd(&found_count, 1u);
        founds[slot].work_index = idx;
        founds[slot].bits = bits;
    }
}
";

fn assemble_hash_shader(use_subsets: bool, chunks: u32, grouped: bool) -> String {
    let probe = if use_subsets {
        let mut chunk_adds = String::new();
        for t in 1..chunks {
            chunk_adds.push_str(&format!(
                "stored = add64(stored, subsums[{}u + ((hsubset >> {}u) & 0xffu)]);\n            ",
                t * 256,
                t * 8
            ));
        }
        WGSL_PROBE_SUBSETS.replace("{CHUNK_ADDS}", &chunk_adds)
    } else {
        WGSL_PROBE_SUMS.to_string()
    };
    let list_type = if use_subsets { "u32" } else { "vec2<u32>" };
    let (shared_decl, load_changes, changes) = if grouped {
        (
            "var<workgroup> wg_changes: array<vec2<u32>, 256>;",
            "wg_changes[local_index] = sum_changes[local_index];\n    workgroupBarrier();",
            "wg_changes",
        )
    } else {
        ("", "_ = local_index;", "sum_changes")
    };
    WGSL_HASH_TEMPLATE
        .replace("{HELPERS}", WGSL_INT64_HELPERS)
        .replace("{LIST_TYPE}", list_type)
        .replace("{PROBE}", &probe)
        .replace("{SHARED_DECL}", shared_decl)
        .replace("{LOAD_CHANGES}", load_changes)
        .replace("{CHANGES}", changes)
}

/// i64 slice as (lo, hi) u32 lane pairs; little-endian layout matches
/// `vec2<u32>` directly.
fn as_lane_bytes(values: &[i64]) -> &[u8] {
    bytemuck::cast_slice(values)
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuContext {
    fn request(adapter: &wgpu::Adapter, features: wgpu::Features) -> Result<Self> {
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("subsetsum worker"),
                required_features: features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| Error::Gpu(format!("cannot acquire device: {e}")))?;
        Ok(Self { device, queue })
    }

    /// Blocks until `buffer` is mapped, then hands the mapped range to `f`.
    fn read_mapped<R>(
        &self,
        buffer: &wgpu::Buffer,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        if rx.recv().ok().and_then(std::result::Result::ok).is_none() {
            return Err(Error::Gpu("map-async readback failed".to_string()));
        }
        let data = slice.get_mapped_range();
        let out = f(&data);
        drop(data);
        buffer.unmap();
        Ok(out)
    }
}

/// One double-buffer side: a work buffer, its found-list pair and the
/// packets staged for host-side verification.
struct Batch {
    work: wgpu::Buffer,
    found: wgpu::Buffer,
    found_count: wgpu::Buffer,
    staging_found: wgpu::Buffer,
    staging_count: wgpu::Buffer,
    nodes: Vec<NodeSubset>,
    count: usize,
}

impl Batch {
    fn new(device: &wgpu::Device, work_size: usize, found_elem: usize) -> Self {
        let mk = |label, size, usage| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size as u64,
                usage,
                mapped_at_creation: false,
            })
        };
        Self {
            work: mk(
                "work buffer",
                work_size * 8,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            ),
            found: mk(
                "found buffer",
                work_size * found_elem,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            ),
            found_count: mk(
                "found count",
                4,
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            ),
            staging_found: mk(
                "found staging",
                work_size * found_elem,
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            ),
            staging_count: mk(
                "count staging",
                4,
                wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            ),
            nodes: Vec::with_capacity(work_size),
            count: 0,
        }
    }

    /// Uploads the batch sums and resets the device-side found counter. The
    /// little-endian i64 layout matches the kernel's `vec2<u32>` lanes (and
    /// the native-i64 variant) byte for byte.
    fn upload(&self, ctx: &GpuContext) {
        let sums: Vec<i64> = self.nodes.iter().map(|n| n.sum).collect();
        ctx.queue.write_buffer(&self.work, 0, as_lane_bytes(&sums));
        ctx.queue
            .write_buffer(&self.found_count, 0, bytemuck::bytes_of(&0u32));
    }

    /// Dispatches the kernel over this batch and schedules the found-list
    /// copy-out in the same submission.
    fn dispatch(
        &self,
        ctx: &GpuContext,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        found_elem: usize,
    ) {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("batch encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("search pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups((self.count as u32).div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.found_count, 0, &self.staging_count, 0, 4);
        encoder.copy_buffer_to_buffer(
            &self.found,
            0,
            &self.staging_found,
            0,
            (self.count * found_elem) as u64,
        );
        ctx.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Reads back the found list of the last dispatch.
    fn read_found<F: Pod + Default>(&self, ctx: &GpuContext) -> Result<Vec<F>> {
        let found_num =
            ctx.read_mapped(&self.staging_count, |data| {
                u32::from_le_bytes([data[0], data[1], data[2], data[3]])
            })? as usize;
        if found_num == 0 {
            return Ok(Vec::new());
        }
        ctx.read_mapped(&self.staging_found, |data| {
            let elem = std::mem::size_of::<F>();
            data[..found_num * elem]
                .chunks_exact(elem)
                .map(|chunk| *bytemuck::from_bytes(chunk))
                .collect()
        })
    }
}

/// A hash-method accelerator worker.
struct HashGpuWorker {
    ctx: GpuContext,
    pipeline: wgpu::ComputePipeline,
    params: wgpu::Buffer,
    hash_entries: wgpu::Buffer,
    hash_lists: wgpu::Buffer,
    batches: [Batch; 2],
    bind_groups: [wgpu::BindGroup; 2],
    work_size: usize,
    hash_bits: u32,
    group_bits: u32,
    /// Linearised-list boundaries of each hash group.
    group_list_bounds: Vec<u32>,
    use_subsets: bool,
}

/// Storage-heavy layouts keep every binding declared even when a mode leaves
/// one unused (auto layout would drop it and reject the bind group).
fn hash_bind_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("hash search layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            storage(1, true),
            storage(2, true),
            storage(3, true),
            storage(4, true),
            storage(5, true),
            storage(6, false),
            storage(7, false),
        ],
    })
}

/// Repacks bucket heads as (pos, size) u32 pairs for the device.
fn pack_entries(hash: &NodeHash, range: std::ops::Range<usize>) -> Vec<u32> {
    let mut out = Vec::with_capacity(range.len() * 2);
    for entry in &hash.entries[range] {
        out.push(entry.pos());
        out.push(u32::from(entry.size));
    }
    out
}

impl HashGpuWorker {
    fn new(device: GpuDevice, engine: &HashEngine, config: &SolverConfig) -> Result<Self> {
        let layout = engine
            .layout
            .as_ref()
            .expect("gpu workers are only built for problems of >16 numbers");
        let hash = engine.node_hash.as_ref().ok_or(Error::NodeHashMissing)?;
        let hash_bits = layout.node_hash_bits;
        if hash_bits >= 32 {
            return Err(Error::Gpu("device kernels support at most 31 hash bits".into()));
        }

        let ctx = GpuContext::request(&device.adapter, wgpu::Features::empty())?;
        let limits = ctx.device.limits();
        let max_binding = limits.max_storage_buffer_binding_size as u64;

        let entry_bytes = (hash.entries.len() * 8) as u64;
        let list_elem = if engine.use_subsets { 4u64 } else { 8u64 };
        let list_bytes = hash.subsets.len() as u64 * list_elem;
        let mut group_bits = 0u32;
        while (entry_bytes >> group_bits) > max_binding || (list_bytes >> group_bits) > max_binding
        {
            group_bits += 1;
            if group_bits > 4 {
                return Err(Error::HashPartitionTooLarge);
            }
        }

        let work_size = match device.adapter.get_info().device_type {
            wgpu::DeviceType::Cpu => 2048usize,
            _ => 65536usize,
        };

        let chunks = (layout.node_hashed_numbers + 7) / 8;
        let shader_src = assemble_hash_shader(engine.use_subsets, chunks, config.hash_grouping);
        let module = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("hash search shader"),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });
        let bind_layout = hash_bind_layout(&ctx.device);
        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("hash search pipeline layout"),
                bind_group_layouts: &[&bind_layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("hash search pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("hash_search"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        let params = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("params"),
            size: std::mem::size_of::<HashParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let sum_changes = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("sum changes"),
                contents: as_lane_bytes(&layout.sum_changes[..]),
                usage: wgpu::BufferUsages::STORAGE,
            });

        // compute per-group list boundaries; one group covers everything
        // when no partitioning is needed
        let groups = 1usize << group_bits;
        let group_size = hash.entries.len() / groups;
        let mut group_list_bounds = vec![0u32; groups + 1];
        for grp in 0..groups {
            group_list_bounds[grp + 1] = group_list_bounds[grp];
            for key in (grp * group_size..(grp + 1) * group_size).rev() {
                let entry = hash.entries[key];
                if entry.size != 0 {
                    group_list_bounds[grp + 1] = entry.pos() + u32::from(entry.size);
                    break;
                }
            }
        }
        let max_group_list = (0..groups)
            .map(|g| (group_list_bounds[g + 1] - group_list_bounds[g]) as usize)
            .max()
            .unwrap_or(0)
            .max(1);

        let (entry_capacity, list_capacity) = if group_bits == 0 {
            (hash.entries.len(), hash.subsets.len().max(1))
        } else {
            (group_size, max_group_list)
        };
        let hash_entries = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hash entries"),
            size: (entry_capacity * 8) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let hash_lists = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("hash lists"),
            size: list_capacity as u64 * list_elem,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let subsums = match (engine.use_subsets, engine.worker_subsums.as_ref()) {
            (true, Some(tables)) => {
                ctx.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("subsum tables"),
                        contents: as_lane_bytes(tables.raw()),
                        usage: wgpu::BufferUsages::STORAGE,
                    })
            }
            _ => ctx
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("subsum tables (unused)"),
                    contents: &[0u8; 8],
                    usage: wgpu::BufferUsages::STORAGE,
                }),
        };

        let found_elem = std::mem::size_of::<HashFound>();
        let batches = [
            Batch::new(&ctx.device, work_size, found_elem),
            Batch::new(&ctx.device, work_size, found_elem),
        ];
        let bind_groups = std::array::from_fn(|i| {
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("hash bind group"),
                layout: &bind_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: sum_changes.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: hash_entries.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: hash_lists.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: subsums.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: batches[i].work.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: batches[i].found_count.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 7,
                        resource: batches[i].found.as_entire_binding(),
                    },
                ],
            })
        });

        tracing::info!(
            device = %device.name,
            work_size,
            group_bits,
            grouped_kernel = config.hash_grouping,
            "hash accelerator worker"
        );

        Ok(Self {
            ctx,
            pipeline,
            params,
            hash_entries,
            hash_lists,
            batches,
            bind_groups,
            work_size,
            hash_bits,
            group_bits,
            group_list_bounds,
            use_subsets: engine.use_subsets,
        })
    }

    fn queue_share(&self) -> usize {
        if self.group_bits == 0 {
            self.work_size
        } else {
            self.work_size * (BIG_HASH_ROUNDS >> 2)
        }
    }

    /// Uploads one hash group's entry and list sub-ranges and points the
    /// kernel parameters at it.
    fn select_group(&self, hash: &NodeHash, group: usize) {
        let groups = 1usize << self.group_bits;
        let group_size = hash.entries.len() / groups;
        let start = group * group_size;
        let packed = pack_entries(hash, start..start + group_size);
        self.ctx
            .queue
            .write_buffer(&self.hash_entries, 0, bytemuck::cast_slice(&packed));
        let list_start = self.group_list_bounds[group] as usize;
        let list_end = self.group_list_bounds[group + 1] as usize;
        if list_end > list_start {
            if self.use_subsets {
                self.ctx.queue.write_buffer(
                    &self.hash_lists,
                    0,
                    bytemuck::cast_slice(&hash.subsets[list_start..list_end]),
                );
            } else if let Some(lists) = &hash.lists {
                self.ctx.queue.write_buffer(
                    &self.hash_lists,
                    0,
                    as_lane_bytes(&lists[list_start..list_end]),
                );
            }
        }
        self.write_params(0, start as u32, group_size as u32, list_start as u32);
    }

    fn write_params(&self, count: u32, group_start: u32, group_size: u32, list_base: u32) {
        let params = HashParams {
            count,
            hash_bits: self.hash_bits,
            group_start,
            group_size,
            list_base,
            _pad: [0; 3],
        };
        self.ctx
            .queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
    }

    /// Double-buffered batch loop: `refill` fills a batch's packet vector
    /// and returns false when the stream is exhausted; hits are verified
    /// host-side through the same path as the CPU worker.
    fn run_batches(
        &mut self,
        ctl: &Controller,
        layout: &HashLayout,
        hash: &NodeHash,
        count_progress: bool,
        mut refill: impl FnMut(&mut Vec<NodeSubset>),
    ) -> Result<()> {
        let found_elem = std::mem::size_of::<HashFound>();
        let mut active: usize = 0;
        let mut in_flight = [false, false];

        loop {
            {
                let batch = &mut self.batches[active];
                refill(&mut batch.nodes);
                batch.count = batch.nodes.len();
            }
            if self.batches[active].count != 0 {
                self.write_params_count(self.batches[active].count as u32);
                self.batches[active].upload(&self.ctx);
                self.batches[active].dispatch(
                    &self.ctx,
                    &self.pipeline,
                    &self.bind_groups[active],
                    found_elem,
                );
                in_flight[active] = true;
            }

            let other = active ^ 1;
            if in_flight[other] {
                let founds: Vec<HashFound> = self.batches[other].read_found(&self.ctx)?;
                let nodes = &self.batches[other].nodes;
                for found in &founds {
                    let node = &nodes[found.work_index as usize];
                    for (word, &bits) in found.bits.iter().enumerate() {
                        if bits == 0 {
                            continue;
                        }
                        for bit in 0..32 {
                            if bits & (1u32 << bit) != 0 {
                                check_and_send_hash(
                                    ctl,
                                    layout,
                                    hash,
                                    node.subset_bits(),
                                    (word * 32 + bit) as u32,
                                );
                            }
                        }
                    }
                }
                if count_progress {
                    let count = self.batches[other].count;
                    if let Some(last) = self.batches[other].nodes.last() {
                        ctl.update_progress(count as u64, last.subset_bits());
                    }
                }
                in_flight[other] = false;
            }

            if self.batches[active].count == 0 && !in_flight[active] && !in_flight[other] {
                break;
            }
            active = other;
        }
        Ok(())
    }

    /// Rewrites only the invocation count, keeping the group fields.
    fn write_params_count(&self, count: u32) {
        self.ctx
            .queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(&count));
    }

    fn run(&mut self, ctl: &Controller, layout: &HashLayout, hash: &NodeHash) -> Result<()> {
        if self.group_bits == 0 {
            self.select_group(hash, 0);
            let queue = ctl.mem_queue();
            let mut popper = DirectPop::new(queue, self.work_size);
            let work_size = self.work_size;
            return self.run_batches(ctl, layout, hash, true, |nodes| {
                nodes.clear();
                while nodes.len() < work_size {
                    match popper.pop() {
                        Some(node) => nodes.push(node),
                        None => break,
                    }
                }
            });
        }
        self.run_big_hash(ctl, layout, hash)
    }

    /// Partitioned-hash loop: batch up to `BIG_HASH_ROUNDS` ring batches
    /// into a replay buffer, then run every hash group over the replay with
    /// its sub-tables re-uploaded in between.
    fn run_big_hash(&mut self, ctl: &Controller, layout: &HashLayout, hash: &NodeHash) -> Result<()> {
        let groups = 1usize << self.group_bits;
        let capacity = self.work_size * BIG_HASH_ROUNDS;
        let mut replay: Vec<NodeSubset> = Vec::with_capacity(capacity);

        loop {
            replay.clear();
            {
                let queue = ctl.mem_queue();
                let mut popper = DirectPop::new(queue, self.work_size);
                while replay.len() < capacity {
                    match popper.pop() {
                        Some(node) => replay.push(node),
                        None => break,
                    }
                }
            }
            if replay.is_empty() {
                return Ok(());
            }

            for group in 0..groups {
                self.select_group(hash, group);
                let mut offset = 0usize;
                let work_size = self.work_size;
                let replay_ref = &replay;
                self.run_batches(ctl, layout, hash, false, move |nodes| {
                    nodes.clear();
                    let end = (offset + work_size).min(replay_ref.len());
                    nodes.extend_from_slice(&replay_ref[offset..end]);
                    offset = end;
                })?;
            }
            if let Some(last) = replay.last() {
                ctl.update_progress(replay.len() as u64, last.subset_bits());
            }
            if replay.len() < capacity {
                return Ok(());
            }
        }
    }
}

/// A naive-method accelerator worker.
struct NaiveGpuWorker {
    ctx: GpuContext,
    pipeline: wgpu::ComputePipeline,
    params: wgpu::Buffer,
    batches: [Batch; 2],
    bind_groups: [wgpu::BindGroup; 2],
    work_size: usize,
}

impl NaiveGpuWorker {
    fn new(device: GpuDevice, sum_changes: &[i64; 41], config: &SolverConfig) -> Result<Self> {
        let want_i64 = config.use_64bit_device;
        let native_i64 = if want_i64 {
            let supported = device
                .adapter
                .features()
                .contains(wgpu::Features::SHADER_INT64);
            if !supported {
                tracing::warn!("adapter lacks SHADER_INT64; using the emulated 64-bit kernel");
            }
            supported
        } else {
            false
        };
        let features = if native_i64 {
            wgpu::Features::SHADER_INT64
        } else {
            wgpu::Features::empty()
        };
        let ctx = GpuContext::request(&device.adapter, features)?;

        let work_size = match device.adapter.get_info().device_type {
            wgpu::DeviceType::Cpu => 2048usize,
            _ => 65536usize,
        };

        // entries 0..32 stay prefix sums; 32..41 become the Gray deltas so
        // the kernel adds without deriving
        let mut table = *sum_changes;
        let mut running = table[32];
        for k in 1..9 {
            let delta = sum_changes[32 + k].wrapping_sub(running);
            running = running.wrapping_add(sum_changes[32 + k]);
            table[32 + k] = delta;
        }

        let module = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("naive search shader"),
                source: wgpu::ShaderSource::Wgsl(
                    if native_i64 { WGSL_NAIVE_I64 } else { WGSL_NAIVE }.into(),
                ),
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("naive search pipeline"),
                layout: None,
                module: &module,
                entry_point: Some("naive_search"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        let params = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("params"),
            size: std::mem::size_of::<NaiveParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let changes_buf = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("sum changes"),
                contents: as_lane_bytes(&table[..]),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let found_elem = std::mem::size_of::<NaiveFound>();
        let batches = [
            Batch::new(&ctx.device, work_size, found_elem),
            Batch::new(&ctx.device, work_size, found_elem),
        ];
        // every binding is used by the naive kernel, so the auto layout fits
        let bind_layout = pipeline.get_bind_group_layout(0);
        let bind_groups = std::array::from_fn(|i| {
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("naive bind group"),
                layout: &bind_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: changes_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: batches[i].work.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: batches[i].found_count.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: batches[i].found.as_entire_binding(),
                    },
                ],
            })
        });

        tracing::info!(device = %device.name, work_size, native_i64, "naive accelerator worker");

        Ok(Self {
            ctx,
            pipeline,
            params,
            batches,
            bind_groups,
            work_size,
        })
    }

    fn run(&mut self, ctl: &Controller) -> Result<()> {
        let found_elem = std::mem::size_of::<NaiveFound>();
        let queue = ctl.mem_queue();
        let work_size = self.work_size;
        let mut popper = DirectPop::new(queue, work_size);
        let mut active = 0usize;
        let mut in_flight = [false, false];

        loop {
            {
                let batch = &mut self.batches[active];
                batch.nodes.clear();
                while batch.nodes.len() < work_size {
                    match popper.pop() {
                        Some(node) => batch.nodes.push(node),
                        None => break,
                    }
                }
                batch.count = batch.nodes.len();
            }
            if self.batches[active].count != 0 {
                let params = NaiveParams {
                    count: self.batches[active].count as u32,
                    _pad: [0; 3],
                };
                self.ctx
                    .queue
                    .write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
                self.batches[active].upload(&self.ctx);
                self.batches[active].dispatch(
                    &self.ctx,
                    &self.pipeline,
                    &self.bind_groups[active],
                    found_elem,
                );
                in_flight[active] = true;
            }

            let other = active ^ 1;
            if in_flight[other] {
                let founds: Vec<NaiveFound> = self.batches[other].read_found(&self.ctx)?;
                let nodes = &self.batches[other].nodes;
                for found in &founds {
                    let node = &nodes[found.work_index as usize];
                    for bit in 0..32u32 {
                        if found.bits & (1u32 << bit) != 0 {
                            check_and_send_naive(ctl, node.subset_bits(), bit);
                        }
                    }
                }
                let count = self.batches[other].count;
                if let Some(last) = self.batches[other].nodes.last() {
                    ctl.update_progress(count as u64, last.subset_bits());
                }
                in_flight[other] = false;
            }

            if self.batches[active].count == 0 && !in_flight[active] && !in_flight[active ^ 1] {
                break;
            }
            active = other;
        }
        Ok(())
    }
}

enum WorkerKind {
    Naive(NaiveGpuWorker),
    Hash(HashGpuWorker),
}

/// One accelerator worker, method-matched to the controller.
pub struct GpuSearchWorker {
    kind: WorkerKind,
}

impl GpuSearchWorker {
    /// Builds the device pipelines and buffers for one adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpu`] for device/pipeline failures and
    /// [`Error::HashPartitionTooLarge`] when even a 16-way split of the hash
    /// tables does not fit the device.
    pub fn new(device: GpuDevice, ctl: &Controller, config: &SolverConfig) -> Result<Self> {
        let kind = match (config.method, ctl.engine()) {
            (Method::Naive, _) => WorkerKind::Naive(NaiveGpuWorker::new(
                device,
                ctl.naive_sum_changes(),
                config,
            )?),
            (Method::Hash, Engine::Hash(engine)) => {
                WorkerKind::Hash(HashGpuWorker::new(device, engine, config)?)
            }
            (Method::Hash, Engine::Naive(_)) => {
                unreachable!("hash config requires a hash controller")
            }
        };
        Ok(Self { kind })
    }

    /// This worker's contribution to the ring sizing.
    #[must_use]
    pub fn queue_share(&self) -> usize {
        match &self.kind {
            WorkerKind::Naive(worker) => worker.work_size,
            WorkerKind::Hash(worker) => worker.queue_share(),
        }
    }

    /// Consumes packets until the ring drains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Gpu`] on execution or readback failures.
    pub fn run(&mut self, ctl: &Controller) -> Result<()> {
        match &mut self.kind {
            WorkerKind::Naive(worker) => worker.run(ctl),
            WorkerKind::Hash(worker) => match ctl.engine() {
                Engine::Hash(engine) => {
                    let layout = engine
                        .layout
                        .as_ref()
                        .expect("gpu workers are only built for problems of >16 numbers");
                    let hash = engine.node_hash.as_ref().ok_or(Error::NodeHashMissing)?;
                    worker.run(ctl, layout, hash)
                }
                Engine::Naive(_) => unreachable!("hash worker on a naive controller"),
            },
        }
    }
}
