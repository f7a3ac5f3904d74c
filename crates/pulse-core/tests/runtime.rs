//! End-to-end tests for the context/stream/virtual-pointer core
//!
//! These run the full runtime against the emulated transport: real table
//! bookkeeping, real deferred resolution, real bytes moving through the
//! emulated device heap.

use std::sync::Arc;

use pulse_core::{
    AddrState, ContextMode, Error, FillDst, Runtime, RuntimeConfig, VirtualPtr, INDEX_CAPACITY,
};
use pulse_transport::EmulatedTransport;

fn runtime_with(devices: usize, config: RuntimeConfig) -> (Runtime, Arc<EmulatedTransport>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(EmulatedTransport::new(devices));
    let runtime = Runtime::with_config(transport.clone(), config).unwrap();
    (runtime, transport)
}

fn runtime(devices: usize) -> (Runtime, Arc<EmulatedTransport>) {
    runtime_with(devices, RuntimeConfig::default())
}

// =============================================================================
// Addressing
// =============================================================================

#[test]
fn test_pointers_embed_their_device() {
    let (rt, _) = runtime(2);
    let c0 = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let c1 = rt.ctx_create(1, ContextMode::Parallel).unwrap();

    let p0 = c0.malloc(16, 0).unwrap();
    let p1 = c1.malloc(16, 0).unwrap();
    assert_eq!(p0.device(), 0);
    assert_eq!(p1.device(), 1);
    assert_eq!(p0.offset(), 0);
    assert_ne!(p0.index(), 0, "index 0 is reserved");

    // A pointer is only meaningful on its own device.
    assert!(matches!(c0.free(p1, 0), Err(Error::InvalidDevice(1))));
}

#[test]
fn test_operations_reject_offsetted_base_pointers() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let ptr = ctx.malloc(64, 0).unwrap();
    let shifted = ptr.offset_by(8);

    assert!(matches!(ctx.free(shifted, 0), Err(Error::OffsetNotAllowed(_))));
    assert!(matches!(ctx.swap(shifted, ptr, 0), Err(Error::OffsetNotAllowed(_))));
    assert!(matches!(
        ctx.set_override(Some(shifted)),
        Err(Error::OffsetNotAllowed(_))
    ));
}

// =============================================================================
// Allocation lifecycle
// =============================================================================

#[test]
fn test_alloc_free_without_intervening_sync() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    // The allocation acknowledgment is still in flight; free must force the
    // resolution sync itself instead of corrupting the table.
    let ptr = ctx.malloc(4096, 0).unwrap();
    ctx.free(ptr, 0).unwrap();
    ctx.sync().unwrap();

    assert!(matches!(ctx.resolve(ptr), Err(Error::UnknownVptr(_))));
}

#[test]
fn test_live_indices_are_unique() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptrs: Vec<VirtualPtr> = (0..64).map(|_| ctx.malloc(8, 0).unwrap()).collect();
    let mut indices: Vec<u16> = ptrs.iter().map(|p| p.index()).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 64, "no index handed out twice while live");

    for ptr in ptrs {
        ctx.free(ptr, 0).unwrap();
    }
    ctx.sync().unwrap();
}

#[test]
fn test_table_exhaustion_is_out_of_memory() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    // Zero-sized allocations take table slots without enqueueing work.
    let mut ptrs = Vec::with_capacity(INDEX_CAPACITY as usize);
    for _ in 0..INDEX_CAPACITY {
        ptrs.push(ctx.malloc(0, 0).unwrap());
    }
    assert!(matches!(ctx.malloc(0, 0), Err(Error::OutOfMemory)));

    // Existing allocations are unaffected and can still be freed.
    ctx.free(ptrs[17], 0).unwrap();
    let reused = ctx.malloc(0, 0).unwrap();
    assert_eq!(reused.index(), ptrs[17].index());
}

#[test]
fn test_mem_used_sums_live_allocations() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let a = ctx.malloc(100, 0).unwrap();
    let b = ctx.malloc(28, 0).unwrap();
    assert_eq!(ctx.mem_used().unwrap(), 128);

    ctx.free(a, 0).unwrap();
    assert_eq!(ctx.mem_used().unwrap(), 28);
    ctx.free(b, 0).unwrap();
    assert_eq!(ctx.mem_used().unwrap(), 0);
}

#[test]
fn test_address_range_and_mem_info() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptr = ctx.malloc(512, 0).unwrap();
    let (base, size) = ctx.address_range(ptr.offset_by(100)).unwrap();
    assert_eq!(base, ptr);
    assert_eq!(size, 512);

    let (free, total) = ctx.mem_info().unwrap();
    assert_eq!(total, ctx.info().memory_size);
    assert_eq!(total - free, 512);
}

#[test]
fn test_failed_device_alloc_surfaces_as_uninitialized() {
    let (rt, transport) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    transport.fail_next_allocs(1);
    let ptr = ctx.malloc(64, 0).unwrap();

    let mut out = [0u8; 64];
    assert!(matches!(
        ctx.memcpy_d2h(&mut out, ptr, 0),
        Err(Error::UninitializedPtr(_))
    ));
}

// =============================================================================
// Copies and bounds
// =============================================================================

#[test]
fn test_copy_roundtrip() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptr = ctx.malloc(256, 0).unwrap();
    let payload: Vec<u8> = (0..=255).collect();
    ctx.memcpy_h2d(ptr, &payload, 0).unwrap();

    let mut out = vec![0u8; 256];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(out, payload);

    ctx.free(ptr, 0).unwrap();
}

#[test]
fn test_copy_honors_pointer_offsets() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptr = ctx.malloc(64, 0).unwrap();
    ctx.memcpy_h2d(ptr, &[0u8; 64], 0).unwrap();
    ctx.memcpy_h2d(ptr.offset_by(32), &[9u8; 16], 0).unwrap();

    let mut out = [0u8; 64];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(&out[..32], &[0u8; 32]);
    assert_eq!(&out[32..48], &[9u8; 16]);
    assert_eq!(&out[48..], &[0u8; 16]);
}

#[test]
fn test_out_of_bounds_copies_fail_both_directions() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let ptr = ctx.malloc(128, 0).unwrap();

    let mut big = vec![0u8; 129];
    assert!(matches!(
        ctx.memcpy_d2h(&mut big, ptr, 0),
        Err(Error::OutOfBounds { .. })
    ));
    assert!(matches!(
        ctx.memcpy_h2d(ptr, &big, 0),
        Err(Error::OutOfBounds { .. })
    ));

    // Offset plus length crossing the end also fails.
    assert!(matches!(
        ctx.memcpy_h2d(ptr.offset_by(96), &[0u8; 64], 0),
        Err(Error::OutOfBounds { offset: 96, len: 64, size: 128 })
    ));

    // The full range is still fine.
    ctx.memcpy_h2d(ptr, &big[..128], 0).unwrap();
}

#[test]
fn test_d2d_copy_stays_on_device() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let src = ctx.malloc(64, 0).unwrap();
    let dst = ctx.malloc(64, 0).unwrap();
    ctx.memcpy_h2d(src, &[0xABu8; 64], 0).unwrap();

    ctx.memcpy_d2d(dst, src, 64, 0).unwrap();
    ctx.sync().unwrap();

    let mut out = [0u8; 64];
    ctx.memcpy_d2h(&mut out, dst, 0).unwrap();
    assert_eq!(out, [0xABu8; 64]);
}

#[test]
fn test_cross_device_copy_stages_through_host() {
    let (rt, _) = runtime(2);
    let c0 = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let c1 = rt.ctx_create(1, ContextMode::Parallel).unwrap();

    let src = c0.malloc(48, 0).unwrap();
    let dst = c1.malloc(48, 0).unwrap();
    c0.memcpy_h2d(src, &[0x5Au8; 48], 0).unwrap();

    rt.memcpy(dst, src, 48).unwrap();

    let mut out = [0u8; 48];
    c1.memcpy_d2h(&mut out, dst, 0).unwrap();
    assert_eq!(out, [0x5Au8; 48]);
}

// =============================================================================
// Swap
// =============================================================================

#[test]
fn test_swap_exchanges_addresses_not_bytes() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let a = ctx.malloc(32, 0).unwrap();
    let b = ctx.malloc(32, 0).unwrap();
    ctx.memcpy_h2d(a, &[1u8; 32], 0).unwrap();
    ctx.memcpy_h2d(b, &[2u8; 32], 0).unwrap();

    let (AddrState::Resolved(addr_a), _) = ctx.resolve(a).unwrap() else {
        panic!("expected resolved address");
    };
    let (AddrState::Resolved(addr_b), _) = ctx.resolve(b).unwrap() else {
        panic!("expected resolved address");
    };

    ctx.swap(a, b, 0).unwrap();
    ctx.sync().unwrap();

    // The table entries traded addresses; no bytes moved on the device.
    assert_eq!(ctx.resolve(a).unwrap().0, AddrState::Resolved(addr_b));
    assert_eq!(ctx.resolve(b).unwrap().0, AddrState::Resolved(addr_a));

    let mut through_a = [0u8; 32];
    ctx.memcpy_d2h(&mut through_a, a, 0).unwrap();
    assert_eq!(through_a, [2u8; 32]);

    let mut through_b = [0u8; 32];
    ctx.memcpy_d2h(&mut through_b, b, 0).unwrap();
    assert_eq!(through_b, [1u8; 32]);
}

#[test]
fn test_swap_unknown_pointer_fails() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let a = ctx.malloc(8, 0).unwrap();
    let ghost = VirtualPtr::encode(0, 999, 0);
    assert!(matches!(ctx.swap(a, ghost, 0), Err(Error::UnknownVptr(_))));
}

// =============================================================================
// Stream ordering and state
// =============================================================================

#[test]
fn test_stream_drains_in_issue_order() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    // Each write depends on the previous one having landed; the final value
    // is only correct if the queue drained strictly in issue order.
    let ptr = ctx.malloc(8, 0).unwrap();
    for value in 1..=16u64 {
        ctx.memcpy_h2d_async(ptr, &value.to_le_bytes(), 0).unwrap();
    }
    ctx.sync().unwrap();

    let mut out = [0u8; 8];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(u64::from_le_bytes(out), 16);
}

#[test]
fn test_dependent_chain_without_explicit_sync() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    // malloc enqueues alloc+assign; the fill depends on the assign; the read
    // depends on the fill. No sync until the read forces one.
    let ptr = ctx.malloc(64, 0).unwrap();
    ctx.memset_u8(FillDst::Device(ptr), 0x3C, 64, 0).unwrap();

    let mut out = [0u8; 64];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(out, [0x3Cu8; 64]);
}

#[test]
fn test_query_reflects_pending_work() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    ctx.query(0).unwrap();

    let ptr = ctx.malloc(16, 0).unwrap();
    assert!(matches!(ctx.query(0), Err(Error::StreamRunning)));

    ctx.sync().unwrap();
    ctx.query(0).unwrap();
    ctx.free(ptr, 0).unwrap();
}

#[test]
fn test_unknown_stream_index() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    assert_eq!(ctx.stream_count().unwrap(), 1);
    assert!(matches!(ctx.malloc(8, 5), Err(Error::UnknownStream(5))));
}

// =============================================================================
// Fills
// =============================================================================

#[test]
fn test_memset_then_readback_scenario() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    // Allocate 128, fill the first 64 bytes with a 32-bit pattern, read the
    // whole allocation back: pattern then untouched zeros, no errors.
    let ptr = ctx.malloc(128, 0).unwrap();
    ctx.memset_u32(FillDst::Device(ptr), 0xDEAD_BEEF, 16, 0).unwrap();

    let mut out = [0u8; 128];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();

    for chunk in out[..64].chunks_exact(4) {
        assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), 0xDEAD_BEEF);
    }
    assert_eq!(&out[64..], &[0u8; 64]);

    ctx.free(ptr, 0).unwrap();
    ctx.sync().unwrap();
}

#[test]
fn test_memset_widths() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let ptr = ctx.malloc(64, 0).unwrap();

    ctx.memset_u16(FillDst::Device(ptr), 0x1234, 32, 0).unwrap();
    let mut out = [0u8; 64];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(&out[..2], &0x1234u16.to_le_bytes());

    ctx.memset_u64(FillDst::Device(ptr), 0x0102_0304_0506_0708, 8, 0).unwrap();
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(&out[..8], &0x0102_0304_0506_0708u64.to_le_bytes());

    ctx.memset_u128(FillDst::Device(ptr), 0xAAAA, 0xBBBB, 4, 0).unwrap();
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(&out[..8], &0xAAAAu64.to_le_bytes());
    assert_eq!(&out[8..16], &0xBBBBu64.to_le_bytes());
}

#[test]
fn test_memset_2d_respects_pitch() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    // 4 rows of 8 bytes pitch, filling only 4 bytes per row.
    let (ptr, pitch) = ctx.malloc_pitch(8, 4, 1, 0).unwrap();
    assert_eq!(pitch, 8);
    ctx.memset_u8(FillDst::Device(ptr), 0, 32, 0).unwrap();
    ctx.memset2d_u8(FillDst::Device(ptr), pitch, 0xFF, 4, 4, 0).unwrap();

    let mut out = [0u8; 32];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    for row in out.chunks_exact(8) {
        assert_eq!(&row[..4], &[0xFFu8; 4]);
        assert_eq!(&row[4..], &[0u8; 4]);
    }
}

#[test]
fn test_raw_fill_family() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptr = ctx.malloc(32, 0).unwrap();
    ctx.sync().unwrap();

    // Raw fills bypass the device pointer directory entirely.
    let raw = ctx.raw_ptr(ptr).unwrap();
    ctx.memset_u8(FillDst::Raw(raw), 0x77, 32, 0).unwrap();

    let mut out = [0u8; 32];
    ctx.memcpy_d2h(&mut out, ptr, 0).unwrap();
    assert_eq!(out, [0x77u8; 32]);
}

// =============================================================================
// Override
// =============================================================================

#[test]
fn test_override_adopts_existing_allocation() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let original = ctx.malloc(64, 0).unwrap();
    ctx.memcpy_h2d(original, &[0xEEu8; 64], 0).unwrap();

    ctx.set_override(Some(original)).unwrap();
    let adopted = ctx.malloc(64, 0).unwrap();
    assert_eq!(adopted, original);

    // One-shot: the next malloc is a fresh allocation again.
    let fresh = ctx.malloc(64, 0).unwrap();
    assert_ne!(fresh.index(), original.index());
}

#[test]
fn test_override_requires_matching_size() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let original = ctx.malloc(64, 0).unwrap();
    ctx.sync().unwrap();

    ctx.set_override(Some(original)).unwrap();
    assert!(matches!(ctx.malloc(65, 0), Err(Error::InvalidValue(_))));

    // The failed adoption consumed the override.
    let fresh = ctx.malloc(64, 0).unwrap();
    assert_ne!(fresh.index(), original.index());
}

#[test]
fn test_override_can_be_cleared() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let original = ctx.malloc(64, 0).unwrap();
    ctx.set_override(Some(original)).unwrap();
    ctx.set_override(None).unwrap();

    let fresh = ctx.malloc(64, 0).unwrap();
    assert_ne!(fresh.index(), original.index());
}

// =============================================================================
// Context lifecycle
// =============================================================================

#[test]
fn test_destroy_uninitialized_context_fails() {
    let (rt, _) = runtime(1);
    let ctx = rt.device(0).unwrap().ctx().clone();
    assert!(matches!(ctx.destroy(), Err(Error::ContextDestroyed)));
}

#[test]
fn test_double_init_fails() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    assert!(matches!(ctx.init(ContextMode::Scalar), Err(Error::AlreadyActive)));
}

#[test]
fn test_free_after_destroy_is_silent() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let ptr = ctx.malloc(128, 0).unwrap();

    rt.ctx_destroy(&ctx).unwrap();
    assert!(!ctx.is_active());

    // Pending frees for a dead context are dropped, not errors.
    ctx.free(ptr, 0).unwrap();

    // But anything else on a destroyed context is.
    assert!(matches!(ctx.malloc(8, 0), Err(Error::ContextDestroyed)));
    assert!(matches!(ctx.sync(), Err(Error::ContextDestroyed)));
}

#[test]
fn test_reinit_starts_with_fresh_table() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let first = ctx.malloc(8, 0).unwrap();
    let _second = ctx.malloc(8, 0).unwrap();

    rt.ctx_destroy(&ctx).unwrap();
    ctx.init(ContextMode::Parallel).unwrap();

    // Indices restart; the old generation's records are gone.
    let fresh = ctx.malloc(8, 0).unwrap();
    assert_eq!(fresh.index(), first.index());
    assert_eq!(ctx.mem_used().unwrap(), 8);
}

#[test]
fn test_context_modes_shape_stream_count() {
    let config = RuntimeConfig { workers: 4, ..Default::default() };
    let (rt, _) = runtime_with(1, config);

    let ctx = rt.ctx_create(0, ContextMode::Scalar).unwrap();
    assert_eq!(ctx.stream_count().unwrap(), 4);
    assert_eq!(ctx.mode().unwrap(), ContextMode::Scalar);
    rt.ctx_destroy(&ctx).unwrap();

    ctx.init(ContextMode::Parallel).unwrap();
    assert_eq!(ctx.stream_count().unwrap(), 1);
}

#[test]
fn test_scalar_streams_are_independent() {
    let config = RuntimeConfig { workers: 2, ..Default::default() };
    let (rt, _) = runtime_with(1, config);
    let ctx = rt.ctx_create(0, ContextMode::Scalar).unwrap();

    let a = ctx.malloc(16, 0).unwrap();
    let b = ctx.malloc(16, 1).unwrap();
    ctx.memcpy_h2d(a, &[1u8; 16], 0).unwrap();
    ctx.memcpy_h2d(b, &[2u8; 16], 1).unwrap();

    let mut out = [0u8; 16];
    ctx.memcpy_d2h(&mut out, b, 1).unwrap();
    assert_eq!(out, [2u8; 16]);
}

// =============================================================================
// Runtime registry
// =============================================================================

#[test]
fn test_current_context_stack() {
    let (rt, _) = runtime(2);
    assert!(matches!(rt.current(), Err(Error::UnknownContext)));

    let c0 = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let c1 = rt.ctx_create(1, ContextMode::Parallel).unwrap();
    assert!(Arc::ptr_eq(&rt.current().unwrap(), &c1));

    let popped = rt.pop_current().unwrap();
    assert!(Arc::ptr_eq(&popped, &c1));
    assert!(Arc::ptr_eq(&rt.current().unwrap(), &c0));

    rt.set_current(Some(c1.clone()));
    assert!(Arc::ptr_eq(&rt.current().unwrap(), &c1));

    rt.set_current(None);
    assert!(matches!(rt.current(), Err(Error::UnknownContext)));
}

#[test]
fn test_ctx_for_ptr_routes_by_device() {
    let (rt, _) = runtime(2);
    let c0 = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let c1 = rt.ctx_create(1, ContextMode::Parallel).unwrap();

    let p1 = c1.malloc(8, 0).unwrap();
    assert!(Arc::ptr_eq(&rt.ctx_for_ptr(p1).unwrap(), &c1));

    let p0 = c0.malloc(8, 0).unwrap();
    assert!(Arc::ptr_eq(&rt.ctx_for_ptr(p0).unwrap(), &c0));
}

#[test]
fn test_proc_registry_tracks_lifecycle() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let proc = ctx.proc_id().unwrap();
    assert_eq!(rt.device_for_proc(proc).unwrap().id(), 0);

    rt.ctx_destroy(&ctx).unwrap();
    assert!(matches!(rt.device_for_proc(proc), Err(Error::UnknownContext)));
}

#[test]
fn test_module_functions_resolve_from_stdlib() {
    let (rt, _) = runtime(1);
    let ctx = rt.ctx_create(0, ContextMode::Parallel).unwrap();

    let stdlib = ctx.stdlib_module().unwrap();
    let func = ctx.module_function(stdlib, "pulse_mem_size").unwrap();

    // Call it by hand against a live allocation and read the raw result.
    let ptr = ctx.malloc(96, 0).unwrap();
    ctx.sync().unwrap();

    let slot = Arc::new(pulse_core::CallSlot::new());
    ctx.call(func, &[ptr.raw().into()], 0, false, Some(slot.clone())).unwrap();
    ctx.sync().unwrap();
    assert_eq!(slot.get(), 96);

    assert!(matches!(
        ctx.module_function(stdlib, "pulse_mem_defrag"),
        Err(Error::FunctionNotFound(_))
    ));
}

#[test]
fn test_shutdown_tears_down_active_contexts() {
    let (rt, _) = runtime(2);
    let c0 = rt.ctx_create(0, ContextMode::Parallel).unwrap();
    let _c1 = rt.ctx_create(1, ContextMode::Parallel).unwrap();
    c0.malloc(64, 0).unwrap();

    rt.shutdown().unwrap();
    assert!(!c0.is_active());
    assert!(matches!(rt.current(), Err(Error::UnknownContext)));
}
