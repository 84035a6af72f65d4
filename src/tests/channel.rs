//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_approx_eq::assert_approx_eq;

use super::fakes::{
	CountingKernel, FailingKernel, FakeQueue, PanickingKernel, SlowKernel, ThreadKernel, big_f32,
	value,
};
use crate::channel::{Channel, Tier};
use crate::config::RuntimeConfig;
use crate::dtype::DType;
use crate::error::{RtResult, RuntimeError};
use crate::op::{Elemwise, ElemwiseMode, Kernel, OpDef};
use crate::shape::Shape;
use crate::{ErrPack, Handle};

//--------------------------------------------------------------------------------------------------

fn channel() -> Channel {
	Channel::new(&RuntimeConfig::default()).unwrap()
}

fn channel_with(config: RuntimeConfig) -> Channel {
	Channel::new(&config).unwrap()
}

fn elemwise(mode: ElemwiseMode) -> Arc<dyn Kernel> {
	Arc::new(Elemwise::new(mode))
}

fn apply1(ch: &Channel, kernel: Arc<dyn Kernel>, inputs: &[Handle]) -> RtResult<Handle> {
	let outputs = ch.apply_kernel(kernel, inputs)?;
	assert_eq!(outputs.len(), 1);
	Ok(outputs[0])
}

fn code<T>(r: RtResult<T>) -> Option<RuntimeError> {
	r.err().map(|e| e.code)
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_put_get_round_trip() -> RtResult<()> {
	let ch = channel();
	let small = value(&[3], vec![1_i32, 2, 3]);
	let large = big_f32(0.5);

	let a = ch.put(small.clone(), false)?;
	let b = ch.put(large.clone(), false)?;
	assert_eq!(ch.get_shape(b)?, Shape::new(&[4, 4])?);
	assert_eq!(ch.get_dtype(b)?, DType::F32);
	assert_eq!(ch.get_value(a)?, small);
	assert_eq!(ch.get_value(b)?, large);
	ch.sync()
}

#[test]
fn test_apply_op_executes_in_order() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(big_f32(1.0), false)?;
	let b = ch.put(big_f32(10.0), false)?;
	let sum = apply1(&ch, elemwise(ElemwiseMode::Add), &[a, b])?;
	let neg = apply1(&ch, elemwise(ElemwiseMode::Neg), &[sum])?;

	let out = ch.get_value(neg)?.to_vec::<f32>().unwrap();
	assert_eq!(out.len(), 16);
	assert_approx_eq!(out[0], -11.0, 1e-6);
	assert_approx_eq!(out[15], -41.0, 1e-6);
	assert_eq!(ch.get_shape(neg)?.dims(), &[4, 4]);
	ch.sync()
}

#[test]
fn test_apply_op_rejects_generic_op() {
	struct Nothing;
	impl crate::op::DefaultRule for Nothing {
		fn call(&self, _rt: &crate::Runtime, _args: &[crate::Tensor]) -> RtResult<crate::op::RuleValue> {
			Ok(crate::op::RuleValue::None)
		}
	}
	let ch = channel();
	let a = ch.put(value(&[1], vec![1_i32]), false).unwrap();
	let op = OpDef::generic("nothing", Nothing);
	assert_eq!(code(ch.apply_op(&op, &[a])), Some(RuntimeError::InvalidArgument));
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_failure_poisons_dependents() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(value(&[3], vec![6_i32, 8, 9]), false)?;
	let zero = ch.put(value(&[3], vec![1_i32, 0, 3]), false)?;
	let quot = apply1(&ch, elemwise(ElemwiseMode::Div), &[a, zero])?;
	let next = apply1(&ch, elemwise(ElemwiseMode::Add), &[quot, a])?;
	let last = apply1(&ch, elemwise(ElemwiseMode::Neg), &[next])?;

	let err = ch.get_value(last).err().unwrap();
	assert_eq!(err.code, RuntimeError::ExecutionFailed);
	assert_eq!(err.message(), "integer division by zero");

	let err = ch.get_value(quot).err().unwrap();
	assert_eq!(err.message(), "integer division by zero");
	assert_eq!(code(ch.get_dtype(next)), Some(RuntimeError::ExecutionFailed));

	// already observed through get_value
	ch.sync()?;
	assert_eq!(ch.get_value(a)?.to_vec::<i32>(), Some(vec![6, 8, 9]));
	Ok(())
}

#[test]
fn test_sync_reports_error_once() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(value(&[2], vec![1.0_f32, 2.0]), false)?;
	let bad = apply1(&ch, Arc::new(FailingKernel), &[a])?;
	let _dependent = apply1(&ch, elemwise(ElemwiseMode::Neg), &[bad])?;

	let err = ch.sync().err().unwrap();
	assert_eq!(err.code, RuntimeError::ExecutionFailed);
	assert_eq!(err.message(), "boom");
	ch.sync()?;
	ch.sync()?;

	// the handle itself stays poisoned
	assert_eq!(code(ch.get_value(bad)), Some(RuntimeError::ExecutionFailed));
	Ok(())
}

#[test]
fn test_kernel_panic_poisons_outputs() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(value(&[1], vec![1_u8]), false)?;
	let bad = apply1(&ch, Arc::new(PanickingKernel), &[a])?;
	let err = ch.get_value(bad).err().unwrap();
	assert_eq!(err.code, RuntimeError::ExecutionFailed);
	assert!(err.message().contains("kernel exploded"));

	// the worker survives
	let ok = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	assert!(ch.get_value(ok).is_ok());
	ch.sync()
}

#[test]
fn test_stale_handle_is_rejected() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(value(&[2], vec![1_i64, 2]), false)?;
	ch.del(a);
	ch.sync()?;
	assert_eq!(code(ch.get_value(a)), Some(RuntimeError::InvalidHandle));
	assert_eq!(
		code(ch.apply_kernel(elemwise(ElemwiseMode::Neg), &[a])),
		Some(RuntimeError::InvalidHandle)
	);

	// a new value may reuse the slot but never the handle
	let b = ch.put(value(&[2], vec![3_i64, 4]), false)?;
	assert_ne!(a, b);
	assert_eq!(ch.get_value(b)?.to_vec::<i64>(), Some(vec![3, 4]));
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_drop_ignored_when_disabled() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(big_f32(0.0), false)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	ch.drop(b)?;
	ch.sync()?;
	assert!(ch.is_resident(b));
	assert_approx_eq!(ch.get_value(b)?.to_vec::<f32>().unwrap()[1], -1.0, 1e-6);
	Ok(())
}

#[test]
fn test_dropped_value_is_regenerated() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let a = ch.put(big_f32(1.0), false)?;
	let (kernel, calls) = CountingKernel::new(ElemwiseMode::Relu);
	let b = apply1(&ch, Arc::new(kernel), &[a])?;
	ch.drop(b)?;
	ch.sync()?;
	assert!(!ch.is_resident(b));
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	// layout survives the drop
	assert_eq!(ch.get_shape(b)?.dims(), &[4, 4]);

	let out = ch.get_value(b)?;
	assert_eq!(out, big_f32(1.0));
	assert_eq!(calls.load(Ordering::SeqCst), 2);
	assert!(ch.is_resident(b));
	Ok(())
}

#[test]
fn test_drop_of_admitted_value() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let kept = ch.put(big_f32(0.0), false)?;
	let gone = ch.put(big_f32(0.0), true)?;
	ch.drop(kept)?;
	ch.drop(gone)?;
	ch.sync()?;

	assert_eq!(ch.get_value(kept)?, big_f32(0.0));
	let err = ch.get_value(gone).err().unwrap();
	assert_eq!(err.code, RuntimeError::ValueUnavailable);
	// not an execution failure
	ch.sync()
}

#[test]
fn test_regeneration_needs_live_inputs() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let a = ch.put(big_f32(2.0), true)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	let c = apply1(&ch, elemwise(ElemwiseMode::Neg), &[b])?;
	ch.drop(a)?;
	ch.drop(b)?;
	ch.sync()?;

	// c was computed before its inputs went away
	assert_eq!(ch.get_value(c)?, big_f32(2.0));
	assert_eq!(code(ch.get_value(b)), Some(RuntimeError::ValueUnavailable));

	// consuming b on the worker fails the same way and poisons the output
	let d = apply1(&ch, elemwise(ElemwiseMode::Relu), &[b])?;
	assert_eq!(code(ch.get_value(d)), Some(RuntimeError::ValueUnavailable));
	Ok(())
}

#[test]
fn test_dropped_input_is_regenerated_on_worker() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let a = ch.put(big_f32(1.0), false)?;
	let (kernel, calls) = CountingKernel::new(ElemwiseMode::Neg);
	let b = apply1(&ch, Arc::new(kernel), &[a])?;
	ch.drop(b)?;
	let c = apply1(&ch, elemwise(ElemwiseMode::Neg), &[b])?;
	assert_eq!(ch.get_value(c)?, big_f32(1.0));
	assert_eq!(calls.load(Ordering::SeqCst), 2);
	ch.sync()
}

#[test]
fn test_regeneration_runs_on_worker() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let a = ch.put(big_f32(1.0), false)?;
	let (kernel, threads) = ThreadKernel::new();
	let b = apply1(&ch, Arc::new(kernel), &[a])?;
	ch.drop(b)?;
	ch.sync()?;
	assert!(!ch.is_resident(b));

	assert_eq!(ch.get_value(b)?, big_f32(1.0));
	assert_eq!(ch.in_flight(), 0);
	assert_eq!(*threads.lock(), vec!["imperative-worker".to_string(); 2]);
	ch.sync()
}

#[test]
fn test_regeneration_follows_earlier_requests() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let a = ch.put(big_f32(1.0), false)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	ch.drop(b)?;
	let slow = apply1(&ch, Arc::new(SlowKernel(Duration::from_millis(50))), &[a])?;

	let out = ch.get_value(b)?;
	assert_approx_eq!(out.to_vec::<f32>().unwrap()[0], -1.0, 1e-6);
	// the rebuild was queued behind the slow kernel
	assert!(ch.is_resident(slow));
	ch.sync()
}

#[test]
fn test_failed_regeneration_is_not_reported_by_sync() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true));
	let a = ch.put(big_f32(0.0), true)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Relu), &[a])?;
	ch.drop(a)?;
	ch.drop(b)?;
	ch.sync()?;

	assert_eq!(code(ch.get_value(b)), Some(RuntimeError::ValueUnavailable));
	assert_eq!(code(ch.get_value(b)), Some(RuntimeError::ValueUnavailable));
	ch.sync()
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_flags_are_read_when_requested() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(big_f32(1.0), false)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	// keeps the worker busy while the flags change
	apply1(&ch, Arc::new(SlowKernel(Duration::from_millis(100))), &[a])?;
	ch.drop(b)?;
	ch.swap_out(a)?;
	ch.set_drop_flag(true);
	ch.set_swap_flag(true);
	ch.sync()?;
	assert!(ch.is_resident(b));
	assert_eq!(ch.tier_of(a), Some(Tier::Device));
	Ok(())
}

#[test]
fn test_queued_requests_outlive_flag_changes() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_drop(true).with_swap(true));
	let a = ch.put(big_f32(1.0), false)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	apply1(&ch, Arc::new(SlowKernel(Duration::from_millis(100))), &[a])?;
	ch.drop(b)?;
	ch.swap_out(a)?;
	ch.set_drop_flag(false);
	ch.set_swap_flag(false);
	ch.sync()?;
	assert!(!ch.is_resident(b));
	assert_eq!(ch.tier_of(a), Some(Tier::Host));
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_swap_moves_between_tiers() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_swap(true));
	let a = ch.put(big_f32(0.0), false)?;
	ch.swap_out(a)?;
	ch.sync()?;
	assert_eq!(ch.tier_of(a), Some(Tier::Host));

	// wrong tier is tolerated
	ch.swap_out(a)?;
	ch.sync()?;
	assert_eq!(ch.tier_of(a), Some(Tier::Host));

	assert_eq!(ch.get_value(a)?, big_f32(0.0));
	assert_eq!(ch.tier_of(a), Some(Tier::Host));
	assert_eq!(ch.get_dev_tensor(a)?, big_f32(0.0));
	assert_eq!(ch.tier_of(a), Some(Tier::Device));

	ch.swap_in(a)?;
	ch.sync()?;
	assert_eq!(ch.tier_of(a), Some(Tier::Device));
	Ok(())
}

#[test]
fn test_consuming_swapped_value_swaps_it_in() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_swap(true));
	let a = ch.put(big_f32(3.0), false)?;
	ch.swap_out(a)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Relu), &[a])?;
	assert_eq!(ch.get_value(b)?, big_f32(3.0));
	assert_eq!(ch.tier_of(a), Some(Tier::Device));
	ch.sync()
}

#[test]
fn test_swap_ignored_when_disabled() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(big_f32(0.0), false)?;
	ch.swap_out(a)?;
	ch.sync()?;
	assert_eq!(ch.tier_of(a), Some(Tier::Device));

	ch.set_swap_flag(true);
	assert!(ch.swap_enabled());
	ch.swap_out(a)?;
	ch.sync()?;
	assert_eq!(ch.tier_of(a), Some(Tier::Host));
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_async_level_bounds() -> RtResult<()> {
	let ch = channel();
	assert_eq!(ch.get_async_level(), 2);
	assert_eq!(code(ch.config_async_level(3)), Some(RuntimeError::InvalidArgument));
	assert_eq!(ch.get_async_level(), 2);
	ch.config_async_level(0)?;
	assert_eq!(ch.get_async_level(), 0);

	let bad = Channel::new(&RuntimeConfig::default().with_async_level(9));
	assert_eq!(code(bad), Some(RuntimeError::InvalidArgument));
	Ok(())
}

#[test]
fn test_sync_level_waits_for_each_request() -> RtResult<()> {
	let ch = channel_with(RuntimeConfig::default().with_async_level(0));
	let a = ch.put(big_f32(0.0), false)?;
	assert_eq!(ch.in_flight(), 0);
	let mut last = a;
	for _ in 0..4 {
		last = apply1(&ch, Arc::new(SlowKernel(Duration::from_millis(2))), &[last])?;
		assert_eq!(ch.in_flight(), 0);
		assert!(ch.is_resident(last));
	}
	ch.sync()
}

#[test]
fn test_backpressure_limits_in_flight() -> RtResult<()> {
	let config = RuntimeConfig::default().with_async_level(1).with_queue_depth_per_level(2);
	let ch = channel_with(config);
	let mut last = ch.put(big_f32(0.0), false)?;
	for _ in 0..8 {
		last = apply1(&ch, Arc::new(SlowKernel(Duration::from_millis(2))), &[last])?;
		assert!(ch.in_flight() <= 2);
	}
	assert_eq!(ch.get_value(last)?, big_f32(0.0));
	ch.sync()
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_full_sync_waits_device_queues() -> RtResult<()> {
	let ch = channel();
	let queue = FakeQueue::new(false);
	ch.attach_device_queue(queue.clone());
	let a = ch.put(big_f32(0.0), false)?;
	let _b = apply1(&ch, Arc::new(SlowKernel(Duration::from_millis(5))), &[a])?;
	ch.full_sync()?;
	assert_eq!(ch.in_flight(), 0);
	assert_eq!(queue.waits.load(Ordering::SeqCst), 1);

	ch.sync()?;
	assert_eq!(queue.waits.load(Ordering::SeqCst), 1);
	Ok(())
}

#[test]
fn test_full_sync_reports_queue_failure() {
	let ch = channel();
	let failing = FakeQueue::new(true);
	let healthy = FakeQueue::new(false);
	ch.attach_device_queue(failing.clone());
	ch.attach_device_queue(healthy.clone());
	let err = ch.full_sync().err().unwrap();
	assert_eq!(err.message(), "device queue failed");
	assert_eq!(healthy.waits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_execution_error_wins_over_queue_error() {
	let ch = channel();
	ch.attach_device_queue(FakeQueue::new(true));
	let a = ch.put(value(&[1], vec![1_u8]), false).unwrap();
	let _bad = ch.apply_kernel(Arc::new(FailingKernel), &[a]).unwrap();
	let err: ErrPack<RuntimeError> = ch.full_sync().err().unwrap();
	assert_eq!(err.message(), "boom");
}

#[test]
fn test_del_releases_handles() -> RtResult<()> {
	let ch = channel();
	let a = ch.put(big_f32(0.0), false)?;
	let b = apply1(&ch, elemwise(ElemwiseMode::Neg), &[a])?;
	assert_eq!(ch.live_handle_count(), 2);
	ch.del(a);
	ch.del(b);
	ch.sync()?;
	assert_eq!(ch.live_handle_count(), 0);
	Ok(())
}
