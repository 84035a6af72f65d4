//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::collections::VecDeque;

use log::debug;

use crate::error::RtResult;

//--------------------------------------------------------------------------------------------------

pub type Task = Box<dyn FnOnce() -> RtResult<()>>;

/// Host callbacks deferred until the next `sync`.
#[derive(Default)]
pub struct TaskQueue {
	tasks: RefCell<VecDeque<Task>>,
}

impl TaskQueue {
	pub fn push(&self, task: impl FnOnce() -> RtResult<()> + 'static) {
		self.tasks.borrow_mut().push_back(Box::new(task));
	}

	pub fn len(&self) -> usize {
		self.tasks.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.tasks.borrow().is_empty()
	}

	/// Runs every queued task, including tasks queued by the tasks themselves.
	/// All tasks run even if one fails; the first error is returned.
	pub fn run_all(&self) -> RtResult<()> {
		let mut result = Ok(());
		loop {
			let Some(task) = self.tasks.borrow_mut().pop_front() else {
				break;
			};
			if let Err(err) = task() {
				debug!("deferred task failed: {err}");
				if result.is_ok() {
					result = Err(err);
				}
			}
		}
		result
	}
}

//--------------------------------------------------------------------------------------------------
