//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Once;

use log::warn;

//--------------------------------------------------------------------------------------------------

pub const DEFAULT_ASYNC_LEVEL: u32 = 2;
pub const MAX_ASYNC_LEVEL: u32 = 2;
pub const DEFAULT_QUEUE_DEPTH_PER_LEVEL: usize = 16;

/// Settings for a `Runtime` and its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
	/// 0 = fully synchronous. Higher levels allow more requests in flight.
	pub async_level: u32,
	pub swap_enabled: bool,
	pub drop_enabled: bool,
	pub queue_depth_per_level: usize,
	/// stderrlog verbosity: 0 = error, 1 = warn, 2 = info, 3 = debug, 4 = trace.
	pub log_verbosity: usize,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			async_level: DEFAULT_ASYNC_LEVEL,
			swap_enabled: false,
			drop_enabled: false,
			queue_depth_per_level: DEFAULT_QUEUE_DEPTH_PER_LEVEL,
			log_verbosity: 1,
		}
	}
}

impl RuntimeConfig {
	pub fn with_async_level(self, async_level: u32) -> Self {
		Self { async_level, ..self }
	}

	pub fn with_swap(self, swap_enabled: bool) -> Self {
		Self { swap_enabled, ..self }
	}

	pub fn with_drop(self, drop_enabled: bool) -> Self {
		Self { drop_enabled, ..self }
	}

	pub fn with_queue_depth_per_level(self, queue_depth_per_level: usize) -> Self {
		Self { queue_depth_per_level: queue_depth_per_level.max(1), ..self }
	}

	pub fn with_log_verbosity(self, log_verbosity: usize) -> Self {
		Self { log_verbosity, ..self }
	}

	/// Default configuration overridden by `IMPERATIVE_*` environment variables.
	pub fn from_env() -> Self {
		Self::default().apply_vars(|name| std::env::var(name).ok())
	}

	fn apply_vars(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
		if let Some(v) = get("IMPERATIVE_ASYNC_LEVEL") {
			match v.trim().parse::<u32>() {
				Ok(level) if level <= MAX_ASYNC_LEVEL => self.async_level = level,
				_ => warn!("IMPERATIVE_ASYNC_LEVEL: ignoring invalid value {v:?}"),
			}
		}
		if let Some(v) = get("IMPERATIVE_ENABLE_SWAP") {
			match parse_flag(&v) {
				Some(on) => self.swap_enabled = on,
				None => warn!("IMPERATIVE_ENABLE_SWAP: ignoring invalid value {v:?}"),
			}
		}
		if let Some(v) = get("IMPERATIVE_ENABLE_DROP") {
			match parse_flag(&v) {
				Some(on) => self.drop_enabled = on,
				None => warn!("IMPERATIVE_ENABLE_DROP: ignoring invalid value {v:?}"),
			}
		}
		if let Some(v) = get("IMPERATIVE_LOG") {
			match parse_verbosity(&v) {
				Some(verbosity) => self.log_verbosity = verbosity,
				None => warn!("IMPERATIVE_LOG: ignoring invalid value {v:?}"),
			}
		}
		self
	}
}

fn parse_flag(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "on" | "yes" => Some(true),
		"0" | "false" | "off" | "no" | "" => Some(false),
		_ => None,
	}
}

fn parse_verbosity(v: &str) -> Option<usize> {
	let v = v.trim().to_ascii_lowercase();
	match v.as_str() {
		"error" => Some(0),
		"warn" => Some(1),
		"info" => Some(2),
		"debug" => Some(3),
		"trace" => Some(4),
		_ => v.parse().ok(),
	}
}

//--------------------------------------------------------------------------------------------------

static LOGGING: Once = Once::new();

/// Installs the stderr logger. Only the first call has any effect.
pub fn init_logging(verbosity: usize) {
	LOGGING.call_once(|| {
		// another logger may already be installed by the embedding program
		let _ = stderrlog::new().module("imperative").verbosity(verbosity).init();
	});
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> =
			pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
		move |name: &str| map.get(name).cloned()
	}

	#[test]
	fn test_defaults() {
		let config = RuntimeConfig::default();
		assert_eq!(config.async_level, 2);
		assert!(!config.swap_enabled);
		assert!(!config.drop_enabled);
		assert_eq!(config.queue_depth_per_level, 16);
	}

	#[test]
	fn test_env_overrides() {
		let config = RuntimeConfig::default().apply_vars(vars(&[
			("IMPERATIVE_ASYNC_LEVEL", "0"),
			("IMPERATIVE_ENABLE_SWAP", "1"),
			("IMPERATIVE_ENABLE_DROP", "true"),
			("IMPERATIVE_LOG", "debug"),
		]));
		assert_eq!(config.async_level, 0);
		assert!(config.swap_enabled);
		assert!(config.drop_enabled);
		assert_eq!(config.log_verbosity, 3);
	}

	#[test]
	fn test_invalid_env_values_are_ignored() {
		let config = RuntimeConfig::default().apply_vars(vars(&[
			("IMPERATIVE_ASYNC_LEVEL", "7"),
			("IMPERATIVE_ENABLE_SWAP", "maybe"),
			("IMPERATIVE_LOG", "loud"),
		]));
		assert_eq!(config, RuntimeConfig::default());
	}
}
