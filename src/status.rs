// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a producer loop or of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl From<u8> for RunState {
    fn from(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::Stopped,
            _ => RunState::Idle,
        }
    }
}

/// Run state held in a single atomic.
///
/// Only the transition running -> stopped is contended; it succeeds for
/// exactly one caller per run.
#[derive(Debug)]
pub(crate) struct Status(AtomicU8);

impl Status {
    pub(crate) fn new() -> Self {
        Status(AtomicU8::new(RunState::Idle as u8))
    }

    pub(crate) fn get(&self) -> RunState {
        RunState::from(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn mark_running(&self) {
        self.0.store(RunState::Running as u8, Ordering::Release);
    }

    /// Moves running -> stopped. Returns false if the status was not running.
    pub(crate) fn mark_stopped_if_running(&self) -> bool {
        self.0
            .compare_exchange(
                RunState::Running as u8,
                RunState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
