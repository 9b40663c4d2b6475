// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - instance execution backends.

pub mod mock;
pub mod process;
mod traits;

pub use mock::MockRunner;
pub use process::ProcessRunner;
pub use traits::*;
