// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;

/// A device that can save and restore its guest-visible state.
///
/// Snapshots are structured `serde_json` values so the surrounding
/// save/restore framework can compose, version, and persist them without
/// knowing device internals.
pub trait Suspendable {
    /// Serializes the device state.
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Err(anyhow!("snapshot not supported for {}", std::any::type_name::<Self>()))
    }

    /// Restores the device to the state captured by `snapshot`.
    ///
    /// On error the device state must be left unchanged.
    fn restore(&mut self, _data: serde_json::Value) -> anyhow::Result<()> {
        Err(anyhow!("restore not supported for {}", std::any::type_name::<Self>()))
    }
}
