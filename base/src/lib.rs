// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual-time infrastructure shared by the device models.

mod clock;
mod timer;

pub use clock::Clock;
pub use clock::TimerToken;
pub use timer::Timer;
