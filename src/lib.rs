/*
 * This file is part of Chassis Manager.
 *
 * Copyright (C) 2025 Chassis Manager contributors
 *
 * Chassis Manager is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Chassis Manager is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Chassis Manager. If not, see <https://www.gnu.org/licenses/>.
 */

//! Chassis - platform manager for switch chassis hardware
//!
//! This library ties the hardware-state core to its outer surfaces: the
//! notification journal and the re-exported core, protocol and error crates.

pub mod journal;

pub use cm_core as core;
pub use cm_error::{ChassisError, Result};
pub use cm_protocol as protocol;
pub use journal::JournalSink;
