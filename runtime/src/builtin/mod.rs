// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::network::*;
pub use self::shared::*;
pub use self::singletons::*;

pub mod network;
pub mod reward;
pub mod shared;
pub mod singletons;
