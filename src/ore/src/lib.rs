// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Internal utility libraries for Weave.
//!
//! **ore** (n): the raw material from which more valuable materials are
//! extracted. Modules here are meant to be an extension of the Rust standard
//! library and must not depend on other Weave crates.

pub mod now;
pub mod retry;
pub mod task;
