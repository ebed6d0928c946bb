// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The shared vocabulary of the Weave application master.
//!
//! Types in this crate are the contract between the client-side launcher,
//! the application master, and the in-container runnable host: run
//! identifiers, the application specification, control messages, the live
//! resource report, and the environment keys through which the pieces find
//! each other.

pub mod env;
pub mod id;
pub mod message;
pub mod node;
pub mod report;
pub mod spec;
