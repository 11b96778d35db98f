/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the replica and the client.
//!
//! Types specific to a single component can be found in that component's own module, e.g.,
//! [`crate::hotstuff::types`].

pub mod data_types;

pub mod node;

pub mod certificates;

pub mod crypto_primitives;
