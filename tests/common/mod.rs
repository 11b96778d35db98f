/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

pub(crate) mod logging;

pub(crate) mod network;

pub(crate) mod node;
