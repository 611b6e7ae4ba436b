/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Datatypes shared by every subsystem: composite blocks, child headers, and the small
//! newtypes they are made of.

pub mod block;

pub mod data_types;
