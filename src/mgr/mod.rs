// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint discovery and the per-role channel registries.
//!
//! Both managers follow the same probation-and-delete discovery scheme:
//! before a scan every registered entry is put on probation; entries seen
//! during the scan are taken off; whatever is still on probation afterwards
//! has disappeared from the filesystem and is dropped. Registries are only
//! mutated between poll cycles - engine callbacks never insert or delete
//! entries.

pub mod guest;
pub mod host;
