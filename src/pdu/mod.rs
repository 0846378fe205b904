// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A module for interpreting byte slices as protocol data units.
//!
//! Only the TCP segment layout is implemented; the enclosing IP packet is the concern of the
//! layer below.

pub mod bytes;
pub mod tcp;
