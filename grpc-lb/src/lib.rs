/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Client-side load balancing for gRPC channels.
//!
//! This crate contains the control-plane half of a gRPC client channel's
//! load balancing: LB policies receive resolved addresses from the name
//! resolver, manage one subchannel per address, track each subchannel's
//! connectivity, and publish a [`Picker`] together with an aggregate
//! [`ConnectivityState`] to the channel.  The channel then consults the picker
//! for every RPC.
//!
//! Two policies are provided: [`pick_first`], which keeps a single sticky
//! connection and tries addresses in order, and [`round_robin`], which spreads
//! RPCs across every READY backend.
//!
//! This version is in progress and not recommended for any production use.  All
//! APIs are unstable.  Proceed at your own risk.
//!
//! [`Picker`]: client::load_balancing::Picker
//! [`ConnectivityState`]: client::ConnectivityState
//! [`pick_first`]: client::load_balancing::pick_first
//! [`round_robin`]: client::load_balancing::round_robin

pub mod client;
pub mod status;

pub use status::{Status, StatusCode};
